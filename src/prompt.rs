use std::io;
use std::path::Path;
use std::time::Duration;

use clap::ValueEnum;
use crossterm::ExecutableCommand;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::Alignment;
use ratatui::text::Line;
use ratatui::widgets::{Block, Borders, Paragraph, Wrap};
use serde::Serialize;

use crate::error::HarvestError;
use crate::task_source::ExistingImagePolicy;

/// How to treat an output CSV that already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ExistingOutputDecision {
    /// Truncate and start over.
    Overwrite,
    /// Skip genes already recorded in the file.
    Resume,
    /// Keep the file and add rows without skipping anything.
    Append,
    /// Stop without doing any work.
    Quit,
}

/// The decisions a run needs from the user before any work starts.
pub trait Prompt {
    fn existing_output(&self, path: &Path) -> Result<ExistingOutputDecision, HarvestError>;

    fn existing_images(&self, count: usize) -> Result<ExistingImagePolicy, HarvestError>;
}

/// Answers fixed up front, for non-interactive runs.
#[derive(Debug, Clone, Copy)]
pub struct FixedAnswers {
    pub on_existing: ExistingOutputDecision,
    pub existing_images: ExistingImagePolicy,
}

impl Default for FixedAnswers {
    fn default() -> Self {
        Self {
            on_existing: ExistingOutputDecision::Resume,
            existing_images: ExistingImagePolicy::Skip,
        }
    }
}

impl Prompt for FixedAnswers {
    fn existing_output(&self, _path: &Path) -> Result<ExistingOutputDecision, HarvestError> {
        Ok(self.on_existing)
    }

    fn existing_images(&self, _count: usize) -> Result<ExistingImagePolicy, HarvestError> {
        Ok(self.existing_images)
    }
}

/// Full-screen yes/no questions on the terminal.
#[derive(Debug, Default)]
pub struct TerminalPrompt;

impl TerminalPrompt {
    pub fn new() -> Self {
        Self
    }

    /// Asks a yes/no question. Enter picks `default`, Esc answers no.
    pub fn confirm(&self, context: &str, question: &str, default: bool) -> Result<bool, HarvestError> {
        enable_raw_mode().map_err(prompt_err)?;
        let answer = Self::ask_loop(context, question, default);
        let restored = disable_raw_mode()
            .and_then(|_| io::stdout().execute(LeaveAlternateScreen).map(|_| ()));
        let answer = answer?;
        restored.map_err(prompt_err)?;
        Ok(answer)
    }

    fn ask_loop(context: &str, question: &str, default: bool) -> Result<bool, HarvestError> {
        let mut stdout = io::stdout();
        stdout.execute(EnterAlternateScreen).map_err(prompt_err)?;
        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend).map_err(prompt_err)?;
        let hint = if default {
            "[Y/n]  (Enter accepts the default)"
        } else {
            "[y/N]  (Enter accepts the default)"
        };

        loop {
            terminal
                .draw(|frame| {
                    let block = Block::default().borders(Borders::ALL).title("hpasubc-dl");
                    let text = Paragraph::new(vec![
                        Line::from(context.to_string()),
                        Line::from(""),
                        Line::from(question.to_string()),
                        Line::from(hint),
                    ])
                    .alignment(Alignment::Center)
                    .wrap(Wrap { trim: true })
                    .block(block);
                    frame.render_widget(text, frame.area());
                })
                .map_err(prompt_err)?;

            if event::poll(Duration::from_millis(100)).map_err(prompt_err)? {
                if let Event::Key(key) = event::read().map_err(prompt_err)? {
                    if let Some(answer) = answer_for_key(key, default) {
                        return answer;
                    }
                }
            }
        }
    }
}

/// Maps a key press to an answer; `None` keeps waiting. Ctrl-C aborts.
fn answer_for_key(key: KeyEvent, default: bool) -> Option<Result<bool, HarvestError>> {
    if key.kind != KeyEventKind::Press {
        return None;
    }
    match key.code {
        KeyCode::Char('c') | KeyCode::Char('C') if key.modifiers.contains(KeyModifiers::CONTROL) => {
            Some(Err(HarvestError::Interrupted))
        }
        KeyCode::Char('y') | KeyCode::Char('Y') => Some(Ok(true)),
        KeyCode::Char('n') | KeyCode::Char('N') | KeyCode::Esc => Some(Ok(false)),
        KeyCode::Enter => Some(Ok(default)),
        _ => None,
    }
}

impl Prompt for TerminalPrompt {
    fn existing_output(&self, path: &Path) -> Result<ExistingOutputDecision, HarvestError> {
        let context = format!("The output file {} exists.", path.display());
        if self.confirm(&context, "Overwrite?", false)? {
            return Ok(ExistingOutputDecision::Overwrite);
        }
        if self.confirm(&context, "Try to resume?", true)? {
            return Ok(ExistingOutputDecision::Resume);
        }
        if self.confirm(&context, "Append the file (or n to quit)?", true)? {
            return Ok(ExistingOutputDecision::Append);
        }
        Ok(ExistingOutputDecision::Quit)
    }

    fn existing_images(&self, count: usize) -> Result<ExistingImagePolicy, HarvestError> {
        let context = format!("{count} image(s) already exist in the output directory.");
        if self.confirm(&context, "Skip them?", true)? {
            Ok(ExistingImagePolicy::Skip)
        } else {
            Ok(ExistingImagePolicy::Overwrite)
        }
    }
}

fn prompt_err(err: io::Error) -> HarvestError {
    HarvestError::Prompt(err.to_string())
}
