use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing::{Level, warn};

use crate::error::HarvestError;

pub const LOG_FILE_NAME: &str = "log.txt";

#[derive(Debug)]
enum JournalMessage {
    Entry { level: Level, message: String },
    Shutdown,
}

/// Cloneable handle used by workers to append to the error log.
#[derive(Debug, Clone)]
pub struct JournalHandle {
    sender: Sender<JournalMessage>,
}

impl JournalHandle {
    pub fn error(&self, message: impl Into<String>) {
        self.record(Level::ERROR, message.into());
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.record(Level::WARN, message.into());
    }

    fn record(&self, level: Level, message: String) {
        if self
            .sender
            .send(JournalMessage::Entry { level, message })
            .is_err()
        {
            warn!("error journal is closed, dropping entry");
        }
    }
}

/// Append-only `timestamp LEVEL  message` log, written by a single thread.
pub struct ErrorJournal {
    handle: JournalHandle,
    worker: JoinHandle<usize>,
}

impl ErrorJournal {
    pub fn open(path: &Path) -> Result<Self, HarvestError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|err| HarvestError::Write {
                path: path.display().to_string(),
                message: err.to_string(),
            })?;
        let (sender, receiver) = unbounded();
        let worker = thread::Builder::new()
            .name("error-journal".to_string())
            .spawn(move || drain(BufWriter::new(file), receiver))
            .map_err(|err| HarvestError::Sink(err.to_string()))?;
        Ok(Self {
            handle: JournalHandle { sender },
            worker,
        })
    }

    pub fn handle(&self) -> JournalHandle {
        self.handle.clone()
    }

    /// Stops the writer thread and returns the number of entries written.
    pub fn close(self) -> usize {
        let _ = self.handle.sender.send(JournalMessage::Shutdown);
        self.worker.join().unwrap_or_else(|_| {
            warn!("error journal thread panicked");
            0
        })
    }
}

fn drain(mut file: BufWriter<File>, receiver: Receiver<JournalMessage>) -> usize {
    let mut written = 0;
    for message in receiver.iter() {
        match message {
            JournalMessage::Entry { level, message } => {
                let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
                let line = format!("{timestamp} {level}  {message}\n");
                match file.write_all(line.as_bytes()).and_then(|_| file.flush()) {
                    Ok(()) => written += 1,
                    Err(err) => warn!(error = %err, "failed to append to error journal"),
                }
            }
            JournalMessage::Shutdown => break,
        }
    }
    written
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn entries_are_appended_with_level() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join(LOG_FILE_NAME);
        fs::write(&path, "2014-11-08 10:00:00 ERROR  earlier run\n").unwrap();

        let journal = ErrorJournal::open(&path).unwrap();
        let handle = journal.handle();
        handle.error("G2 http://example.org/images/1/G2.jpg boom");
        handle.warn("appending without resume");
        assert_eq!(journal.close(), 2);

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].ends_with("ERROR  G2 http://example.org/images/1/G2.jpg boom"));
        assert!(lines[2].contains(" WARN  appending without resume"));
    }
}
