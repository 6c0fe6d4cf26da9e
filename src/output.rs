use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;

use crate::app::{ProgressEvent, ProgressSink, RunReport};

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_report(report: &RunReport) -> io::Result<()> {
        Self::print_json(report)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Human-readable progress on stderr.
#[derive(Debug, Default)]
pub struct ConsoleOutput {
    total: AtomicUsize,
    done: AtomicUsize,
}

impl ConsoleOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn print_report(report: &RunReport) -> io::Result<()> {
        let mut out = io::stdout();
        if report.quit() {
            writeln!(out, "ok. exiting without changes to {}", report.output_file)?;
            return Ok(());
        }
        writeln!(out, "genes requested:   {}", report.requested)?;
        writeln!(out, "genes skipped:     {}", report.skipped)?;
        writeln!(out, "genes queued:      {}", report.queued)?;
        writeln!(
            out,
            "images:            {} found, {} already on disk",
            report.images_found, report.images_skipped_existing
        )?;
        writeln!(out, "images downloaded: {}", report.succeeded)?;
        writeln!(out, "rows written:      {} -> {}", report.rows_written, report.output_file)?;
        if report.errors > 0 {
            writeln!(
                out,
                "{} error(s), see {} for details",
                report.errors, report.log_file
            )?;
        } else {
            writeln!(out, "no errors")?;
        }
        if report.interrupted {
            writeln!(out, "run was interrupted; rerun with resume to continue")?;
        }
        Ok(())
    }
}

impl ProgressSink for ConsoleOutput {
    fn event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Planned {
                requested,
                skipped,
                queued,
                images,
            } => {
                self.total.store(images, Ordering::SeqCst);
                eprintln!(
                    "{requested} gene(s) requested, {skipped} skipped, {queued} queued, {images} image(s) to download"
                );
            }
            ProgressEvent::Started { .. } => {}
            ProgressEvent::Finished { gene, file, .. } => {
                let done = self.done.fetch_add(1, Ordering::SeqCst) + 1;
                let total = self.total.load(Ordering::SeqCst);
                eprintln!("[{done}/{total}] {gene} {file}");
            }
            ProgressEvent::Failed { gene, url, .. } => {
                let done = self.done.fetch_add(1, Ordering::SeqCst) + 1;
                let total = self.total.load(Ordering::SeqCst);
                eprintln!("[{done}/{total}] {gene} {url} FAILED");
            }
            ProgressEvent::Completed { .. } => {}
        }
    }
}
