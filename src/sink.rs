use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::thread::{self, JoinHandle};

use crossbeam_channel::Receiver;
use csv::{ReaderBuilder, Terminator, Writer, WriterBuilder};
use tracing::{debug, error, info, warn};

use crate::domain::{DownloadOutcome, PROTEIN_URL_KEY};
use crate::error::HarvestError;

pub const CSV_HEADER: [&str; 8] = [
    "image_file",
    "ensg_id",
    "tissue_or_cancer",
    "antibody",
    "protein_url",
    "image_url",
    "status",
    "extra",
];

#[derive(Debug)]
pub enum SinkMessage {
    Outcome(DownloadOutcome),
    /// Sent once by the orchestrator after every worker has finished.
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Truncate (or create) and write the header.
    Create,
    /// Keep existing rows and their column layout; the header is only written
    /// if the file is empty.
    Append,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkSummary {
    pub rows_written: usize,
    pub failures_dropped: usize,
    pub write_errors: usize,
}

/// Column layout of a non-empty CSV that rows are appended to.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ExistingLayout {
    columns: Vec<String>,
    crlf: bool,
    ends_with_newline: bool,
}

impl ExistingLayout {
    fn read(path: &Path) -> Result<Option<Self>, HarvestError> {
        let layout_err = |message: String| HarvestError::Configuration(format!(
            "cannot append to {}: {message}",
            path.display()
        ));
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(layout_err(err.to_string())),
        };
        if file.metadata().map_err(|err| layout_err(err.to_string()))?.len() == 0 {
            return Ok(None);
        }

        let mut last = [0u8; 1];
        file.seek(SeekFrom::End(-1))
            .and_then(|_| file.read_exact(&mut last))
            .map_err(|err| layout_err(err.to_string()))?;
        file.seek(SeekFrom::Start(0))
            .map_err(|err| layout_err(err.to_string()))?;

        let mut first_line = Vec::new();
        BufReader::new(&mut file)
            .read_until(b'\n', &mut first_line)
            .map_err(|err| layout_err(err.to_string()))?;
        let columns: Vec<String> = ReaderBuilder::new()
            .has_headers(true)
            .from_reader(first_line.as_slice())
            .headers()
            .map_err(|err| layout_err(err.to_string()))?
            .iter()
            .map(|name| name.trim().to_string())
            .collect();
        if !columns.iter().any(|name| name == "ensg_id") {
            return Err(layout_err("header has no ensg_id column".to_string()));
        }

        Ok(Some(Self {
            columns,
            crlf: first_line.ends_with(b"\r\n"),
            ends_with_newline: last[0] == b'\n',
        }))
    }
}

/// The only writer of the output CSV for the duration of a run.
pub struct ResultSink {
    writer: Writer<File>,
    path: String,
    columns: Vec<String>,
    record_failures: bool,
    summary: SinkSummary,
}

impl ResultSink {
    pub fn open(path: &Path, mode: OpenMode, record_failures: bool) -> Result<Self, HarvestError> {
        let open_err = |err: std::io::Error| HarvestError::Write {
            path: path.display().to_string(),
            message: err.to_string(),
        };
        let existing = match mode {
            OpenMode::Create => None,
            OpenMode::Append => ExistingLayout::read(path)?,
        };
        let mut file = match mode {
            OpenMode::Create => File::create(path).map_err(open_err)?,
            OpenMode::Append => OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(open_err)?,
        };

        let (columns, terminator) = match &existing {
            Some(layout) => {
                if !layout.ends_with_newline {
                    warn!(path = %path.display(), "last row was cut off, starting a new line");
                    let newline: &[u8] = if layout.crlf { b"\r\n" } else { b"\n" };
                    file.write_all(newline).map_err(open_err)?;
                }
                let terminator = if layout.crlf {
                    Terminator::CRLF
                } else {
                    Terminator::Any(b'\n')
                };
                (layout.columns.clone(), terminator)
            }
            None => (
                CSV_HEADER.iter().map(|name| name.to_string()).collect(),
                Terminator::Any(b'\n'),
            ),
        };
        let has_status = columns.iter().any(|name| name == "status");
        if record_failures && !has_status {
            info!(path = %path.display(), "existing output has no status column, failed downloads will not be recorded");
        }

        let writer = WriterBuilder::new()
            .has_headers(false)
            .terminator(terminator)
            .from_writer(file);
        let mut sink = Self {
            writer,
            path: path.display().to_string(),
            columns,
            record_failures: record_failures && has_status,
            summary: SinkSummary::default(),
        };
        if existing.is_none() {
            let header = sink.columns.clone();
            sink.write_record(&header[..])?;
        }
        Ok(sink)
    }

    /// Appends one outcome. Returns `false` when the outcome was a failure and
    /// failures are not recorded.
    pub fn write(&mut self, outcome: &DownloadOutcome) -> Result<bool, HarvestError> {
        if !outcome.succeeded && !self.record_failures {
            self.summary.failures_dropped += 1;
            return Ok(false);
        }
        let row = outcome_row(outcome)?;
        let projected: Vec<&str> = self
            .columns
            .iter()
            .map(|column| {
                CSV_HEADER
                    .iter()
                    .position(|name| *name == column.as_str())
                    .map_or("", |index| row[index].as_str())
            })
            .collect();
        self.write_record(&projected[..])?;
        self.summary.rows_written += 1;
        Ok(true)
    }

    pub fn summary(&self) -> SinkSummary {
        self.summary
    }

    /// Drains `receiver` until the shutdown sentinel arrives.
    pub fn run(mut self, receiver: Receiver<SinkMessage>) -> SinkSummary {
        let mut got_shutdown = false;
        for message in receiver.iter() {
            match message {
                SinkMessage::Outcome(outcome) => {
                    if let Err(err) = self.write(&outcome) {
                        self.summary.write_errors += 1;
                        error!(
                            gene = %outcome.task.gene_id(),
                            error = %err,
                            "failed to record outcome"
                        );
                    }
                }
                SinkMessage::Shutdown => {
                    got_shutdown = true;
                    break;
                }
            }
        }
        if !got_shutdown {
            warn!(path = %self.path, "result queue closed without shutdown signal");
        }
        if let Err(err) = self.writer.flush() {
            self.summary.write_errors += 1;
            error!(path = %self.path, error = %err, "final flush failed");
        }
        debug!(rows = self.summary.rows_written, "result sink stopped");
        self.summary
    }

    pub fn spawn(self, receiver: Receiver<SinkMessage>) -> Result<JoinHandle<SinkSummary>, HarvestError> {
        thread::Builder::new()
            .name("result-sink".to_string())
            .spawn(move || self.run(receiver))
            .map_err(|err| HarvestError::Sink(err.to_string()))
    }

    fn write_record(&mut self, record: &[impl AsRef<[u8]>]) -> Result<(), HarvestError> {
        let write_err = |message: String| HarvestError::Write {
            path: self.path.clone(),
            message,
        };
        self.writer
            .write_record(record)
            .map_err(|err| write_err(err.to_string()))?;
        self.writer
            .flush()
            .map_err(|err| write_err(err.to_string()))
    }
}

fn outcome_row(outcome: &DownloadOutcome) -> Result<[String; 8], HarvestError> {
    let task = &outcome.task;
    let extra = task
        .extra_metadata()
        .iter()
        .filter(|(key, _)| key.as_str() != PROTEIN_URL_KEY)
        .collect::<std::collections::BTreeMap<_, _>>();
    let extra = if extra.is_empty() {
        String::new()
    } else {
        serde_json::to_string(&extra).map_err(|err| HarvestError::Sink(err.to_string()))?
    };
    Ok([
        task.output_file_name().to_string(),
        task.gene_id().to_string(),
        task.tissue_or_category().to_string(),
        task.antibody_id().to_string(),
        task.protein_url().unwrap_or_default().to_string(),
        task.image_url().to_string(),
        outcome.status().to_string(),
        extra,
    ])
}
