use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing::{error, info, warn};

use crate::cancel::CancellationToken;
use crate::config::clamp_workers;
use crate::domain::{DownloadOutcome, DownloadTask};
use crate::error::HarvestError;
use crate::fetch::Fetcher;
use crate::fs_util::write_bytes_atomic;
use crate::journal::JournalHandle;
use crate::sink::SinkMessage;
use crate::stamp::MetadataStamper;

#[derive(Debug, Clone)]
pub enum ProgressEvent {
    Planned {
        requested: usize,
        skipped: usize,
        queued: usize,
        images: usize,
    },
    Started { gene: String, url: String },
    Finished { gene: String, file: String, metadata_stamped: bool },
    Failed { gene: String, url: String, error: String },
    Completed { errors: usize, interrupted: bool },
}

pub trait ProgressSink: Send + Sync {
    fn event(&self, event: ProgressEvent);
}

/// Shared state for one run: the result queue, the error counter, the error
/// journal and the cancellation signal. Owned by the orchestrator and lent to
/// the workers.
pub struct RunContext {
    results: Sender<SinkMessage>,
    journal: JournalHandle,
    cancel: CancellationToken,
    errors: AtomicUsize,
}

impl RunContext {
    pub fn new(
        results: Sender<SinkMessage>,
        journal: JournalHandle,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            results,
            journal,
            cancel,
            errors: AtomicUsize::new(0),
        }
    }

    pub fn error_count(&self) -> usize {
        self.errors.load(Ordering::SeqCst)
    }

    /// Sends the shutdown sentinel to the result sink.
    pub fn shutdown_sink(&self) -> Result<(), HarvestError> {
        self.results
            .send(SinkMessage::Shutdown)
            .map_err(|err| HarvestError::Sink(err.to_string()))
    }

    fn record_error(&self, task: &DownloadTask, err: &HarvestError) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        error!(
            gene = %task.gene_id(),
            url = task.image_url(),
            error = %err,
            "task failed"
        );
        self.journal
            .error(format!("{} {} {}", task.gene_id(), task.image_url(), err));
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolSummary {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub not_started: usize,
}

pub struct WorkerPool {
    workers: usize,
    output_dir: PathBuf,
}

impl WorkerPool {
    pub fn new(workers: usize, output_dir: impl Into<PathBuf>) -> Result<Self, HarvestError> {
        Ok(Self {
            workers: clamp_workers(workers)?,
            output_dir: output_dir.into(),
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Processes every task on exactly one worker and returns once all
    /// workers have pushed their last outcome. Stops handing out tasks when
    /// the run is cancelled.
    pub fn run<F, S>(
        &self,
        tasks: Vec<DownloadTask>,
        fetcher: &F,
        stamper: &S,
        context: &RunContext,
        progress: &dyn ProgressSink,
    ) -> Result<PoolSummary, HarvestError>
    where
        F: Fetcher + ?Sized,
        S: MetadataStamper + ?Sized,
    {
        let total = tasks.len();
        let (task_tx, task_rx) = unbounded::<DownloadTask>();
        for task in tasks {
            task_tx
                .send(task)
                .map_err(|err| HarvestError::Sink(err.to_string()))?;
        }
        drop(task_tx);

        info!(workers = self.workers, tasks = total, "starting worker pool");
        let summaries = thread::scope(|scope| {
            let mut handles = Vec::with_capacity(self.workers);
            for index in 0..self.workers {
                let worker = Worker {
                    output_dir: &self.output_dir,
                    fetcher,
                    stamper,
                    context,
                    progress,
                };
                let queue = task_rx.clone();
                let handle = thread::Builder::new()
                    .name(format!("worker-{index}"))
                    .spawn_scoped(scope, move || worker.run(queue))
                    .map_err(|err| HarvestError::Configuration(err.to_string()))?;
                handles.push(handle);
            }
            let mut summaries = Vec::with_capacity(handles.len());
            for handle in handles {
                match handle.join() {
                    Ok(summary) => summaries.push(summary),
                    Err(_) => error!("worker thread panicked"),
                }
            }
            Ok::<_, HarvestError>(summaries)
        })?;

        let mut summary = summaries
            .into_iter()
            .fold(PoolSummary::default(), |acc, item| PoolSummary {
                processed: acc.processed + item.processed,
                succeeded: acc.succeeded + item.succeeded,
                failed: acc.failed + item.failed,
                not_started: 0,
            });
        summary.not_started = task_rx.try_iter().count();
        if summary.not_started > 0 {
            warn!(remaining = summary.not_started, "run cancelled before all tasks started");
        }
        Ok(summary)
    }
}

struct Worker<'a, F: ?Sized, S: ?Sized> {
    output_dir: &'a Path,
    fetcher: &'a F,
    stamper: &'a S,
    context: &'a RunContext,
    progress: &'a dyn ProgressSink,
}

impl<F: Fetcher + ?Sized, S: MetadataStamper + ?Sized> Worker<'_, F, S> {
    fn run(self, queue: Receiver<DownloadTask>) -> PoolSummary {
        let mut summary = PoolSummary::default();
        loop {
            if self.context.cancel.is_cancelled() {
                break;
            }
            let Ok(task) = queue.recv() else {
                break;
            };
            let outcome = self.process(task);
            summary.processed += 1;
            if outcome.succeeded {
                summary.succeeded += 1;
            } else {
                summary.failed += 1;
            }
            if self
                .context
                .results
                .send(SinkMessage::Outcome(outcome))
                .is_err()
            {
                error!("result sink is gone, outcome lost");
            }
        }
        summary
    }

    fn process(&self, task: DownloadTask) -> DownloadOutcome {
        self.progress.event(ProgressEvent::Started {
            gene: task.gene_id().to_string(),
            url: task.image_url().to_string(),
        });

        let path = self.output_dir.join(task.output_file_name());
        let written = self
            .fetcher
            .fetch(task.image_url())
            .and_then(|bytes| write_bytes_atomic(&path, &bytes));
        if let Err(err) = written {
            self.context.record_error(&task, &err);
            self.progress.event(ProgressEvent::Failed {
                gene: task.gene_id().to_string(),
                url: task.image_url().to_string(),
                error: err.to_string(),
            });
            return DownloadOutcome::failed(task, &err);
        }

        let outcome = match self.stamper.stamp(&path, &task.provenance()) {
            Ok(()) => DownloadOutcome::completed(task),
            Err(err) => {
                self.context.record_error(&task, &err);
                DownloadOutcome::missing_metadata(task, &err)
            }
        };
        self.progress.event(ProgressEvent::Finished {
            gene: outcome.task.gene_id().to_string(),
            file: outcome.task.output_file_name().to_string(),
            metadata_stamped: outcome.metadata_stamped,
        });
        outcome
    }
}
