use std::collections::BTreeSet;
use std::path::PathBuf;

use crossbeam_channel::unbounded;
use serde::Serialize;
use tracing::{info, warn};

use crate::cancel::CancellationToken;
use crate::catalog::{ImageCatalog, validate_tissue};
use crate::domain::GeneId;
use crate::error::HarvestError;
use crate::fetch::Fetcher;
use crate::fs_util::{ensure_dir, ensure_writable};
use crate::journal::{ErrorJournal, LOG_FILE_NAME};
use crate::ledger::ProgressLedger;
use crate::pool::{PoolSummary, RunContext, WorkerPool};
use crate::prompt::{ExistingOutputDecision, Prompt};
use crate::sink::{OpenMode, ResultSink, SinkSummary};
use crate::stamp::MetadataStamper;
use crate::task_source::{ExistingImagePolicy, TaskSource, read_gene_list};

pub use crate::pool::{ProgressEvent, ProgressSink};

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub input: PathBuf,
    pub output_csv: PathBuf,
    pub tissue: String,
    pub output_dir: PathBuf,
    pub workers: usize,
    pub record_failures: bool,
    pub check_tissue: bool,
    /// Overrides the prompt for an existing output CSV.
    pub on_existing: Option<ExistingOutputDecision>,
    /// Overrides the prompt for images already on disk.
    pub existing_images: Option<ExistingImagePolicy>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub requested: usize,
    pub skipped: usize,
    pub queued: usize,
    pub images_found: usize,
    pub images_skipped_existing: usize,
    pub succeeded: usize,
    pub errors: usize,
    pub rows_written: usize,
    pub interrupted: bool,
    pub on_existing: Option<ExistingOutputDecision>,
    pub output_file: String,
    pub log_file: String,
}

impl RunReport {
    /// True when the run stopped at the existing-output prompt.
    pub fn quit(&self) -> bool {
        self.on_existing == Some(ExistingOutputDecision::Quit)
    }
}

pub struct App<C: ImageCatalog, F: Fetcher, S: MetadataStamper> {
    catalog: C,
    fetcher: F,
    stamper: S,
    cancel: CancellationToken,
}

impl<C: ImageCatalog, F: Fetcher, S: MetadataStamper> App<C, F, S> {
    pub fn new(catalog: C, fetcher: F, stamper: S) -> Self {
        Self {
            catalog,
            fetcher,
            stamper,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Validates the run, asks the pending questions, downloads every queued
    /// image and returns the final counts. Per-task failures never make this
    /// return an error.
    pub fn run(
        &self,
        options: &RunOptions,
        prompt: &dyn Prompt,
        sink: &dyn ProgressSink,
    ) -> Result<RunReport, HarvestError> {
        let pool = WorkerPool::new(options.workers, &options.output_dir)?;
        ensure_dir(&options.output_dir)?;
        ensure_writable(&options.output_csv)?;
        if options.check_tissue {
            let known = self.catalog.tissues()?;
            validate_tissue(&options.tissue, &known)?;
        }
        let requested = read_gene_list(&options.input)?;
        let log_path = options.output_dir.join(LOG_FILE_NAME);

        let mut report = RunReport {
            requested: requested.len(),
            output_file: options.output_csv.display().to_string(),
            log_file: log_path.display().to_string(),
            ..RunReport::default()
        };

        let mut skip = BTreeSet::<GeneId>::new();
        let mut mode = OpenMode::Create;
        if options.output_csv.is_file() {
            let decision = match options.on_existing {
                Some(decision) => decision,
                None => prompt.existing_output(&options.output_csv)?,
            };
            report.on_existing = Some(decision);
            match decision {
                ExistingOutputDecision::Overwrite => {}
                ExistingOutputDecision::Resume => {
                    let ledger = ProgressLedger::read(&options.output_csv)?;
                    if let Some(gene) = ledger.in_flight() {
                        info!(gene = %gene, "last recorded gene will be downloaded again");
                    }
                    skip = ledger.skip_set();
                    mode = OpenMode::Append;
                }
                ExistingOutputDecision::Append => mode = OpenMode::Append,
                ExistingOutputDecision::Quit => {
                    info!(path = %options.output_csv.display(), "existing output kept, nothing done");
                    return Ok(report);
                }
            }
        }

        let mut plan = TaskSource::new(&self.catalog).plan(requested, &options.tissue, &skip)?;
        let existing = plan.existing_outputs(&options.output_dir).len();
        if existing > 0 {
            let policy = match options.existing_images {
                Some(policy) => policy,
                None => prompt.existing_images(existing)?,
            };
            plan.apply_existing_policy(&options.output_dir, policy);
        }
        report.skipped = plan.skipped.len();
        report.queued = plan.queued_genes.len();
        report.images_found = plan.images_found;
        report.images_skipped_existing = plan.images_skipped_existing;
        info!(
            requested = report.requested,
            skipped = report.skipped,
            queued = report.queued,
            images = plan.tasks.len(),
            "task plan ready"
        );
        sink.event(ProgressEvent::Planned {
            requested: report.requested,
            skipped: report.skipped,
            queued: report.queued,
            images: plan.tasks.len(),
        });

        let journal = ErrorJournal::open(&log_path)?;
        if report.on_existing == Some(ExistingOutputDecision::Append) {
            let message = format!(
                "appending to {} without resume, genes already recorded will be duplicated",
                options.output_csv.display()
            );
            warn!("{message}");
            journal.handle().warn(message);
        }
        for rejected in &plan.rejected {
            journal.handle().error(format!(
                "{} {} {}",
                rejected.ensg_id, rejected.image_url, rejected.reason
            ));
        }
        if plan.is_empty() {
            info!("nothing to do");
        }

        let result_sink = match ResultSink::open(&options.output_csv, mode, options.record_failures) {
            Ok(result_sink) => result_sink,
            Err(err) => {
                journal.close();
                return Err(err);
            }
        };
        let (results_tx, results_rx) = unbounded();
        let sink_thread = match result_sink.spawn(results_rx) {
            Ok(handle) => handle,
            Err(err) => {
                journal.close();
                return Err(err);
            }
        };
        let context = RunContext::new(results_tx, journal.handle(), self.cancel.clone());

        let pooled = pool.run(plan.tasks, &self.fetcher, &self.stamper, &context, sink);

        let shutdown = context.shutdown_sink();
        let sink_summary = sink_thread.join().unwrap_or_else(|_| {
            warn!("result sink thread panicked");
            SinkSummary::default()
        });
        let errors = context.error_count();
        drop(context);
        journal.close();
        shutdown?;
        let pool_summary: PoolSummary = pooled?;

        report.succeeded = pool_summary.succeeded;
        report.errors = errors + plan.rejected.len();
        report.rows_written = sink_summary.rows_written;
        report.interrupted = self.cancel.is_cancelled();
        if sink_summary.write_errors > 0 {
            warn!(count = sink_summary.write_errors, "some outcomes could not be recorded");
        }
        info!(
            succeeded = report.succeeded,
            errors = report.errors,
            log = %report.log_file,
            "run finished"
        );
        sink.event(ProgressEvent::Completed {
            errors: report.errors,
            interrupted: report.interrupted,
        });
        Ok(report)
    }
}
