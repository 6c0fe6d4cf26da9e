use std::io::{self, IsTerminal};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use miette::IntoDiagnostic;
use tracing::info;
use tracing_subscriber::EnvFilter;

use hpasubc_harvest::app::{App, RunOptions, RunReport};
use hpasubc_harvest::cancel::{CancellationToken, INTERRUPTED_EXIT_CODE, install_interrupt_handler};
use hpasubc_harvest::catalog::{HpaSubcClient, ImageCatalog, ImageListFile};
use hpasubc_harvest::config::{ConfigLoader, ResolvedConfig, clamp_workers};
use hpasubc_harvest::error::HarvestError;
use hpasubc_harvest::fetch::{HttpFetcher, RetryingFetcher};
use hpasubc_harvest::output::{ConsoleOutput, JsonOutput, OutputMode};
use hpasubc_harvest::prompt::{ExistingOutputDecision, FixedAnswers, TerminalPrompt};
use hpasubc_harvest::stamp::StampFormat;
use hpasubc_harvest::task_source::ExistingImagePolicy;

#[derive(Parser)]
#[command(name = "hpasubc-dl")]
#[command(about = "Download Human Protein Atlas images for a list of genes and one tissue")]
#[command(version, author)]
struct Cli {
    /// Text file with one Ensembl gene id per line.
    input: PathBuf,

    /// CSV file recording every downloaded image.
    output_csv: PathBuf,

    /// Tissue or cancer name, e.g. "heart muscle".
    tissue: String,

    /// Directory the images are written to.
    output_dir: PathBuf,

    /// Number of download workers (minimum 3).
    workers: Option<usize>,

    #[arg(long)]
    config: Option<String>,

    #[arg(long)]
    hpa_version: Option<u32>,

    #[arg(long)]
    api_url: Option<String>,

    /// Read images from a local CSV instead of the HPASubC API.
    #[arg(long, value_name = "CSV")]
    image_list: Option<PathBuf>,

    #[arg(long, value_enum)]
    on_existing: Option<ExistingOutputDecision>,

    #[arg(long, value_enum)]
    existing_images: Option<ExistingImagePolicy>,

    /// Where image provenance is stored.
    #[arg(long, value_enum, default_value_t = StampFormat::Exif)]
    stamp: StampFormat,

    /// Also write failed downloads to the CSV with status "failed".
    #[arg(long)]
    record_failures: bool,

    #[arg(long)]
    retries: Option<u32>,

    #[arg(long)]
    backoff_ms: Option<u64>,

    #[arg(long)]
    timeout_secs: Option<u64>,

    #[arg(long)]
    skip_tissue_check: bool,

    #[arg(long)]
    non_interactive: bool,
}

fn main() -> ExitCode {
    match run() {
        Ok(report) if report.interrupted => ExitCode::from(INTERRUPTED_EXIT_CODE as u8),
        Ok(_) => ExitCode::SUCCESS,
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(err) = report.downcast_ref::<HarvestError>() {
                return ExitCode::from(map_exit_code(err));
            }
            ExitCode::from(1)
        }
    }
}

fn map_exit_code(error: &HarvestError) -> u8 {
    match error {
        HarvestError::Configuration(_)
        | HarvestError::InvalidWorkerCount(_)
        | HarvestError::UnknownTissue { .. }
        | HarvestError::ConfigRead(_)
        | HarvestError::ConfigParse(_) => 2,
        HarvestError::TaskSource(_)
        | HarvestError::InvalidGeneId(_)
        | HarvestError::InvalidImageUrl(_)
        | HarvestError::Ledger { .. } => 2,
        HarvestError::CatalogHttp(_) | HarvestError::CatalogStatus { .. } => 3,
        HarvestError::Interrupted => INTERRUPTED_EXIT_CODE as u8,
        _ => 1,
    }
}

fn run() -> miette::Result<RunReport> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.non_interactive || !io::stdin().is_terminal() {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };

    let mut config = ConfigLoader::resolve(cli.config.as_deref())?;
    apply_overrides(&mut config, &cli)?;
    if let Some(source) = &config.source {
        info!(config = %source, "loaded configuration");
    }

    let cancel = CancellationToken::new();
    install_interrupt_handler(cancel.clone())?;

    let options = RunOptions {
        input: cli.input.clone(),
        output_csv: cli.output_csv.clone(),
        tissue: cli.tissue.clone(),
        output_dir: cli.output_dir.clone(),
        workers: config.workers,
        record_failures: config.record_failures,
        check_tissue: !cli.skip_tissue_check,
        on_existing: cli.on_existing,
        existing_images: cli.existing_images,
    };

    let report = match &cli.image_list {
        Some(path) => {
            let catalog = ImageListFile::open(path)?;
            execute(catalog, &config, &options, cli.stamp, output_mode, cancel)?
        }
        None => {
            let catalog = HpaSubcClient::new(
                &config.api_base_url,
                config.hpa_version,
                config.request_timeout,
            )?;
            execute(catalog, &config, &options, cli.stamp, output_mode, cancel)?
        }
    };

    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_report(&report).into_diagnostic()?,
        OutputMode::Interactive => ConsoleOutput::print_report(&report).into_diagnostic()?,
    }
    Ok(report)
}

fn apply_overrides(config: &mut ResolvedConfig, cli: &Cli) -> Result<(), HarvestError> {
    if let Some(workers) = cli.workers {
        config.workers = clamp_workers(workers)?;
    }
    if let Some(version) = cli.hpa_version {
        config.hpa_version = version;
    }
    if let Some(url) = &cli.api_url {
        config.api_base_url = url.trim_end_matches('/').to_string();
    }
    if let Some(retries) = cli.retries {
        if retries == 0 {
            return Err(HarvestError::Configuration(
                "--retries must be at least 1".to_string(),
            ));
        }
        config.retry.attempts = retries;
    }
    if let Some(backoff) = cli.backoff_ms {
        config.retry.backoff = Duration::from_millis(backoff);
    }
    if let Some(timeout) = cli.timeout_secs {
        config.request_timeout = Duration::from_secs(timeout);
    }
    if cli.record_failures {
        config.record_failures = true;
    }
    Ok(())
}

fn execute<C: ImageCatalog>(
    catalog: C,
    config: &ResolvedConfig,
    options: &RunOptions,
    stamp: StampFormat,
    output_mode: OutputMode,
    cancel: CancellationToken,
) -> Result<RunReport, HarvestError> {
    let fetcher = RetryingFetcher::new(HttpFetcher::new(config.request_timeout)?, config.retry);
    let app = App::new(catalog, fetcher, stamp.stamper()).with_cancellation(cancel);
    match output_mode {
        OutputMode::NonInteractive => {
            let answers = FixedAnswers {
                on_existing: options.on_existing.unwrap_or(ExistingOutputDecision::Resume),
                existing_images: options.existing_images.unwrap_or(ExistingImagePolicy::Skip),
            };
            app.run(options, &answers, &JsonOutput)
        }
        OutputMode::Interactive => app.run(options, &TerminalPrompt::new(), &ConsoleOutput::new()),
    }
}
