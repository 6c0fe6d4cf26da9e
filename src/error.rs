use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum HarvestError {
    #[error("fetch failed for {url} after {attempts} attempt(s): {message}")]
    Fetch {
        url: String,
        attempts: u32,
        message: String,
    },

    #[error("server returned status {status} for {url}")]
    FetchStatus { url: String, status: u16 },

    #[error("failed to write {path}: {message}")]
    Write { path: String, message: String },

    #[error("failed to stamp metadata onto {path}: {message}")]
    Stamp { path: String, message: String },

    #[error("invalid input list: {0}")]
    #[diagnostic(help("the input file must contain one gene id per line"))]
    TaskSource(String),

    #[error("invalid gene id: {0:?}")]
    #[diagnostic(help("gene ids may only contain letters, digits, '.', '_' and '-'"))]
    InvalidGeneId(String),

    #[error("invalid image url: {0}")]
    InvalidImageUrl(String),

    #[error("failed to read progress ledger at {path}: {message}")]
    Ledger { path: String, message: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("worker count must be a positive integer, got {0}")]
    InvalidWorkerCount(usize),

    #[error("unknown tissue {tissue:?}")]
    #[diagnostic(help("valid tissues are: {valid}"))]
    UnknownTissue { tissue: String, valid: String },

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("image catalog request failed: {0}")]
    CatalogHttp(String),

    #[error("image catalog returned status {status}: {message}")]
    CatalogStatus { status: u16, message: String },

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("result sink stopped unexpectedly: {0}")]
    Sink(String),

    #[error("interrupted")]
    Interrupted,

    #[error("terminal prompt failed: {0}")]
    #[diagnostic(help("pass --on-existing and --existing-images to run without prompts"))]
    Prompt(String),
}
