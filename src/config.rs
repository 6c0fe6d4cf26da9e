use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::HarvestError;

pub const CONFIG_FILE_NAME: &str = "hpasubc-dl.json";
pub const DEFAULT_API_BASE_URL: &str = "http://138.197.13.129/hpasubc/api_v1";
pub const DEFAULT_HPA_VERSION: u32 = 18;
pub const MIN_WORKERS: usize = 3;
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 10;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 1_000;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub api_base_url: Option<String>,
    #[serde(default)]
    pub hpa_version: Option<u32>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub retry_attempts: Option<u32>,
    #[serde(default)]
    pub retry_backoff_ms: Option<u64>,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
    #[serde(default)]
    pub record_failures: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_RETRY_ATTEMPTS,
            backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub source: Option<Utf8PathBuf>,
    pub api_base_url: String,
    pub hpa_version: u32,
    pub workers: usize,
    pub retry: RetryPolicy,
    pub request_timeout: Duration,
    pub record_failures: bool,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            schema_version: 1,
            source: None,
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            hpa_version: DEFAULT_HPA_VERSION,
            workers: MIN_WORKERS,
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            record_failures: false,
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Resolves the explicit path, then `hpasubc-dl.json` in the working
    /// directory, then the per-user config file. Falls back to defaults when no
    /// file is found; an explicit path that cannot be read is an error.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, HarvestError> {
        let config_path = match path {
            Some(path) => Some(PathBuf::from(path)),
            None => Self::discover(),
        };

        let Some(config_path) = config_path else {
            return Ok(ResolvedConfig::default());
        };

        let content = fs::read_to_string(&config_path)
            .map_err(|_| HarvestError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| HarvestError::ConfigParse(err.to_string()))?;

        let mut resolved = Self::resolve_config(config)?;
        resolved.source = Utf8PathBuf::from_path_buf(config_path).ok();
        Ok(resolved)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, HarvestError> {
        let defaults = ResolvedConfig::default();

        let workers = match config.workers {
            Some(workers) => clamp_workers(workers)?,
            None => defaults.workers,
        };

        let retry_attempts = config.retry_attempts.unwrap_or(DEFAULT_RETRY_ATTEMPTS);
        if retry_attempts == 0 {
            return Err(HarvestError::Configuration(
                "retry_attempts must be at least 1".to_string(),
            ));
        }

        let api_base_url = config
            .api_base_url
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or(defaults.api_base_url);
        if api_base_url.is_empty() {
            return Err(HarvestError::Configuration(
                "api_base_url must not be empty".to_string(),
            ));
        }

        Ok(ResolvedConfig {
            schema_version: config.schema_version.unwrap_or(1),
            source: None,
            api_base_url,
            hpa_version: config.hpa_version.unwrap_or(DEFAULT_HPA_VERSION),
            workers,
            retry: RetryPolicy {
                attempts: retry_attempts,
                backoff: Duration::from_millis(
                    config.retry_backoff_ms.unwrap_or(DEFAULT_RETRY_BACKOFF_MS),
                ),
            },
            request_timeout: Duration::from_secs(
                config
                    .request_timeout_secs
                    .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
            ),
            record_failures: config.record_failures.unwrap_or(false),
        })
    }

    fn discover() -> Option<PathBuf> {
        let local = PathBuf::from(CONFIG_FILE_NAME);
        if local.exists() {
            return Some(local);
        }
        ProjectDirs::from("org", "hpasubc", "hpasubc-dl")
            .map(|dirs| dirs.config_dir().join("config.json"))
            .filter(|path| path.exists())
    }
}

/// Worker counts below the minimum are raised to it; zero is rejected.
pub fn clamp_workers(requested: usize) -> Result<usize, HarvestError> {
    if requested == 0 {
        return Err(HarvestError::InvalidWorkerCount(requested));
    }
    Ok(requested.max(MIN_WORKERS))
}
