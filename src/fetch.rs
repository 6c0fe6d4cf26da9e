use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use tracing::debug;

use crate::config::RetryPolicy;
use crate::error::HarvestError;

pub trait Fetcher: Send + Sync {
    /// One attempt at retrieving the bytes behind `url`.
    fn fetch(&self, url: &str) -> Result<Vec<u8>, HarvestError>;
}

pub fn user_agent_headers() -> Result<HeaderMap, HarvestError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&format!("hpasubc-dl/{}", env!("CARGO_PKG_VERSION")))
            .map_err(|err| HarvestError::Configuration(err.to_string()))?,
    );
    Ok(headers)
}

#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, HarvestError> {
        let client = Client::builder()
            .default_headers(user_agent_headers()?)
            .timeout(timeout)
            .build()
            .map_err(|err| HarvestError::Configuration(err.to_string()))?;
        Ok(Self { client })
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, HarvestError> {
        let response = self.client.get(url).send().map_err(|err| HarvestError::Fetch {
            url: url.to_string(),
            attempts: 1,
            message: err.to_string(),
        })?;
        if !response.status().is_success() {
            return Err(HarvestError::FetchStatus {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        let bytes = response.bytes().map_err(|err| HarvestError::Fetch {
            url: url.to_string(),
            attempts: 1,
            message: err.to_string(),
        })?;
        Ok(bytes.to_vec())
    }
}

/// Wraps a fetcher with a fixed-delay retry loop.
///
/// Every failure is retried the same way, whatever its cause. Intermediate
/// failures are only logged at debug level; the last one is returned as
/// [`HarvestError::Fetch`] carrying the attempt count.
pub struct RetryingFetcher<F> {
    inner: F,
    policy: RetryPolicy,
}

impl<F: Fetcher> RetryingFetcher<F> {
    pub fn new(inner: F, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

impl<F: Fetcher> Fetcher for RetryingFetcher<F> {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, HarvestError> {
        let attempts = self.policy.attempts.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.inner.fetch(url) {
                Ok(bytes) => return Ok(bytes),
                Err(err) if attempt < attempts => {
                    debug!(url, attempt, error = %err, "fetch failed, retrying");
                    thread::sleep(self.policy.backoff);
                }
                Err(err) => {
                    let message = match err {
                        HarvestError::Fetch { message, .. } => message,
                        other => other.to_string(),
                    };
                    return Err(HarvestError::Fetch {
                        url: url.to_string(),
                        attempts: attempt,
                        message,
                    });
                }
            }
        }
    }
}
