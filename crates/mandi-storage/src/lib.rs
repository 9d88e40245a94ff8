//! Archive persistence, run locking and HTTP fetch utilities for the mandi archive.

use std::time::Duration;

use anyhow::Context;
use reqwest::{StatusCode, Url};
use thiserror::Error;
use tracing::{info_span, warn, Instrument};

pub mod archive;
pub mod codec;
pub mod error;
pub mod lock;
pub mod mirror;
pub mod partition;

pub use archive::{
    write_atomic, ArchiveRecords, ArchiveStore, Manifest, MirrorEntry, PartitionEntry,
    StagedPartition, StagingArea, MANIFEST_SCHEMA_VERSION,
};
pub use codec::CodecError;
pub use error::StoreError;
pub use lock::{LockError, LockHolder, LockOptions, RunLockGuard};
pub use partition::{verify_partition, PartitionReader, PartitionStats, PartitionWriter};

pub const CRATE_NAME: &str = "mandi-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    Unauthorized,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        RetryDisposition::Unauthorized
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let shift = u32::try_from(attempt_index).unwrap_or(u32::MAX);
        let factor = 1u32.checked_shl(shift).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
    pub attempts: usize,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed after {attempts} attempt(s): {source}")]
    Request {
        url: String,
        attempts: usize,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url} after {attempts} attempt(s)")]
    HttpStatus {
        status: u16,
        url: String,
        attempts: usize,
    },
    #[error("upstream refused credentials (http {status}) for {url}")]
    Unauthorized { status: u16, url: String },
}

impl FetchError {
    /// Whether the failure class is one that retrying could have fixed.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Request { source, .. } => {
                classify_reqwest_error(source) == RetryDisposition::Retryable
            }
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(|s| classify_status(s) == RetryDisposition::Retryable)
                .unwrap_or(false),
            FetchError::Unauthorized { .. } => false,
        }
    }
}

/// Replaces credential-bearing query values so URLs can be logged.
pub fn redact_url(url: &Url) -> String {
    let mut redacted = url.clone();
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            let value = if k.eq_ignore_ascii_case("api-key") || k.eq_ignore_ascii_case("api_key") {
                "***".to_string()
            } else {
                v.into_owned()
            };
            (k.into_owned(), value)
        })
        .collect();
    if pairs.is_empty() {
        return redacted.to_string();
    }
    redacted.query_pairs_mut().clear().extend_pairs(pairs);
    redacted.to_string()
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    /// GET `url`, retrying transient failures with exponential backoff.
    pub async fn fetch_bytes(&self, url: &Url) -> Result<FetchedResponse, FetchError> {
        let display_url = redact_url(url);
        let span = info_span!("http_fetch", url = %display_url);
        self.fetch_with_retries(url, display_url).instrument(span).await
    }

    async fn fetch_with_retries(
        &self,
        url: &Url,
        display_url: String,
    ) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            let attempts = attempt + 1;
            let can_retry = attempt < self.backoff.max_retries;

            let err = match self.client.get(url.clone()).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let status = resp.status();
                    match resp.bytes().await {
                        Ok(body) => {
                            return Ok(FetchedResponse {
                                status,
                                body: body.to_vec(),
                                attempts,
                            })
                        }
                        Err(err) => FetchError::Request {
                            url: display_url.clone(),
                            attempts,
                            source: err.without_url(),
                        },
                    }
                }
                Ok(resp) => {
                    let status = resp.status();
                    if classify_status(status) == RetryDisposition::Unauthorized {
                        return Err(FetchError::Unauthorized {
                            status: status.as_u16(),
                            url: display_url,
                        });
                    }
                    FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: display_url.clone(),
                        attempts,
                    }
                }
                Err(err) => FetchError::Request {
                    url: display_url.clone(),
                    attempts,
                    source: err.without_url(),
                },
            };

            if !(err.is_transient() && can_retry) {
                return Err(err);
            }

            let delay = self.backoff.delay_for_attempt(attempt);
            warn!(attempt = attempts, delay_ms = delay.as_millis() as u64, error = %err, "transient fetch failure, retrying");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(200), Duration::from_millis(350));
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), RetryDisposition::Unauthorized);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
    }

    #[test]
    fn api_key_is_redacted() {
        let url = Url::parse_with_params(
            "https://api.data.gov.in/resource/abc",
            &[("api-key", "secret"), ("format", "json")],
        )
        .unwrap();
        let shown = redact_url(&url);
        assert!(!shown.contains("secret"));
        assert!(shown.contains("format=json"));
    }
}
