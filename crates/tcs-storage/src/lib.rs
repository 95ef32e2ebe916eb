//! Source payload fetching + tournament persistence gateways.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use tcs_core::{RawPayload, SourceConfig};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info_span, warn, Instrument};

mod gateway;
mod postgres;

pub use gateway::{MemoryGateway, PersistenceError, PersistenceGateway, TournamentLookup};
pub use postgres::PgGateway;

pub const CRATE_NAME: &str = "tcs-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Total attempts per fetch, the first one included. Zero still makes one attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// Whether a retryable failure of attempt `attempt_index` (0-based) earns another try.
    pub fn allows_another_attempt(&self, attempt_index: u32) -> bool {
        attempt_index.saturating_add(1) < self.max_retries
    }

    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt_index).unwrap_or(u32::MAX);
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
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Why the last attempt at a source failed.
#[derive(Debug, Error)]
pub enum FetchFailure {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("no payload fixture under {0}")]
    MissingFixture(String),
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
#[error("fetching source {source_id} failed: {last_error}")]
pub struct FetchError {
    pub source_id: String,
    #[source]
    pub last_error: FetchFailure,
}

/// Retrieves one source's raw payload; no knowledge of tournament semantics.
#[async_trait]
pub trait PayloadFetcher: Send + Sync {
    async fn fetch(&self, source: &SourceConfig) -> Result<RawPayload, FetchError>;
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
    backoff: BackoffPolicy,
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
            timeout: config.timeout,
            backoff: config.backoff,
        })
    }

    async fn fetch_with_retries(&self, source: &SourceConfig) -> Result<RawPayload, FetchError> {
        let timeout = source
            .fetch_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.timeout);

        let mut attempt = 0u32;
        loop {
            let (disposition, failure) =
                match self.client.get(&source.url).timeout(timeout).send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        let final_url = resp.url().to_string();

                        if status.is_success() {
                            let content_type = resp
                                .headers()
                                .get(CONTENT_TYPE)
                                .and_then(|v| v.to_str().ok())
                                .map(ToString::to_string);
                            match resp.bytes().await {
                                Ok(body) => {
                                    debug!(attempt, bytes = body.len(), "fetched payload");
                                    return Ok(RawPayload {
                                        source_id: source.source_id.clone(),
                                        url: final_url,
                                        content_type,
                                        body: body.to_vec(),
                                        fetched_at: Utc::now(),
                                    });
                                }
                                Err(err) => {
                                    (classify_reqwest_error(&err), FetchFailure::Request(err))
                                }
                            }
                        } else {
                            (
                                classify_status(status),
                                FetchFailure::HttpStatus {
                                    status: status.as_u16(),
                                    url: final_url,
                                },
                            )
                        }
                    }
                    Err(err) => (classify_reqwest_error(&err), FetchFailure::Request(err)),
                };

            if disposition == RetryDisposition::Retryable
                && self.backoff.allows_another_attempt(attempt)
            {
                let delay = self.backoff.delay_for_attempt(attempt);
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %failure,
                    "fetch attempt failed; backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }

            return Err(FetchError {
                source_id: source.source_id.clone(),
                last_error: failure,
            });
        }
    }
}

#[async_trait]
impl PayloadFetcher for HttpFetcher {
    async fn fetch(&self, source: &SourceConfig) -> Result<RawPayload, FetchError> {
        let span = info_span!("http_fetch", source_id = %source.source_id, url = %source.url);
        self.fetch_with_retries(source).instrument(span).await
    }
}

/// Serves `<root>/<source_id>/payload.{html,json}` in place of the network.
#[derive(Debug, Clone)]
pub struct DirectoryFetcher {
    root: PathBuf,
}

const FIXTURE_CANDIDATES: [(&str, &str); 2] = [
    ("payload.html", "text/html"),
    ("payload.json", "application/json"),
];

impl DirectoryFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl PayloadFetcher for DirectoryFetcher {
    async fn fetch(&self, source: &SourceConfig) -> Result<RawPayload, FetchError> {
        let dir = self.root.join(&source.source_id);
        let fail = |last_error| FetchError {
            source_id: source.source_id.clone(),
            last_error,
        };

        for (file_name, content_type) in FIXTURE_CANDIDATES {
            let path = dir.join(file_name);
            let exists = fs::try_exists(&path).await.map_err(|err| {
                fail(FetchFailure::Io {
                    path: path.display().to_string(),
                    source: err,
                })
            })?;
            if !exists {
                continue;
            }
            let body = fs::read(&path).await.map_err(|err| {
                fail(FetchFailure::Io {
                    path: path.display().to_string(),
                    source: err,
                })
            })?;
            return Ok(RawPayload {
                source_id: source.source_id.clone(),
                url: source.url.clone(),
                content_type: Some(content_type.to_string()),
                body,
                fetched_at: Utc::now(),
            });
        }

        Err(fail(FetchFailure::MissingFixture(dir.display().to_string())))
    }
}
