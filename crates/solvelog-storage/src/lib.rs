//! Status-page HTTP fetch utilities + submission store for solvelog.

use std::time::Duration;

use anyhow::Context;
use reqwest::{header, StatusCode};
use thiserror::Error;
use tracing::{info_span, warn, Instrument};
use url::Url;

pub mod store;

pub use store::{
    save_in_batches, DedupFailurePolicy, DuplicateFilter, MemoryFaults, MemoryStore, PgStore,
    RecordWriter, SaveReport, StoreError, SubmissionStore, UserDirectory, WritePolicy,
};

pub const CRATE_NAME: &str = "solvelog-storage";

/// Desktop browser identity; the judge turns away obvious non-browser clients.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

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
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Bound on a single request, connect through body.
    pub timeout: Duration,
    pub user_agent: String,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Fetches per-user status pages from the judge.
///
/// Holds no concurrency limit of its own: callers gate it with their
/// semaphore so one permit covers a user's fetch and extraction.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    base_url: Url,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(base_url: Url, config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            base_url,
            backoff: config.backoff,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// `{base}/status?user_id={username}`, keeping any path prefix on the base.
    pub fn status_page_url(&self, username: &str) -> Url {
        let mut url = self.base_url.clone();
        let path = format!("{}/status", self.base_url.path().trim_end_matches('/'));
        url.set_path(&path);
        url.set_query(None);
        url.query_pairs_mut().append_pair("user_id", username);
        url
    }

    /// Soft-failure fetch: any error is logged and reported as `None`.
    pub async fn fetch(&self, username: &str) -> Option<String> {
        match self.try_fetch(username).await {
            Ok(html) => Some(html),
            Err(err) => {
                warn!(username, error = %err, "status page fetch failed; user contributes no records");
                None
            }
        }
    }

    pub async fn try_fetch(&self, username: &str) -> Result<String, FetchError> {
        let url = self.status_page_url(username);
        let span = info_span!("http_fetch", username, url = %url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: Url) -> Result<String, FetchError> {
        let mut attempt = 0;
        loop {
            let retries_left = attempt < self.backoff.max_retries;
            let resp_result = self
                .client
                .get(url.clone())
                .header(header::ACCEPT, "text/html,application/xhtml+xml")
                .send()
                .await;

            let err = match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp.text().await?);
                    }
                    let disposition = classify_status(status);
                    let err = FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: resp.url().to_string(),
                    };
                    if !retries_left || disposition == RetryDisposition::NonRetryable {
                        return Err(err);
                    }
                    err
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    if !retries_left || disposition == RetryDisposition::NonRetryable {
                        return Err(FetchError::Request(err));
                    }
                    FetchError::Request(err)
                }
            };

            let delay = self.backoff.delay_for_attempt(attempt);
            warn!(attempt, error = %err, ?delay, "retryable fetch failure; backing off");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
