use crate::config::FeedConfig;
use crate::feed::FeedError;
use anyhow::{Context, Result};
use reqwest::StatusCode;
use std::time::Duration;
use tokio_retry::RetryIf;
use tokio_retry::strategy::{ExponentialBackoff, jitter};
use tracing::{debug, warn};

pub struct HttpClient {
    inner: reqwest::Client,
    max_retries: usize,
    retry_base_ms: u64,
}

impl HttpClient {
    pub fn new(config: &FeedConfig) -> Result<Self> {
        let inner = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_secs))
            .gzip(true)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            inner,
            max_retries: config.max_retries as usize,
            retry_base_ms: config.retry_base_ms,
        })
    }

    /// Fetch a URL as text, retrying transient failures with exponential
    /// backoff and jitter. Non-retryable statuses (plain 4xx) fail at once.
    pub async fn get_text(&self, url: &str) -> Result<String, FeedError> {
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(self.retry_base_ms)
            .max_delay(Duration::from_secs(30))
            .map(jitter)
            .take(self.max_retries);

        RetryIf::spawn(strategy, || self.get_once(url), |e: &FeedError| {
            let retry = is_retryable(e);
            if retry {
                warn!("Transient feed error, will retry: {}", e);
            }
            retry
        })
        .await
    }

    async fn get_once(&self, url: &str) -> Result<String, FeedError> {
        debug!("GET {}", url);

        let resp = self.inner.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FeedError::Status(status));
        }
        Ok(resp.text().await?)
    }
}

fn is_retryable(err: &FeedError) -> bool {
    match err {
        FeedError::Http(_) => true,
        FeedError::Status(s) => s.is_server_error() || *s == StatusCode::TOO_MANY_REQUESTS,
        FeedError::Envelope(_) => false,
    }
}
