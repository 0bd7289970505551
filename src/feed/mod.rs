pub mod cleaner;
pub mod http_client;

use crate::config::FeedConfig;
use crate::models::{FeedEnvelope, FeedRecord};
use anyhow::{Context, Result};
use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use self::http_client::HttpClient;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Terminal fetch failures. Any of these aborts the whole ingestion run;
/// there is nothing to process without a usable payload.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("feed request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("feed returned HTTP {0}")]
    Status(reqwest::StatusCode),

    #[error("malformed feed envelope: {0}")]
    Envelope(String),
}

// ── Source trait ──────────────────────────────────────────────────────────────

/// Swappable price feed abstraction.
#[async_trait]
pub trait PriceFeed: Send + Sync {
    /// Fetch the complete current record set, across however many pages the
    /// provider needs.
    async fn fetch_records(&self) -> Result<Vec<FeedRecord>, FeedError>;
}

// ── data.gov.in client ────────────────────────────────────────────────────────

pub struct DataGovClient {
    client: HttpClient,
    endpoint: Url,
    api_key: String,
    state_filter: String,
    page_size: usize,
    max_pages: u32,
}

impl DataGovClient {
    pub fn new(config: &FeedConfig, target_state: &str) -> Result<Self> {
        let endpoint = Url::parse(config.base_url.trim_end_matches('/'))
            .with_context(|| format!("invalid feed base_url {:?}", config.base_url))?;

        Ok(Self {
            client: HttpClient::new(config)?,
            endpoint,
            api_key: config.api_key.clone(),
            state_filter: target_state.to_string(),
            page_size: config.page_size.max(1),
            max_pages: config.max_pages.max(1),
        })
    }

    fn page_url(&self, offset: usize) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("api-key", &self.api_key)
            .append_pair("format", "json")
            .append_pair("offset", &offset.to_string())
            .append_pair("limit", &self.page_size.to_string())
            // Server-side narrowing only; the pipeline re-filters locally and
            // never trusts the provider to have applied this.
            .append_pair("filters[state.keyword]", &self.state_filter);
        url
    }

    fn parse_page(&self, body: &str) -> Result<FeedEnvelope, FeedError> {
        let envelope: FeedEnvelope = serde_json::from_str(body)
            .map_err(|e| FeedError::Envelope(format!("invalid JSON payload: {e}")))?;
        if envelope.records.is_none() {
            return Err(FeedError::Envelope("missing records array".to_string()));
        }
        Ok(envelope)
    }
}

#[async_trait]
impl PriceFeed for DataGovClient {
    async fn fetch_records(&self) -> Result<Vec<FeedRecord>, FeedError> {
        let mut all_records = Vec::new();
        let mut offset = 0usize;

        for page in 1..=self.max_pages {
            let url = self.page_url(offset);
            info!("Fetching feed page {} (offset {})", page, offset);

            let body = self.client.get_text(url.as_str()).await?;
            let envelope = self.parse_page(&body)?;
            if page == 1 {
                if let Some(total) = envelope.total {
                    debug!("Feed reports {} total records", total);
                }
            }
            let records = envelope.records.unwrap_or_default();

            let n = records.len();
            debug!("  Page {}: {} records", page, n);
            all_records.extend(records);

            if n < self.page_size {
                break;
            }
            offset += self.page_size;

            if page == self.max_pages {
                warn!("Reached page limit ({}), stopping", self.max_pages);
            }
        }

        info!("Total records fetched: {}", all_records.len());
        Ok(all_records)
    }
}
