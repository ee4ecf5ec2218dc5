//! REST client for reading reference tables from the remote API.
//!
//! The API exposes each table as a paginated `GET` collection: every page
//! returns a batch of records plus an opaque `offset` token that is echoed
//! back on the next request until the collection is exhausted.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::Config;

use super::FetchError;

// ============================================================================
// Constants
// ============================================================================

/// HTTP request timeout in seconds.
/// 30s allows for slow API responses while failing fast enough for good UX.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum attempts for a single page fetch or insert.
/// Covers network errors, 5xx responses, 429s and request timeouts.
const MAX_FETCH_ATTEMPTS: u32 = 3;

/// Base backoff delay in milliseconds; the actual delay is this value
/// multiplied by the attempt number.
const RETRY_BASE_DELAY_MS: u64 = 500;

/// Delay between page requests to stay under the upstream rate limit.
const PAGE_DELAY_MS: u64 = 150;

/// Backoff before retry `attempt` (1-based).
fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_millis(RETRY_BASE_DELAY_MS * attempt as u64)
}

// ============================================================================
// Trait seam
// ============================================================================

/// Remote table operations needed by the cache layer.
///
/// The refresh coordinator and facade depend on this trait rather than on
/// `TableClient` directly so tests can substitute a fake.
#[async_trait]
pub trait RemoteTables: Send + Sync {
    /// Fetch the full, deduplicated, ascending-sorted list of distinct
    /// non-empty values of `field` across all rows of `table`.
    async fn fetch_all_values(&self, table: &str, field: &str) -> Result<Vec<String>, FetchError>;

    /// Create one record in `table` with `field` set to `value`.
    async fn insert_value(&self, table: &str, field: &str, value: &str)
        -> Result<(), FetchError>;
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct PageResponse {
    #[serde(default)]
    records: Vec<TableRecord>,
    offset: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TableRecord {
    #[serde(default)]
    fields: serde_json::Map<String, Value>,
}

/// Extract `field` from each record into `out`, skipping empty/absent values.
/// The API stores some numeric columns without quoting, so numbers are
/// coerced to their string form.
fn collect_field_values(records: &[TableRecord], field: &str, out: &mut BTreeSet<String>) {
    for record in records {
        match record.fields.get(field) {
            Some(Value::String(s)) if !s.trim().is_empty() => {
                out.insert(s.clone());
            }
            Some(Value::Number(n)) => {
                out.insert(n.to_string());
            }
            _ => {}
        }
    }
}

// ============================================================================
// Client
// ============================================================================

/// REST client for one remote base.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct TableClient {
    client: Client,
    base_url: String,
    base_id: String,
    token: Arc<String>,
}

impl TableClient {
    pub fn new(config: &Config) -> Result<Self> {
        if config.api_token.is_empty() {
            anyhow::bail!("API token is not configured");
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            base_id: config.base_id.clone(),
            token: Arc::new(config.api_token.clone()),
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/{}/{}", self.base_url, self.base_id, table)
    }

    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, FetchError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(FetchError::from_status(status, &body))
        }
    }

    async fn try_get_page(
        &self,
        table: &str,
        offset: Option<&str>,
    ) -> Result<PageResponse, FetchError> {
        let url = self.table_url(table);
        let mut request = self.client.get(&url).bearer_auth(self.token.as_str());
        if let Some(off) = offset {
            request = request.query(&[("offset", off)]);
        }

        let response = request.send().await?;
        let response = Self::check_response(response).await?;

        response
            .json::<PageResponse>()
            .await
            .map_err(|e| FetchError::Permanent(format!("invalid response from {}: {}", url, e)))
    }

    /// Fetch one page, retrying transient failures with backoff.
    async fn get_page(&self, table: &str, offset: Option<&str>) -> Result<PageResponse, FetchError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.try_get_page(table, offset).await {
                Ok(page) => return Ok(page),
                Err(e) if e.is_retryable() && attempt < MAX_FETCH_ATTEMPTS => {
                    let delay = backoff_delay(attempt);
                    warn!(
                        table,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient page fetch failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_insert(&self, table: &str, field: &str, value: &str) -> Result<(), FetchError> {
        let url = self.table_url(table);

        let mut fields = serde_json::Map::new();
        fields.insert(field.to_string(), Value::String(value.to_string()));
        let body = serde_json::json!({ "fields": fields });

        let response = self
            .client
            .post(&url)
            .bearer_auth(self.token.as_str())
            .json(&body)
            .send()
            .await?;

        Self::check_response(response).await?;
        Ok(())
    }
}

#[async_trait]
impl RemoteTables for TableClient {
    async fn fetch_all_values(&self, table: &str, field: &str) -> Result<Vec<String>, FetchError> {
        let mut seen: BTreeSet<String> = BTreeSet::new();
        let mut offset: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let page = self.get_page(table, offset.as_deref()).await?;
            pages += 1;
            collect_field_values(&page.records, field, &mut seen);

            match page.offset {
                Some(next) if !next.is_empty() => {
                    offset = Some(next);
                    tokio::time::sleep(Duration::from_millis(PAGE_DELAY_MS)).await;
                }
                _ => break,
            }
        }

        debug!(table, field, pages, count = seen.len(), "Fetched table values");
        Ok(seen.into_iter().collect())
    }

    async fn insert_value(&self, table: &str, field: &str, value: &str) -> Result<(), FetchError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.try_insert(table, field, value).await {
                Ok(()) => {
                    debug!(table, field, "Inserted value into remote table");
                    return Ok(());
                }
                Err(e) if e.is_retryable() && attempt < MAX_FETCH_ATTEMPTS => {
                    let delay = backoff_delay(attempt);
                    warn!(
                        table,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient insert failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
