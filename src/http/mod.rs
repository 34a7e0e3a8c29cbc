//! REST snapshot retrieval.
//!
//! The synchronizer only needs one capability from the REST API: fetch a
//! depth snapshot for a symbol. That seam is the [`SnapshotFetcher`] trait;
//! [`BinanceHttp`] is the production implementation and tests substitute
//! in-memory fakes.

pub mod retry;

use crate::error::HttpError;
use crate::network::{DEPTH_SNAPSHOT_LIMIT, DEFAULT_API_URL};
use crate::shared::Symbol;
use crate::wire::DepthSnapshot;
use async_trait::async_trait;
use retry::RetryConfig;
use std::time::Duration;

/// Asynchronous source of full order-book snapshots.
#[async_trait]
pub trait SnapshotFetcher: Send + Sync {
    async fn depth_snapshot(&self, symbol: &Symbol) -> Result<DepthSnapshot, HttpError>;
}

/// REST client for the exchange depth endpoint.
pub struct BinanceHttp {
    base_url: String,
    client: reqwest::Client,
    retry: RetryConfig,
}

impl BinanceHttp {
    pub fn new(base_url: &str) -> Self {
        Self::with_retry(base_url, RetryConfig::default())
    }

    pub fn with_retry(base_url: &str, retry: RetryConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .build()
            .expect("Failed to build HTTP client");

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            retry,
        }
    }

    async fn get_snapshot_once(&self, symbol: &Symbol) -> Result<DepthSnapshot, HttpError> {
        let url = format!(
            "{}/api/v3/depth?symbol={}&limit={}",
            self.base_url,
            symbol.as_str(),
            DEPTH_SNAPSHOT_LIMIT
        );

        let resp = self.client.get(&url).send().await?;
        let status = resp.status();

        if status.is_success() {
            return Ok(resp.json::<DepthSnapshot>().await?);
        }

        let status_code = status.as_u16();
        let body = resp.text().await.unwrap_or_default();
        match status_code {
            404 => Err(HttpError::NotFound(body)),
            429 => Err(HttpError::RateLimited {
                retry_after_ms: None,
            }),
            400..=499 => Err(HttpError::BadRequest(body)),
            _ => Err(HttpError::ServerError {
                status: status_code,
                body,
            }),
        }
    }

    fn should_retry(error: &HttpError) -> bool {
        match error {
            HttpError::ServerError { status, .. } => RetryConfig::retryable_status(*status),
            HttpError::RateLimited { .. } => true,
            HttpError::Reqwest(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            _ => false,
        }
    }
}

impl Default for BinanceHttp {
    fn default() -> Self {
        Self::new(DEFAULT_API_URL)
    }
}

#[async_trait]
impl SnapshotFetcher for BinanceHttp {
    async fn depth_snapshot(&self, symbol: &Symbol) -> Result<DepthSnapshot, HttpError> {
        let mut last_error: Option<HttpError> = None;

        for attempt in 0..=self.retry.max_retries {
            match self.get_snapshot_once(symbol).await {
                Ok(snapshot) => return Ok(snapshot),
                Err(e) if Self::should_retry(&e) && attempt < self.retry.max_retries => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    tracing::debug!(
                        symbol = %symbol,
                        attempt = attempt + 1,
                        max = self.retry.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying depth snapshot fetch"
                    );
                    tokio::time::sleep(delay).await;
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(HttpError::MaxRetriesExceeded {
            attempts: self.retry.max_retries + 1,
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        })
    }
}
