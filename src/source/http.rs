use anyhow::Result;
use reqwest::Client;
use std::time::Duration;

use crate::config::Config;
use crate::source::retry::{is_transient, retry_async, RetryConfig, StatusError};
use crate::source::{source_now, ApiEnvelope, RoundSource, SourceBatch};

/// Polls the source's JSON endpoint (`?limit=N`).
pub struct HttpSource {
    client: Client,
    url: String,
    retry: RetryConfig,
}

impl HttpSource {
    pub fn new(cfg: &Config) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(cfg.source_timeout_ms))
            .build()?;
        Ok(Self {
            client,
            url: cfg.source_url.clone(),
            retry: RetryConfig::from_config(cfg),
        })
    }

    async fn fetch_once(&self, limit: usize) -> Result<ApiEnvelope> {
        let resp = self
            .client
            .get(&self.url)
            .query(&[("limit", limit)])
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(StatusError(status.as_u16()).into());
        }
        Ok(resp.json::<ApiEnvelope>().await?)
    }
}

#[async_trait::async_trait]
impl RoundSource for HttpSource {
    async fn fetch_recent(&self, limit: usize) -> Result<SourceBatch> {
        let envelope = retry_async(&self.retry, "fetch_recent", is_transient, || self.fetch_once(limit)).await?;
        let raw = envelope.into_rounds()?;
        Ok(SourceBatch::from_raw(&raw, source_now()))
    }

    /// One attempt, no retries.
    async fn probe(&self) -> Result<()> {
        self.fetch_once(1).await?.into_rounds().map(|_| ())
    }
}
