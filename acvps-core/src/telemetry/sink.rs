//! Destinations for flushed telemetry batches.

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use super::events::{IngestBatch, IngestReceipt};
use crate::config::TelemetrySection;

/// Telemetry delivery failure. Logged by the batcher, never retried inline.
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("telemetry sink unreachable: {0}")]
    Unreachable(String),

    #[error("telemetry sink timed out")]
    Timeout,

    #[error("telemetry sink rejected batch with status {status}")]
    Rejected { status: u16 },

    #[error("telemetry sink did not accept batch ({requests} requests, {violations} violations inserted)")]
    NotAccepted { requests: u64, violations: u64 },

    #[error("telemetry sink returned an invalid receipt: {0}")]
    InvalidReceipt(String),

    #[error("failed to build telemetry client: {0}")]
    Client(String),
}

#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn send(&self, batch: &IngestBatch) -> Result<IngestReceipt, TelemetryError>;
}

/// Posts batches to `{metrics_url}/ingest/batch`.
pub struct HttpIngestSink {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpIngestSink {
    pub fn new(config: &TelemetrySection) -> Result<Self, TelemetryError> {
        Self::with_endpoint(&config.metrics_url, config.api_key.clone(), config.timeout)
    }

    pub fn with_endpoint(
        base_url: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, TelemetryError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .pool_max_idle_per_host(2)
            .build()
            .map_err(|e| TelemetryError::Client(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: format!("{}/ingest/batch", base_url.trim_end_matches('/')),
            api_key,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl TelemetrySink for HttpIngestSink {
    async fn send(&self, batch: &IngestBatch) -> Result<IngestReceipt, TelemetryError> {
        let mut request = self.client.post(&self.endpoint).json(batch);
        if let Some(key) = &self.api_key {
            request = request.header("X-API-Key", key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                TelemetryError::Timeout
            } else {
                TelemetryError::Unreachable(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(TelemetryError::Rejected {
                status: status.as_u16(),
            });
        }

        let receipt: IngestReceipt = response
            .json()
            .await
            .map_err(|e| TelemetryError::InvalidReceipt(e.to_string()))?;

        if !receipt.success {
            return Err(TelemetryError::NotAccepted {
                requests: receipt.inserted.requests,
                violations: receipt.inserted.violations,
            });
        }

        debug!(
            requests = receipt.inserted.requests,
            violations = receipt.inserted.violations,
            "Telemetry batch accepted"
        );
        Ok(receipt)
    }
}
