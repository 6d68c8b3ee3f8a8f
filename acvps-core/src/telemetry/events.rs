//! Telemetry records sent to the metrics ingestion service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Summary of one handled request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEvent {
    pub timestamp: DateTime<Utc>,
    pub tenant_id: String,
    pub trace_id: String,
    pub contract_id: String,
    pub certificate_id: String,
    pub method: String,
    pub path: String,
    pub status_code: u16,
    pub response_time_ms: u64,
    pub request_size_bytes: u64,
    pub response_size_bytes: u64,
    pub ip_address: String,
    #[serde(default)]
    pub user_agent: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// A contract breach, emitted only on block paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationEvent {
    pub timestamp: DateTime<Utc>,
    pub tenant_id: String,
    pub trace_id: String,
    pub contract_id: String,
    pub certificate_id: String,
    /// e.g. `guardrail_block`, `low_grounding`, `evaluator_unavailable`
    pub violation_type: String,
    pub metric_name: String,
    pub metric_value: f64,
    pub threshold_min: Option<f64>,
    pub threshold_max: Option<f64>,
    pub severity: Severity,
    #[serde(default)]
    pub details: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    Request(RequestEvent),
    Violation(ViolationEvent),
}

impl From<RequestEvent> for TelemetryEvent {
    fn from(event: RequestEvent) -> Self {
        TelemetryEvent::Request(event)
    }
}

impl From<ViolationEvent> for TelemetryEvent {
    fn from(event: ViolationEvent) -> Self {
        TelemetryEvent::Violation(event)
    }
}

/// Body of `POST /ingest/batch`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestBatch {
    pub requests: Vec<RequestEvent>,
    pub violations: Vec<ViolationEvent>,
}

impl IngestBatch {
    pub fn len(&self) -> usize {
        self.requests.len() + self.violations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty() && self.violations.is_empty()
    }
}

impl FromIterator<TelemetryEvent> for IngestBatch {
    fn from_iter<I: IntoIterator<Item = TelemetryEvent>>(iter: I) -> Self {
        let mut batch = IngestBatch::default();
        for event in iter {
            match event {
                TelemetryEvent::Request(e) => batch.requests.push(e),
                TelemetryEvent::Violation(e) => batch.violations.push(e),
            }
        }
        batch
    }
}

/// Response of `POST /ingest/batch`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReceipt {
    pub success: bool,
    #[serde(default)]
    pub inserted: InsertedCounts,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertedCounts {
    pub requests: u64,
    pub violations: u64,
}
