//! Per-request telemetry bookkeeping.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use super::pipeline::Block;
use crate::telemetry::{RequestEvent, TelemetryBuffer};

/// Status recorded for a request abandoned before a response was produced.
pub const STATUS_CLIENT_CLOSED: u16 = 499;

/// Who made a request and what it targeted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestIdentity {
    pub trace_id: String,
    pub tenant_id: String,
    pub contract_id: String,
    pub certificate_id: String,
    pub method: String,
    pub path: String,
    pub ip_address: String,
    pub user_agent: String,
}

/// Emits exactly one request event for the request it tracks.
///
/// [`finish`](Self::finish) consumes the record; a record dropped without
/// finishing (client went away, handler cancelled) reports
/// [`STATUS_CLIENT_CLOSED`].
pub struct RequestRecord {
    identity: RequestIdentity,
    request_size_bytes: u64,
    received_at: DateTime<Utc>,
    started: Instant,
    telemetry: Arc<TelemetryBuffer>,
    emitted: bool,
}

impl RequestRecord {
    pub fn new(
        telemetry: Arc<TelemetryBuffer>,
        identity: RequestIdentity,
        request_size_bytes: u64,
    ) -> Self {
        Self {
            identity,
            request_size_bytes,
            received_at: Utc::now(),
            started: Instant::now(),
            telemetry,
            emitted: false,
        }
    }

    pub fn identity(&self) -> &RequestIdentity {
        &self.identity
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Record the outcome. A block also records its violation.
    pub fn finish(mut self, status_code: u16, response_size_bytes: u64, block: Option<&Block>) {
        if let Some(block) = block {
            self.telemetry.record(block.violation(&self.identity));
        }
        self.emit(status_code, response_size_bytes);
    }

    fn emit(&mut self, status_code: u16, response_size_bytes: u64) {
        if self.emitted {
            return;
        }
        self.emitted = true;

        let id = &self.identity;
        self.telemetry.record(RequestEvent {
            timestamp: self.received_at,
            tenant_id: id.tenant_id.clone(),
            trace_id: id.trace_id.clone(),
            contract_id: id.contract_id.clone(),
            certificate_id: id.certificate_id.clone(),
            method: id.method.clone(),
            path: id.path.clone(),
            status_code,
            response_time_ms: self.started.elapsed().as_millis() as u64,
            request_size_bytes: self.request_size_bytes,
            response_size_bytes,
            ip_address: id.ip_address.clone(),
            user_agent: id.user_agent.clone(),
        });
    }
}

impl Drop for RequestRecord {
    fn drop(&mut self) {
        if !self.emitted {
            debug!(trace_id = %self.identity.trace_id, "Request abandoned before completion");
            self.emit(STATUS_CLIENT_CLOSED, 0);
        }
    }
}
