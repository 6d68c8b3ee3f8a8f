//! Telemetry: request/violation events, the non-blocking buffer, the
//! background batcher, and Prometheus metrics.

mod batcher;
mod buffer;
pub mod cardinality;
pub mod events;
pub mod prom_metrics;
mod sink;

pub use batcher::TelemetryBatcher;
pub use buffer::TelemetryBuffer;
pub use events::{
    IngestBatch, IngestReceipt, RequestEvent, Severity, TelemetryEvent, ViolationEvent,
};
pub use prom_metrics::GatewayMetrics;
pub use sink::{HttpIngestSink, TelemetryError, TelemetrySink};

use std::sync::Arc;

use crate::config::TelemetrySection;

/// Build the buffer and its batcher from configuration.
///
/// When telemetry is disabled the buffer discards everything and the
/// batcher has nothing to flush, but both still exist so callers need no
/// special case.
pub fn from_config(
    config: &TelemetrySection,
    metrics: Option<Arc<GatewayMetrics>>,
) -> Result<(Arc<TelemetryBuffer>, TelemetryBatcher), TelemetryError> {
    let mut buffer = if config.enabled {
        TelemetryBuffer::new(config.buffer_size, config.batch_size)
    } else {
        TelemetryBuffer::disabled()
    };
    if let Some(metrics) = &metrics {
        buffer = buffer.with_metrics(metrics.clone());
    }
    let buffer = Arc::new(buffer);

    let sink = Arc::new(HttpIngestSink::new(config)?);
    let mut batcher = TelemetryBatcher::new(buffer.clone(), sink, config.batch_interval);
    if let Some(metrics) = metrics {
        batcher = batcher.with_metrics(metrics);
    }
    Ok((buffer, batcher))
}
