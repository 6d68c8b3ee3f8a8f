//! Background flusher for the telemetry buffer.
//!
//! One task per process. It wakes on whichever comes first:
//!
//! - the buffer reaching `batch_size` events
//! - `batch_interval` elapsing
//! - the shutdown token, after which it drains once more and exits
//!
//! A failed send is logged and the batch discarded. Nothing is retried and
//! the request path never waits on the sink.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::GatewayMetrics;
use super::buffer::TelemetryBuffer;
use super::events::{IngestBatch, TelemetryEvent};
use super::sink::TelemetrySink;

pub struct TelemetryBatcher {
    buffer: Arc<TelemetryBuffer>,
    sink: Arc<dyn TelemetrySink>,
    interval: Duration,
    metrics: Option<Arc<GatewayMetrics>>,
}

impl TelemetryBatcher {
    pub fn new(
        buffer: Arc<TelemetryBuffer>,
        sink: Arc<dyn TelemetrySink>,
        interval: Duration,
    ) -> Self {
        Self {
            buffer,
            sink,
            interval,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn record(&self, event: impl Into<TelemetryEvent>) {
        self.buffer.record(event);
    }

    pub fn buffer(&self) -> &Arc<TelemetryBuffer> {
        &self.buffer
    }

    /// Send everything currently buffered, in chunks of `batch_size`.
    ///
    /// Returns the number of events the sink accepted.
    pub async fn flush(&self) -> usize {
        let events = self.buffer.drain();
        if events.is_empty() {
            return 0;
        }

        let chunk_size = self.buffer.batch_size();
        let mut delivered = 0;
        let mut pending = events.into_iter().peekable();
        while pending.peek().is_some() {
            let batch: IngestBatch = pending.by_ref().take(chunk_size).collect();
            delivered += self.send(batch).await;
        }
        delivered
    }

    async fn send(&self, batch: IngestBatch) -> usize {
        let size = batch.len();
        match self.sink.send(&batch).await {
            Ok(_) => {
                debug!(events = size, "Flushed telemetry batch");
                if let Some(metrics) = &self.metrics {
                    metrics.record_telemetry_flush(true);
                }
                size
            }
            Err(err) => {
                warn!(
                    events = size,
                    error = %err,
                    "Telemetry sink failed, discarding batch"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_telemetry_flush(false);
                    metrics.record_telemetry_dropped("sink_failure", size as u64);
                }
                0
            }
        }
    }

    /// Spawn the flush loop. The returned handle completes after the final
    /// drain that follows cancellation of `shutdown`.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        info!(
            interval_ms = self.interval.as_millis() as u64,
            batch_size = self.buffer.batch_size(),
            capacity = self.buffer.capacity(),
            "Telemetry batcher started"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = self.buffer.batch_ready() => {
                    self.flush().await;
                    ticker.reset();
                }
                _ = ticker.tick() => {
                    self.flush().await;
                }
            }
        }

        let drained = self.flush().await;
        info!(events = drained, "Telemetry batcher stopped after final drain");
    }
}
