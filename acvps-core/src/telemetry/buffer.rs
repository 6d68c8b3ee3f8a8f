//! Bounded, drop-oldest event buffer.
//!
//! `record` never blocks on I/O and never fails: it takes a short mutex,
//! appends, and possibly evicts the oldest event. Draining is left to the
//! batcher.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;

use super::GatewayMetrics;
use super::events::TelemetryEvent;

pub struct TelemetryBuffer {
    events: Mutex<VecDeque<TelemetryEvent>>,
    capacity: usize,
    batch_size: usize,
    enabled: bool,
    evicted: AtomicU64,
    batch_ready: Notify,
    metrics: Option<Arc<GatewayMetrics>>,
}

impl TelemetryBuffer {
    pub fn new(capacity: usize, batch_size: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            batch_size: batch_size.clamp(1, capacity),
            enabled: true,
            evicted: AtomicU64::new(0),
            batch_ready: Notify::new(),
            metrics: None,
        }
    }

    /// A buffer whose `record` is a no-op.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new(1, 1)
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Append an event, evicting the oldest one when full.
    pub fn record(&self, event: impl Into<TelemetryEvent>) {
        if !self.enabled {
            return;
        }
        let (len, evicted) = {
            let mut events = self.events.lock();
            let evicted = if events.len() >= self.capacity {
                events.pop_front();
                true
            } else {
                false
            };
            events.push_back(event.into());
            (events.len(), evicted)
        };

        if evicted {
            self.evicted.fetch_add(1, Ordering::Relaxed);
            if let Some(metrics) = &self.metrics {
                metrics.record_telemetry_dropped("evicted", 1);
            }
        }
        if let Some(metrics) = &self.metrics {
            metrics.telemetry_buffered.set(len as i64);
        }
        if len >= self.batch_size {
            self.batch_ready.notify_one();
        }
    }

    /// Remove and return everything currently buffered, oldest first.
    pub fn drain(&self) -> Vec<TelemetryEvent> {
        let drained: Vec<TelemetryEvent> = self.events.lock().drain(..).collect();
        if let Some(metrics) = &self.metrics {
            metrics.telemetry_buffered.set(0);
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Events lost to drop-oldest eviction since start.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    /// Resolves once `batch_size` events are buffered. A signal raised with
    /// nobody waiting is kept for the next call.
    pub async fn batch_ready(&self) {
        self.batch_ready.notified().await;
    }
}
