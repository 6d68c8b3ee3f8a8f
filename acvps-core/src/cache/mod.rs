//! Cache layer for guardrail decisions and serialized structures.
//!
//! [`CacheLayer`] sits in front of a [`CacheBackend`] and owns three
//! concerns the backends do not:
//!
//! - **Fail-open**: every backend call runs under a short timeout. A failed
//!   or slow read is a miss, a failed write is logged. Request handling never
//!   sees a cache error.
//! - **Accounting**: hit/miss counters for the process lifetime.
//! - **Typed access**: `get_struct` / `set_struct` over `serde_json`.

mod backend;
mod error;
mod memory;
mod redis;

pub use self::backend::CacheBackend;
pub use self::error::CacheError;
pub use self::memory::MemoryBackend;
pub use self::redis::RedisBackend;

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{CacheBackendKind, CacheSection};
use crate::telemetry::GatewayMetrics;

// ─────────────────────────────────────────────────────────────────────────────
// Stats
// ─────────────────────────────────────────────────────────────────────────────

/// Monotonic hit/miss counters.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStats {
    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheStatsSnapshot {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        };
        CacheStatsSnapshot {
            hits,
            misses,
            total,
            hit_rate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub total: u64,
    pub hit_rate: f64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Cache layer
// ─────────────────────────────────────────────────────────────────────────────

pub struct CacheLayer {
    backend: Arc<dyn CacheBackend>,
    stats: CacheStats,
    op_timeout: Duration,
    metrics: Option<Arc<GatewayMetrics>>,
}

impl CacheLayer {
    pub fn new(backend: Arc<dyn CacheBackend>, op_timeout: Duration) -> Self {
        Self {
            backend,
            stats: CacheStats::default(),
            op_timeout,
            metrics: None,
        }
    }

    /// Build the backend named in configuration.
    ///
    /// Only a Redis connection failure at startup is an error; after that
    /// the layer fails open. The memory backend's purge task runs until
    /// `shutdown` is cancelled.
    pub async fn from_config(
        config: &CacheSection,
        shutdown: &CancellationToken,
    ) -> Result<Self, CacheError> {
        let backend: Arc<dyn CacheBackend> = match config.backend {
            CacheBackendKind::Memory => {
                let memory = Arc::new(MemoryBackend::new());
                memory
                    .clone()
                    .spawn_purge(config.purge_interval, shutdown.clone());
                memory
            }
            CacheBackendKind::Redis => Arc::new(RedisBackend::connect(config).await?),
        };
        Ok(Self::new(backend, config.op_timeout))
    }

    /// In-process backend with the default timeout. Used by tests.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryBackend::new()),
            CacheSection::default().op_timeout,
        )
    }

    pub fn with_metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    async fn guarded<T, F>(&self, op: &'static str, fut: F) -> Result<T, CacheError>
    where
        F: Future<Output = Result<T, CacheError>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout {
                op,
                timeout_ms: self.op_timeout.as_millis() as u64,
            }),
        }
    }

    fn count_lookup(&self, hit: bool) {
        if hit {
            self.stats.record_hit();
        } else {
            self.stats.record_miss();
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_cache_lookup(if hit { "hit" } else { "miss" });
        }
    }

    fn fail_open(&self, op: &'static str, err: &CacheError) {
        warn!(
            op,
            backend = self.backend.name(),
            error = %err,
            "Cache unavailable, failing open"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_cache_error(err.kind());
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Fail-open operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Read a key. Backend failures read as a miss.
    pub async fn get(&self, key: &str) -> Option<String> {
        let value = match self.guarded("get", self.backend.get(key)).await {
            Ok(value) => value,
            Err(err) => {
                self.fail_open("get", &err);
                None
            }
        };
        self.count_lookup(value.is_some());
        value
    }

    /// Write a key. Backend failures are logged and swallowed.
    pub async fn set(&self, key: &str, value: &str, ttl: Duration) {
        if let Err(err) = self.guarded("set", self.backend.set(key, value, ttl)).await {
            self.fail_open("set", &err);
        }
    }

    pub async fn delete(&self, key: &str) {
        if let Err(err) = self.guarded("delete", self.backend.delete(key)).await {
            self.fail_open("delete", &err);
        }
    }

    /// Does not touch hit/miss counters.
    pub async fn exists(&self, key: &str) -> bool {
        match self.guarded("exists", self.backend.exists(key)).await {
            Ok(found) => found,
            Err(err) => {
                self.fail_open("exists", &err);
                false
            }
        }
    }

    /// Batched read. Returns only the keys that were found; each requested
    /// key counts as one hit or one miss.
    pub async fn get_many(&self, keys: &[String]) -> HashMap<String, String> {
        if keys.is_empty() {
            return HashMap::new();
        }
        let values = match self.guarded("get_many", self.backend.get_many(keys)).await {
            Ok(values) => values,
            Err(err) => {
                self.fail_open("get_many", &err);
                vec![None; keys.len()]
            }
        };

        let mut found = HashMap::with_capacity(keys.len());
        for (key, value) in keys.iter().zip(values) {
            self.count_lookup(value.is_some());
            if let Some(value) = value {
                found.insert(key.clone(), value);
            }
        }
        found
    }

    /// Batched write, one round-trip.
    pub async fn set_many(&self, pairs: &[(String, String)], ttl: Duration) {
        if pairs.is_empty() {
            return;
        }
        if let Err(err) = self
            .guarded("set_many", self.backend.set_many(pairs, ttl))
            .await
        {
            self.fail_open("set_many", &err);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Typed helpers
    // ─────────────────────────────────────────────────────────────────────────

    /// Read and deserialize. A value that does not parse is treated as a miss.
    pub async fn get_struct<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get(key).await?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(key, error = %err, "Discarding undecodable cache entry");
                None
            }
        }
    }

    pub async fn set_struct<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        match serde_json::to_string(value) {
            Ok(raw) => self.set(key, &raw, ttl).await,
            Err(err) => warn!(key, error = %err, "Failed to serialize cache entry"),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Operational calls (errors surfaced)
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn scan(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        self.guarded("scan", self.backend.scan(pattern)).await
    }

    /// Destructive. Test and reset tooling only.
    pub async fn flush_all(&self) -> Result<(), CacheError> {
        debug!(backend = self.backend.name(), "Flushing cache");
        self.guarded("flush_all", self.backend.flush_all()).await
    }

    pub async fn ping(&self) -> Result<(), CacheError> {
        self.guarded("ping", self.backend.ping()).await
    }
}
