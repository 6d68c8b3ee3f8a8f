//! In-process cache backend.
//!
//! Used for single-instance deployments and tests. Expired entries are
//! dropped lazily on read and in bulk by [`MemoryBackend::purge_expired`],
//! which [`MemoryBackend::spawn_purge`] runs on an interval. Decision keys
//! are rarely read twice, so without the purge task the map only grows.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{CacheBackend, CacheError};

struct Entry {
    value: String,
    /// `None` when stored with a zero TTL.
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Default)]
pub struct MemoryBackend {
    map: DashMap<String, Entry>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove every expired entry. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.map.len();
        self.map.retain(|_, entry| entry.is_live(now));
        before.saturating_sub(self.map.len())
    }

    /// Purge expired entries every `interval` until `shutdown` is cancelled.
    pub fn spawn_purge(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = self.purge_expired();
                        if removed > 0 {
                            debug!(removed, remaining = self.len(), "Purged expired cache entries");
                        }
                    }
                }
            }
            info!("Cache purge task stopped");
        })
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn live_value(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        match self.map.get(key) {
            None => return None,
            Some(entry) if entry.is_live(now) => return Some(entry.value.clone()),
            Some(_) => {}
        }
        // The read guard is released; removal takes the shard write lock.
        self.map.remove_if(key, |_, entry| !entry.is_live(now));
        None
    }

    fn insert(&self, key: &str, value: &str, ttl: Duration) {
        let expires_at = (!ttl.is_zero()).then(|| Instant::now() + ttl);
        self.map.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self.live_value(key))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        self.insert(key, value, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.map.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.live_value(key).is_some())
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, CacheError> {
        Ok(keys.iter().map(|k| self.live_value(k)).collect())
    }

    async fn set_many(&self, pairs: &[(String, String)], ttl: Duration) -> Result<(), CacheError> {
        for (key, value) in pairs {
            self.insert(key, value, ttl);
        }
        Ok(())
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        let matcher = glob::Pattern::new(pattern).map_err(|e| CacheError::InvalidPattern {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })?;
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .map
            .iter()
            .filter(|entry| entry.value().is_live(now) && matcher.matches(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn flush_all(&self) -> Result<(), CacheError> {
        self.map.clear();
        Ok(())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_reads_as_absent() {
        let backend = MemoryBackend::new();
        backend.set("k", "v", Duration::from_secs(10)).await.unwrap();
        assert_eq!(backend.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(backend.get("k").await.unwrap(), None);
        assert!(!backend.exists("k").await.unwrap());
        // Lazy removal on read.
        assert!(backend.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_ttl_never_expires() {
        let backend = MemoryBackend::new();
        backend.set("k", "v", Duration::ZERO).await.unwrap();
        tokio::time::advance(Duration::from_secs(86_400)).await;
        assert!(backend.exists("k").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let backend = MemoryBackend::new();
        backend.set("short", "1", Duration::from_secs(1)).await.unwrap();
        backend.set("long", "2", Duration::from_secs(60)).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(backend.purge_expired(), 1);
        assert_eq!(backend.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_task_drops_unread_entries() {
        let backend = Arc::new(MemoryBackend::new());
        let shutdown = CancellationToken::new();
        let handle = backend
            .clone()
            .spawn_purge(Duration::from_secs(30), shutdown.clone());

        backend.set("decision:a", "1", Duration::from_secs(5)).await.unwrap();
        backend.set("decision:b", "1", Duration::from_secs(5)).await.unwrap();
        backend.set("contract:x", "1", Duration::from_secs(300)).await.unwrap();

        // Expired but never read again: only the purge task removes them.
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(backend.len(), 1);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_scan_glob() {
        let backend = MemoryBackend::new();
        let ttl = Duration::from_secs(60);
        backend.set("decision:a", "1", ttl).await.unwrap();
        backend.set("decision:b", "1", ttl).await.unwrap();
        backend.set("contract:x", "1", ttl).await.unwrap();

        let keys = backend.scan("decision:*").await.unwrap();
        assert_eq!(keys, vec!["decision:a".to_string(), "decision:b".to_string()]);

        let err = backend.scan("decision:[").await.unwrap_err();
        assert!(matches!(err, CacheError::InvalidPattern { .. }));
    }

    #[tokio::test]
    async fn test_get_many_preserves_order() {
        let backend = MemoryBackend::new();
        let ttl = Duration::from_secs(60);
        backend
            .set_many(
                &[("a".to_string(), "1".to_string()), ("c".to_string(), "3".to_string())],
                ttl,
            )
            .await
            .unwrap();
        let values = backend
            .get_many(&["a".to_string(), "b".to_string(), "c".to_string()])
            .await
            .unwrap();
        assert_eq!(values, vec![Some("1".to_string()), None, Some("3".to_string())]);
    }
}
