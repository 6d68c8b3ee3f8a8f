use async_trait::async_trait;
use std::time::Duration;

use super::CacheError;

/// Key/value store with per-key expiry.
///
/// Expiry is the backend's job: an expired key must read exactly like an
/// absent one. `get_many` and `set_many` are a single round-trip.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    async fn exists(&self, key: &str) -> Result<bool, CacheError>;

    /// Values in the same order as `keys`.
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, CacheError>;

    async fn set_many(&self, pairs: &[(String, String)], ttl: Duration) -> Result<(), CacheError>;

    /// Keys matching a glob pattern (`*`, `?`, `[...]`).
    async fn scan(&self, pattern: &str) -> Result<Vec<String>, CacheError>;

    async fn flush_all(&self) -> Result<(), CacheError>;

    async fn ping(&self) -> Result<(), CacheError>;

    /// Backend name for logs.
    fn name(&self) -> &'static str;
}
