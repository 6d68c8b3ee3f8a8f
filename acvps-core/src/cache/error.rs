use thiserror::Error;

/// Transient cache failure.
///
/// Never surfaced to callers of [`super::CacheLayer`]'s read and write
/// paths: a failed read is a miss and a failed write is logged.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),

    #[error("cache {op} timed out after {timeout_ms}ms")]
    Timeout { op: &'static str, timeout_ms: u64 },

    #[error("invalid scan pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("cache value serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        CacheError::Backend(err.to_string())
    }
}

impl CacheError {
    /// Short label for the `result` dimension of cache metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            CacheError::Backend(_) => "backend",
            CacheError::Timeout { .. } => "timeout",
            CacheError::InvalidPattern { .. } => "pattern",
            CacheError::Serialization(_) => "serialization",
        }
    }
}
