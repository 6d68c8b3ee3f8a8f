//! Redis cache backend.
//!
//! Holds `pool_size` multiplexed [`ConnectionManager`]s and hands them out
//! round-robin. Each manager reconnects on its own with the configured retry
//! count, so a Redis restart shows up as a few failed calls rather than a
//! dead gateway.

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::info;

use super::{CacheBackend, CacheError};
use crate::config::CacheSection;

const SCAN_BATCH: usize = 100;

pub struct RedisBackend {
    connections: Vec<ConnectionManager>,
    next: AtomicUsize,
}

impl RedisBackend {
    /// Open the connection pool. Fails if Redis is unreachable at startup.
    pub async fn connect(config: &CacheSection) -> Result<Self, CacheError> {
        let mut info = redis::IntoConnectionInfo::into_connection_info(config.redis_url.as_str())?;
        if let Some(password) = &config.redis_password {
            info.redis.password = Some(password.clone());
        }
        info.redis.db = config.redis_db;
        let client = redis::Client::open(info)?;

        let manager_config = || {
            ConnectionManagerConfig::new()
                .set_number_of_retries(config.max_retries)
                .set_connection_timeout(config.connect_timeout)
                .set_response_timeout(config.op_timeout)
        };

        let pool_size = config.pool_size.max(1);
        let mut connections = Vec::with_capacity(pool_size);
        for _ in 0..pool_size {
            connections.push(
                client
                    .get_connection_manager_with_config(manager_config())
                    .await?,
            );
        }

        info!(
            url = %config.redis_url,
            db = config.redis_db,
            pool_size,
            "Connected to Redis"
        );

        Ok(Self {
            connections,
            next: AtomicUsize::new(0),
        })
    }

    fn conn(&self) -> ConnectionManager {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.connections.len();
        self.connections[idx].clone()
    }
}

fn set_cmd(key: &str, value: &str, ttl: Duration) -> redis::Cmd {
    let mut cmd = redis::cmd("SET");
    cmd.arg(key).arg(value);
    if !ttl.is_zero() {
        // PX rejects 0; sub-millisecond TTLs round up.
        cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
    }
    cmd
}

#[async_trait]
impl CacheBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn();
        let _: () = set_cmd(key, value, ttl).query_async(&mut conn).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn();
        let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn();
        let count: i64 = redis::cmd("EXISTS").arg(key).query_async(&mut conn).await?;
        Ok(count > 0)
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, CacheError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn();
        let values: Vec<Option<String>> =
            redis::cmd("MGET").arg(keys).query_async(&mut conn).await?;
        Ok(values)
    }

    async fn set_many(&self, pairs: &[(String, String)], ttl: Duration) -> Result<(), CacheError> {
        if pairs.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        for (key, value) in pairs {
            pipe.add_command(set_cmd(key, value, ttl)).ignore();
        }
        let mut conn = self.conn();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        let mut conn = self.conn();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn flush_all(&self) -> Result<(), CacheError> {
        let mut conn = self.conn();
        let _: () = redis::cmd("FLUSHDB").query_async(&mut conn).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.conn();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
