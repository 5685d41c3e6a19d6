//! Redis tier of the content cache. Entries expire natively via `SET EX`.

use crate::backend::{CacheBackend, CacheError};
use async_trait::async_trait;
use inbox_core::config::CacheConfig;
use inbox_core::types::CachedResult;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::{debug, info};

const KEY_PREFIX: &str = "subject-variants:";

/// Redis-backed distributed cache tier.
pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    /// Connect and verify the server answers `PING` within the connect timeout.
    pub async fn connect(url: &str, config: &CacheConfig) -> Result<Self, CacheError> {
        info!(url = %url, "Connecting to Redis");

        let client = redis::Client::open(url)?;
        let connect_timeout = Duration::from_millis(config.connect_timeout_ms);

        let mut conn = tokio::time::timeout(connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| CacheError::Timeout(connect_timeout))??;

        let pong: String = tokio::time::timeout(connect_timeout, redis::cmd("PING").query_async(&mut conn))
            .await
            .map_err(|_| CacheError::Timeout(connect_timeout))??;
        info!(response = %pong, "Redis connection established");

        Ok(Self { conn })
    }

    fn key(key: &str) -> String {
        format!("{KEY_PREFIX}{key}")
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    fn name(&self) -> &str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<CachedResult>, CacheError> {
        let mut conn = self.conn.clone();
        let data: Option<String> = conn.get(Self::key(key)).await?;

        match data {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => {
                debug!(key = key, "Redis miss");
                Ok(None)
            }
        }
    }

    async fn put(&self, key: &str, value: &CachedResult, ttl: Duration) -> Result<(), CacheError> {
        let json = serde_json::to_string(value)?;
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(Self::key(key), json, ttl.as_secs().max(1))
            .await?;
        Ok(())
    }
}
