//! Storage-tier abstraction for the content cache.

use async_trait::async_trait;
use inbox_core::types::CachedResult;
use std::time::Duration;
use thiserror::Error;

/// Longest lifetime any tier gives an entry; longer TTLs are cut to this.
pub const MAX_TTL: Duration = Duration::from_secs(10 * 365 * 24 * 3600);

pub(crate) fn clamp_ttl(ttl: Duration) -> Duration {
    ttl.min(MAX_TTL)
}

/// Failure inside a single cache tier. Never leaves this crate's public
/// lookup/store path; [`crate::ContentCache`] turns it into a miss.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),

    #[error("cache operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("cache entry could not be decoded: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One tier of the cache chain, addressed by the hex content hash.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Tier name for logs and metrics.
    fn name(&self) -> &str;

    /// Fetch an unexpired entry.
    async fn get(&self, key: &str) -> Result<Option<CachedResult>, CacheError>;

    /// Insert or replace an entry with the given time-to-live.
    async fn put(&self, key: &str, value: &CachedResult, ttl: Duration) -> Result<(), CacheError>;

    /// Drop expired entries. Tiers with native expiry return 0.
    async fn evict_expired(&self) -> usize {
        0
    }
}
