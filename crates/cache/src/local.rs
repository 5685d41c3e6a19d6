//! In-process cache backed by DashMap for lock-free concurrent access.
//! Sits at the head of the chain to save network round trips on hot inputs.

use crate::backend::{clamp_ttl, CacheBackend, CacheError};
use async_trait::async_trait;
use dashmap::DashMap;
use inbox_core::types::CachedResult;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct CacheEntry {
    result: CachedResult,
    expires_at: Instant,
}

/// Lock-free local cache for recently generated variant sets.
pub struct LocalCache {
    store: Arc<DashMap<String, CacheEntry>>,
    max_entries: usize,
}

impl LocalCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            store: Arc::new(DashMap::with_capacity(max_entries.min(65_536))),
            max_entries,
        }
    }

    /// Get an entry, returns None if expired or missing.
    pub fn lookup(&self, key: &str) -> Option<CachedResult> {
        let entry = self.store.get(key)?;
        if Instant::now() >= entry.expires_at {
            drop(entry);
            self.store.remove(key);
            return None;
        }
        Some(entry.result.clone())
    }

    /// Insert or update an entry.
    pub fn insert(&self, key: String, result: CachedResult, ttl: Duration) {
        // Over capacity: skip new keys, the maintenance sweep frees room.
        if self.store.len() >= self.max_entries && !self.store.contains_key(&key) {
            metrics::counter!("cache.local.rejected").increment(1);
            return;
        }
        let now = Instant::now();
        self.store.insert(
            key,
            CacheEntry {
                result,
                expires_at: now.checked_add(clamp_ttl(ttl)).unwrap_or(now),
            },
        );
    }

    /// Remove expired entries. Call this periodically from a background task.
    pub fn sweep(&self) -> usize {
        let before = self.store.len();
        let now = Instant::now();
        self.store.retain(|_, entry| entry.expires_at > now);
        before - self.store.len()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

#[async_trait]
impl CacheBackend for LocalCache {
    fn name(&self) -> &str {
        "local"
    }

    async fn get(&self, key: &str) -> Result<Option<CachedResult>, CacheError> {
        Ok(self.lookup(key))
    }

    async fn put(&self, key: &str, value: &CachedResult, ttl: Duration) -> Result<(), CacheError> {
        self.insert(key.to_string(), value.clone(), ttl);
        Ok(())
    }

    async fn evict_expired(&self) -> usize {
        self.sweep()
    }
}
