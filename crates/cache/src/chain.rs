//! Content cache: an ordered chain of tiers (local, Redis, disk) tried in
//! sequence. Lookups are advisory; every tier failure degrades to a miss.

use crate::backend::{clamp_ttl, CacheBackend, CacheError};
use crate::client::RedisCache;
use crate::disk::DiskCache;
use crate::local::LocalCache;
use chrono::{DateTime, Utc};
use inbox_core::config::CacheConfig;
use inbox_core::types::CachedResult;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct ContentCache {
    tiers: Vec<Arc<dyn CacheBackend>>,
    ttl: Duration,
    op_timeout: Duration,
}

impl ContentCache {
    pub fn new(tiers: Vec<Arc<dyn CacheBackend>>, ttl: Duration, op_timeout: Duration) -> Self {
        Self {
            tiers,
            ttl: clamp_ttl(ttl),
            op_timeout,
        }
    }

    /// Build the standard chain. Redis and disk tiers that fail to come up
    /// are left out with a warning; the local tier is always present.
    pub async fn from_config(config: &CacheConfig) -> Self {
        let mut tiers: Vec<Arc<dyn CacheBackend>> =
            vec![Arc::new(LocalCache::new(config.local_max_entries))];

        if let Some(url) = &config.redis_url {
            match RedisCache::connect(url, config).await {
                Ok(redis) => tiers.push(Arc::new(redis)),
                Err(e) => {
                    warn!(error = %e, "Redis unreachable, continuing with local and disk tiers");
                }
            }
        }

        if let Some(dir) = &config.disk_dir {
            match DiskCache::open(dir).await {
                Ok(disk) => tiers.push(Arc::new(disk)),
                Err(e) => warn!(error = %e, dir = %dir, "Disk cache unavailable"),
            }
        }

        let cache = Self::new(
            tiers,
            Duration::from_secs(config.ttl_secs),
            Duration::from_millis(config.op_timeout_ms),
        );
        info!(tiers = ?cache.tier_names(), "Content cache initialized");
        cache
    }

    pub fn tier_names(&self) -> Vec<String> {
        self.tiers.iter().map(|t| t.name().to_string()).collect()
    }

    pub fn default_ttl(&self) -> Duration {
        self.ttl
    }

    /// Find an unexpired entry. Never fails: backend errors and timeouts are
    /// logged, counted, and treated as misses. A hit in a lower tier is copied
    /// into the tiers above it with the remaining lifetime.
    pub async fn lookup(&self, key: &str) -> Option<CachedResult> {
        for (depth, tier) in self.tiers.iter().enumerate() {
            let found = match self.bounded(tier.get(key)).await {
                Ok(found) => found,
                Err(e) => {
                    self.record_failure(tier.name(), "get", &e);
                    continue;
                }
            };

            let Some(result) = found else { continue };
            let now = Utc::now();
            if result.is_expired(now) {
                debug!(tier = tier.name(), key = key, "Discarding expired cache entry");
                continue;
            }

            metrics::counter!("cache.hit", "tier" => tier.name().to_string()).increment(1);

            if let Ok(remaining) = (result.expires_at - now).to_std() {
                for upper in &self.tiers[..depth] {
                    if let Err(e) = self.bounded(upper.put(key, &result, remaining)).await {
                        self.record_failure(upper.name(), "backfill", &e);
                    }
                }
            }
            return Some(result);
        }

        metrics::counter!("cache.miss").increment(1);
        None
    }

    /// Write through to every tier. `ttl` defaults to the configured TTL.
    /// Failures are absorbed; a total outage only costs regeneration later.
    pub async fn store(&self, key: &str, mut result: CachedResult, ttl: Option<Duration>) {
        let ttl = clamp_ttl(ttl.unwrap_or(self.ttl));
        let lifetime = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(1));
        result.expires_at = Utc::now()
            .checked_add_signed(lifetime)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let mut stored = 0usize;
        for tier in &self.tiers {
            match self.bounded(tier.put(key, &result, ttl)).await {
                Ok(()) => stored += 1,
                Err(e) => self.record_failure(tier.name(), "put", &e),
            }
        }
        if stored == 0 {
            warn!(key = key, "Cache store failed on every tier");
        }
    }

    /// Periodic maintenance: sweep expired entries from tiers without native expiry.
    pub async fn maintenance(&self) -> usize {
        let mut evicted = 0;
        for tier in &self.tiers {
            evicted += tier.evict_expired().await;
        }
        if evicted > 0 {
            debug!(evicted = evicted, "Cache eviction complete");
        }
        evicted
    }

    async fn bounded<T>(
        &self,
        op: impl std::future::Future<Output = Result<T, CacheError>>,
    ) -> Result<T, CacheError> {
        tokio::time::timeout(self.op_timeout, op)
            .await
            .map_err(|_| CacheError::Timeout(self.op_timeout))?
    }

    fn record_failure(&self, tier: &str, op: &'static str, error: &CacheError) {
        metrics::counter!("cache.backend_errors", "tier" => tier.to_string(), "op" => op)
            .increment(1);
        warn!(tier = tier, op = op, error = %error, "Cache tier failed, treating as miss");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MAX_TTL;
    use async_trait::async_trait;
    use inbox_core::types::{DraftVariant, ExperimentId};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingBackend {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CacheBackend for FailingBackend {
        fn name(&self) -> &str {
            "failing"
        }

        async fn get(&self, _key: &str) -> Result<Option<CachedResult>, CacheError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(CacheError::Unavailable("connection refused".into()))
        }

        async fn put(&self, _key: &str, _value: &CachedResult, _ttl: Duration) -> Result<(), CacheError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(CacheError::Unavailable("connection refused".into()))
        }
    }

    struct SlowBackend;

    #[async_trait]
    impl CacheBackend for SlowBackend {
        fn name(&self) -> &str {
            "slow"
        }

        async fn get(&self, _key: &str) -> Result<Option<CachedResult>, CacheError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(None)
        }

        async fn put(&self, _key: &str, _value: &CachedResult, _ttl: Duration) -> Result<(), CacheError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }
    }

    fn result() -> CachedResult {
        CachedResult {
            experiment_id: ExperimentId::parse(&"c3".repeat(32)).unwrap(),
            variants: vec![DraftVariant {
                text: "Inside: your weekly picks".to_string(),
                placeholder: false,
            }],
            expires_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_failing_tier_degrades_to_miss() {
        let failing = Arc::new(FailingBackend {
            calls: AtomicUsize::new(0),
        });
        let cache = ContentCache::new(
            vec![failing.clone()],
            Duration::from_secs(60),
            Duration::from_millis(50),
        );

        cache.store("k", result(), None).await;
        assert!(cache.lookup("k").await.is_none());
        assert_eq!(failing.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_falls_through_failing_tier_to_next() {
        let local = Arc::new(LocalCache::new(10));
        let cache = ContentCache::new(
            vec![
                Arc::new(FailingBackend {
                    calls: AtomicUsize::new(0),
                }),
                local.clone(),
            ],
            Duration::from_secs(60),
            Duration::from_millis(50),
        );

        cache.store("k", result(), None).await;
        let hit = cache.lookup("k").await.unwrap();
        assert_eq!(hit.variants, result().variants);
        assert!(hit.expires_at > Utc::now());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_tier_is_bounded_by_timeout() {
        let cache = ContentCache::new(
            vec![Arc::new(SlowBackend)],
            Duration::from_secs(60),
            Duration::from_millis(100),
        );

        let start = tokio::time::Instant::now();
        assert!(cache.lookup("k").await.is_none());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_lower_tier_hit_backfills_upper_tier() {
        let upper = Arc::new(LocalCache::new(10));
        let lower = Arc::new(LocalCache::new(10));
        let mut entry = result();
        entry.expires_at = Utc::now() + chrono::Duration::minutes(5);
        lower.insert("k".into(), entry, Duration::from_secs(300));

        let cache = ContentCache::new(
            vec![upper.clone(), lower],
            Duration::from_secs(60),
            Duration::from_millis(50),
        );

        assert!(upper.lookup("k").is_none());
        assert!(cache.lookup("k").await.is_some());
        assert!(upper.lookup("k").is_some());
    }

    #[tokio::test]
    async fn test_huge_ttl_is_clamped() {
        let local = Arc::new(LocalCache::new(10));
        let cache = ContentCache::new(vec![local.clone()], Duration::MAX, Duration::from_millis(50));

        cache.store("k", result(), None).await;
        cache.store("j", result(), Some(Duration::from_secs(u64::MAX))).await;
        let hit = cache.lookup("k").await.unwrap();
        assert!(hit.expires_at > Utc::now() + chrono::Duration::days(365));
        assert!(hit.expires_at <= Utc::now() + chrono::Duration::from_std(MAX_TTL).unwrap());
        assert!(cache.lookup("j").await.is_some());
        assert_eq!(local.len(), 2);
    }

    #[tokio::test]
    async fn test_logically_expired_entry_is_a_miss() {
        let local = Arc::new(LocalCache::new(10));
        // Physically present for an hour, logically already expired.
        local.insert("k".into(), result(), Duration::from_secs(3600));

        let cache = ContentCache::new(vec![local], Duration::from_secs(60), Duration::from_millis(50));
        assert!(cache.lookup("k").await.is_none());
    }

    #[tokio::test]
    async fn test_disk_tier_serves_when_network_tier_is_down() {
        let dir = tempfile::tempdir().unwrap();
        let disk = Arc::new(DiskCache::open(dir.path()).await.unwrap());
        let cache = ContentCache::new(
            vec![
                Arc::new(FailingBackend {
                    calls: AtomicUsize::new(0),
                }),
                disk,
            ],
            Duration::from_secs(60),
            Duration::from_millis(500),
        );

        let key = "c3".repeat(32);
        cache.store(&key, result(), None).await;
        assert!(cache.lookup(&key).await.is_some());
    }
}
