use async_trait::async_trait;
use chrono::Utc;
use inbox_cache::{CacheBackend, CacheError, ContentCache, LocalCache};
use inbox_core::config::AppConfig;
use inbox_core::types::{
    CachedResult, DraftVariant, EventType, ExperimentId, Phase, SelectionMethod, VariantId,
};
use inbox_core::{GenerationRequest, InboxError};
use inbox_engine::ExperimentPipeline;
use inbox_gateway::prompt::Prompt;
use inbox_gateway::{CallContext, GenerationGateway, GenerationProvider, ProviderError, RetryPolicy};
use inbox_store::{ExperimentStore, MemoryStore};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct CountingProvider {
    calls: AtomicU32,
    latency: Duration,
    reject: bool,
}

impl CountingProvider {
    fn new() -> Self {
        Self {
            calls: AtomicU32::new(0),
            latency: Duration::ZERO,
            reject: false,
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationProvider for CountingProvider {
    fn provider_name(&self) -> &str {
        "counting"
    }

    async fn generate_raw(&self, _prompt: &Prompt) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.reject {
            return Err(ProviderError::Rejected("HTTP 401: bad key".into()));
        }
        Ok("1. Alpha subject line\n2. Beta subject line\n3. Gamma subject line".into())
    }
}

/// A cache tier that is permanently down.
struct BrokenTier;

#[async_trait]
impl CacheBackend for BrokenTier {
    fn name(&self) -> &str {
        "broken"
    }

    async fn get(&self, _key: &str) -> Result<Option<CachedResult>, CacheError> {
        Err(CacheError::Unavailable("connection refused".into()))
    }

    async fn put(&self, _key: &str, _value: &CachedResult, _ttl: Duration) -> Result<(), CacheError> {
        Err(CacheError::Unavailable("connection refused".into()))
    }
}

/// A cache tier that answers every key with the same stored variants.
struct StaleTier {
    variants: Vec<DraftVariant>,
}

#[async_trait]
impl CacheBackend for StaleTier {
    fn name(&self) -> &str {
        "stale"
    }

    async fn get(&self, key: &str) -> Result<Option<CachedResult>, CacheError> {
        let experiment_id =
            ExperimentId::parse(key).map_err(|e| CacheError::Unavailable(e.to_string()))?;
        Ok(Some(CachedResult {
            experiment_id,
            variants: self.variants.clone(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
        }))
    }

    async fn put(&self, _key: &str, _value: &CachedResult, _ttl: Duration) -> Result<(), CacheError> {
        Ok(())
    }
}

fn config(threshold: u64) -> AppConfig {
    let mut config = AppConfig::default();
    config.bandit.exploration_threshold = threshold;
    config
}

fn local_cache() -> Arc<ContentCache> {
    Arc::new(ContentCache::new(
        vec![Arc::new(LocalCache::new(1000))],
        Duration::from_secs(3600),
        Duration::from_millis(250),
    ))
}

fn pipeline_with(
    provider: Arc<CountingProvider>,
    cache: Arc<ContentCache>,
    threshold: u64,
) -> (ExperimentPipeline, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::in_memory());
    let policy = RetryPolicy {
        max_attempts: 3,
        base_delay_ms: 10,
        max_delay_ms: 100,
        multiplier: 2.0,
        jitter: true,
    };
    let gateway = Arc::new(GenerationGateway::new(provider, policy, Duration::from_secs(5)));
    let pipeline = ExperimentPipeline::new(&config(threshold), cache, gateway, store.clone());
    (pipeline, store)
}

fn request(body: &str) -> GenerationRequest {
    GenerationRequest {
        email_content: body.to_string(),
        original_subject: Some("Weekly digest".to_string()),
        max_variants: Some(3),
        max_length: None,
    }
}

#[tokio::test]
async fn test_repeat_requests_reuse_experiment() {
    let provider = Arc::new(CountingProvider::new());
    let (pipeline, _) = pipeline_with(provider.clone(), local_cache(), 5000);
    let req = request("Here is everything that happened on the team this week.");

    let first = pipeline.generate_or_fetch(&req, &CallContext::new()).await.unwrap();
    let second = pipeline.generate_or_fetch(&req, &CallContext::new()).await.unwrap();

    assert!(!first.from_cache);
    assert!(second.from_cache);
    assert_eq!(first.experiment_id, second.experiment_id);
    assert_eq!(first.variants, second.variants);
    assert_eq!(first.variants.len(), 3);
    assert_eq!(first.placeholders, 0);
    assert_eq!(provider.calls(), 1);

    // Whitespace differences normalise to the same experiment.
    let padded = request("  Here is everything that happened on the team this week.\r\n\r\n");
    let third = pipeline.generate_or_fetch(&padded, &CallContext::new()).await.unwrap();
    assert_eq!(third.experiment_id, first.experiment_id);
    assert_eq!(provider.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_misses_call_provider_once() {
    let provider = Arc::new(CountingProvider {
        latency: Duration::from_millis(200),
        ..CountingProvider::new()
    });
    let (pipeline, _) = pipeline_with(provider.clone(), local_cache(), 5000);
    let pipeline = Arc::new(pipeline);

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let pipeline = pipeline.clone();
            tokio::spawn(async move {
                pipeline
                    .generate_or_fetch(&request("Flash sale on every item in the store today."), &CallContext::new())
                    .await
            })
        })
        .collect();

    let mut ids = Vec::new();
    for task in tasks {
        ids.push(task.await.unwrap().unwrap().experiment_id);
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn test_broken_cache_degrades_to_store() {
    let provider = Arc::new(CountingProvider::new());
    let cache = Arc::new(ContentCache::new(
        vec![Arc::new(BrokenTier)],
        Duration::from_secs(3600),
        Duration::from_millis(50),
    ));
    let (pipeline, _) = pipeline_with(provider.clone(), cache, 5000);
    let req = request("Our quarterly product roadmap is now available to read.");

    let first = pipeline.generate_or_fetch(&req, &CallContext::new()).await.unwrap();
    let second = pipeline.generate_or_fetch(&req, &CallContext::new()).await.unwrap();

    assert_eq!(first.experiment_id, second.experiment_id);
    assert!(second.from_cache);
    assert_eq!(provider.calls(), 1);
    assert_eq!(pipeline.health().status, "degraded");
}

#[tokio::test]
async fn test_generation_failure_creates_nothing() {
    let provider = Arc::new(CountingProvider {
        reject: true,
        ..CountingProvider::new()
    });
    let (pipeline, store) = pipeline_with(provider.clone(), local_cache(), 5000);

    let err = pipeline
        .generate_or_fetch(&request("A message that the provider will refuse."), &CallContext::new())
        .await
        .unwrap_err();
    assert!(matches!(err, InboxError::GatewayUpstream(_)));
    assert_eq!(provider.calls(), 1);
    assert!(store.list_experiments().is_empty());
}

#[tokio::test]
async fn test_invalid_input_never_reaches_provider() {
    let provider = Arc::new(CountingProvider::new());
    let (pipeline, _) = pipeline_with(provider.clone(), local_cache(), 5000);

    let err = pipeline
        .generate_or_fetch(&request("short"), &CallContext::new())
        .await
        .unwrap_err();
    assert!(matches!(err, InboxError::Validation(_)));
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn test_experiment_lifecycle() {
    let provider = Arc::new(CountingProvider::new());
    let (pipeline, _) = pipeline_with(provider, local_cache(), 30);
    let outcome = pipeline
        .generate_or_fetch(&request("Early bird tickets for the spring conference."), &CallContext::new())
        .await
        .unwrap();
    let id = outcome.experiment_id.clone();

    for _ in 0..30 {
        let selected = pipeline.select_variant(&id).unwrap();
        assert_eq!(selected.method, SelectionMethod::RoundRobin);
    }

    let best = VariantId::new(id.clone(), 1);
    for _ in 0..6 {
        pipeline
            .record_event(best.clone(), EventType::Clicked, None, None)
            .unwrap();
    }
    for _ in 0..4 {
        pipeline
            .record_event(VariantId::new(id.clone(), 2), EventType::Opened, Some(Utc::now()), None)
            .unwrap();
    }

    let stats = pipeline.get_stats(&id).unwrap();
    assert_eq!(stats.total_served, 30);
    assert_eq!(stats.phase, Phase::Exploitation);
    assert!(stats.variants.iter().all(|v| v.times_served == 10));
    assert_eq!(stats.variants[1].times_succeeded, 6);
    assert_eq!(stats.variants[2].times_succeeded, 0);
    assert_eq!(stats.variants[2].times_opened, 4);
    assert!(stats.variants[1].confidence_interval.contains(0.6));

    let selected = pipeline.select_variant(&id).unwrap();
    assert_eq!(selected.method, SelectionMethod::ThompsonSampling);

    let dashboard = pipeline.dashboard();
    assert_eq!(dashboard.total_experiments, 1);
    assert_eq!(dashboard.active_experiments, 1);
    assert_eq!(dashboard.total_served, 31);
    assert_eq!(dashboard.total_clicked, 6);
    assert_eq!(dashboard.experiments_created_last_7_days, 1);

    let top = pipeline.top_performers(2, 30, 5);
    assert_eq!(top.len(), 2);
    assert_eq!(top[0].variant_id, best);

    let closed = pipeline.close_experiment(&id).unwrap();
    assert!(!closed.active);
    assert!(matches!(
        pipeline.select_variant(&id),
        Err(InboxError::ExperimentInactive(_))
    ));
    assert!(matches!(
        pipeline.record_event(best, EventType::Served, None, None),
        Err(InboxError::ExperimentInactive(_))
    ));
    assert_eq!(pipeline.dashboard().active_experiments, 0);
}

#[tokio::test]
async fn test_reset_and_unknown_experiment() {
    let provider = Arc::new(CountingProvider::new());
    let (pipeline, _) = pipeline_with(provider, local_cache(), 5000);
    let outcome = pipeline
        .generate_or_fetch(&request("Your monthly statement is ready to download."), &CallContext::new())
        .await
        .unwrap();
    pipeline.select_variant(&outcome.experiment_id).unwrap();

    let reset = pipeline.reset_experiment(&outcome.experiment_id).unwrap();
    assert_eq!(reset.total_served, 0);

    let unknown = VariantId::new(outcome.experiment_id.clone(), 9);
    assert!(matches!(
        pipeline.record_event(unknown, EventType::Served, None, None),
        Err(InboxError::VariantNotFound(_))
    ));
}

#[tokio::test]
async fn test_store_outlives_cache() {
    let provider = Arc::new(CountingProvider::new());
    let empty_cache = Arc::new(ContentCache::new(
        Vec::new(),
        Duration::from_secs(3600),
        Duration::from_millis(250),
    ));
    let (pipeline, store) = pipeline_with(provider.clone(), empty_cache, 5000);
    let req = request("A reminder that your subscription renews next week.");

    let first = pipeline.generate_or_fetch(&req, &CallContext::new()).await.unwrap();
    let second = pipeline.generate_or_fetch(&req, &CallContext::new()).await.unwrap();
    assert_eq!(first.experiment_id, second.experiment_id);
    assert_eq!(provider.calls(), 1);
    assert_eq!(store.list_experiments().len(), 1);
}

#[tokio::test]
async fn test_unusable_cache_entries_regenerate() {
    let too_few = vec![DraftVariant {
        text: "Only one".to_string(),
        placeholder: false,
    }];
    for variants in [Vec::new(), too_few] {
        let provider = Arc::new(CountingProvider::new());
        let cache = Arc::new(ContentCache::new(
            vec![Arc::new(StaleTier { variants })],
            Duration::from_secs(3600),
            Duration::from_millis(250),
        ));
        let (pipeline, store) = pipeline_with(provider.clone(), cache, 5000);

        let outcome = pipeline
            .generate_or_fetch(&request("Spring cleaning deals across the whole catalogue."), &CallContext::new())
            .await
            .unwrap();
        assert!(!outcome.from_cache);
        assert_eq!(outcome.variants.len(), 3);
        assert_eq!(provider.calls(), 1);
        assert_eq!(store.list_experiments().len(), 1);
    }
}

#[tokio::test]
async fn test_comparison_and_variant_performance() {
    let provider = Arc::new(CountingProvider::new());
    let (pipeline, _) = pipeline_with(provider, local_cache(), 5000);
    let id = pipeline
        .generate_or_fetch(&request("Members get early access to the summer sale."), &CallContext::new())
        .await
        .unwrap()
        .experiment_id;

    let early = pipeline.experiment_comparison(&id).unwrap();
    assert!(early.winner.is_none());

    for _ in 0..300 {
        pipeline.select_variant(&id).unwrap();
    }
    for (index, clicks) in [(0u32, 30), (1, 10), (2, 20)] {
        for _ in 0..clicks {
            pipeline
                .record_event(VariantId::new(id.clone(), index), EventType::Clicked, None, None)
                .unwrap();
        }
    }

    let comparison = pipeline.experiment_comparison(&id).unwrap();
    assert_eq!(comparison.total_variants, 3);
    assert_eq!(comparison.total_served, 300);
    let order: Vec<u32> = comparison.variants.iter().map(|v| v.id.index).collect();
    assert_eq!(order, vec![0, 2, 1]);
    let winner = comparison.winner.unwrap();
    assert_eq!(winner.variant_id, VariantId::new(id.clone(), 0));
    assert!((winner.improvement_pct - 100.0).abs() < 1e-9);

    let performance = pipeline
        .variant_performance(&VariantId::new(id.clone(), 0))
        .unwrap();
    assert_eq!(performance.lifetime.times_served, 100);
    assert_eq!(performance.recent_activity.period_hours, 24);
    assert_eq!(performance.recent_activity.events.served, 100);
    assert_eq!(performance.recent_activity.events.clicked, 30);
    assert!(matches!(
        pipeline.variant_performance(&VariantId::new(id.clone(), 7)),
        Err(InboxError::VariantNotFound(_))
    ));

    let dashboard = pipeline.dashboard();
    assert_eq!(dashboard.total_variants, 3);
    assert_eq!(dashboard.completed_experiments, 0);
    assert_eq!(dashboard.recent.period_days, 7);
    assert_eq!(dashboard.recent.served, 300);
    assert!((dashboard.recent.click_rate - 0.2).abs() < 1e-9);
    let top = dashboard.top_performer.unwrap();
    assert_eq!(top.variant_id, VariantId::new(id.clone(), 0));

    pipeline.close_experiment(&id).unwrap();
    assert_eq!(pipeline.dashboard().completed_experiments, 1);
}
