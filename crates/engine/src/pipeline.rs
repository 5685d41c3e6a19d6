//! Experiment pipeline: the facade over cache, gateway, store and bandit.
//!
//! Generation resolves an input to its experiment in three steps: content
//! cache, then the experiment store (which may outlive its cache entry), and
//! only then the generation gateway. Concurrent misses on the same input are
//! single-flighted so the provider is called once.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use inbox_bandit::BanditEngine;
use inbox_cache::ContentCache;
use inbox_core::config::AppConfig;
use inbox_core::content::GenerationOptions;
use inbox_core::types::{
    Ack, CachedResult, DraftVariant, EventType, Experiment, ExperimentDraft, ExperimentId,
    ExperimentStats, SelectedVariant, VariantId,
};
use inbox_core::{GenerationRequest, InboxError, InboxResult, NormalizedInput};
use inbox_gateway::{provider_from_config, CallContext, GenerationGateway};
use inbox_store::{EventRecorder, ExperimentStore, MemoryStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One variant as returned to a generation caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedSubject {
    pub variant_id: VariantId,
    pub text: String,
    pub placeholder: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateOutcome {
    pub experiment_id: ExperimentId,
    pub variants: Vec<GeneratedSubject>,
    /// The provider was not called for this request.
    pub from_cache: bool,
    pub placeholders: usize,
}

impl GenerateOutcome {
    fn from_experiment(experiment: &Experiment, from_cache: bool) -> Self {
        let variants: Vec<GeneratedSubject> = experiment
            .variants
            .iter()
            .map(|v| GeneratedSubject {
                variant_id: v.id.clone(),
                text: v.text.clone(),
                placeholder: v.placeholder,
            })
            .collect();
        Self {
            experiment_id: experiment.id.clone(),
            placeholders: variants.iter().filter(|v| v.placeholder).count(),
            variants,
            from_cache,
        }
    }
}

pub struct ExperimentPipeline {
    pub(crate) cache: Arc<ContentCache>,
    gateway: Arc<GenerationGateway>,
    pub(crate) store: Arc<dyn ExperimentStore>,
    pub(crate) bandit: BanditEngine,
    recorder: EventRecorder,
    defaults: GenerationOptions,
    inflight: DashMap<ExperimentId, Arc<AsyncMutex<()>>>,
}

impl ExperimentPipeline {
    pub fn new(
        config: &AppConfig,
        cache: Arc<ContentCache>,
        gateway: Arc<GenerationGateway>,
        store: Arc<dyn ExperimentStore>,
    ) -> Self {
        Self {
            bandit: BanditEngine::new(store.clone(), &config.bandit),
            recorder: EventRecorder::new(store.clone()),
            defaults: GenerationOptions {
                max_variants: config.generation.max_variants,
                max_length: config.generation.max_length,
            },
            inflight: DashMap::new(),
            cache,
            gateway,
            store,
        }
    }

    /// Assemble the standard stack described by `config`.
    pub async fn from_config(config: &AppConfig) -> InboxResult<Self> {
        let store: Arc<dyn ExperimentStore> = Arc::new(MemoryStore::from_config(&config.store)?);
        let cache = Arc::new(ContentCache::from_config(&config.cache).await);
        let provider = provider_from_config(&config.gateway)?;
        let gateway = Arc::new(GenerationGateway::from_config(provider, &config.gateway));
        info!(
            provider = gateway.provider_name(),
            store = store.durability(),
            "Experiment pipeline ready"
        );
        Ok(Self::new(config, cache, gateway, store))
    }

    /// Resolve a request to its experiment, generating variants only when
    /// neither the cache nor the store knows the input.
    pub async fn generate_or_fetch(
        &self,
        request: &GenerationRequest,
        ctx: &CallContext,
    ) -> InboxResult<GenerateOutcome> {
        let input = NormalizedInput::new(request, self.defaults)?;
        let id = input.experiment_id();
        metrics::counter!("pipeline.generate_requests").increment(1);

        if let Some(outcome) = self.fetch_existing(&input, &id).await {
            return Ok(outcome);
        }

        let flight = InflightSlot::claim(&self.inflight, &id);
        let _turn = flight.lock().await;
        // A concurrent caller may have finished while we waited.
        match self.fetch_existing(&input, &id).await {
            Some(outcome) => Ok(outcome),
            None => self.generate_new(&input, &id, ctx).await,
        }
    }

    /// Existing experiment for `id`, from the cache or the store.
    ///
    /// Never fails: a cached entry that does not fit the input is treated as
    /// a miss, and a store error while adopting one only costs a regeneration.
    async fn fetch_existing(&self, input: &NormalizedInput, id: &ExperimentId) -> Option<GenerateOutcome> {
        if let Some(cached) = self.cache.lookup(id.as_str()).await {
            if let Err(reason) = check_cached(&cached, input, id) {
                metrics::counter!("pipeline.cache_rejected").increment(1);
                warn!(experiment_id = %id, reason = reason, "Ignoring unusable cache entry");
            } else if let Some(experiment) = self.adopt_cached(input, id, cached) {
                metrics::counter!("pipeline.cache_hits").increment(1);
                return Some(GenerateOutcome::from_experiment(&experiment, true));
            }
        }

        if let Some(experiment) = self.store.get_experiment(id) {
            debug!(experiment_id = %id, "Cache miss, experiment found in store");
            self.populate_cache(&experiment).await;
            return Some(GenerateOutcome::from_experiment(&experiment, true));
        }
        None
    }

    fn adopt_cached(
        &self,
        input: &NormalizedInput,
        id: &ExperimentId,
        cached: CachedResult,
    ) -> Option<Experiment> {
        if let Some(experiment) = self.store.get_experiment(id) {
            return Some(experiment);
        }
        // The cache outlived the store (e.g. an in-memory store restarted
        // against a shared Redis); adopt the cached texts.
        warn!(experiment_id = %id, "Cached variants without experiment, recreating");
        match self.store.create_experiment(draft(input, id, cached.variants)) {
            Ok((experiment, _)) => Some(experiment),
            Err(e) => {
                warn!(experiment_id = %id, error = %e, "Could not adopt cached variants");
                None
            }
        }
    }

    async fn generate_new(
        &self,
        input: &NormalizedInput,
        id: &ExperimentId,
        ctx: &CallContext,
    ) -> InboxResult<GenerateOutcome> {
        let generated = match self.gateway.generate(input, ctx).await {
            Ok(generated) => generated,
            Err(e) => {
                metrics::counter!("pipeline.generation_failures").increment(1);
                warn!(experiment_id = %id, error = %e, "Variant generation failed");
                return Err(e.into());
            }
        };

        let (experiment, created) = self
            .store
            .create_experiment(draft(input, id, generated.variants))?;
        self.populate_cache(&experiment).await;

        info!(
            experiment_id = %id,
            provider = %generated.provider,
            attempts = generated.attempts,
            placeholders = generated.placeholders,
            created = created,
            "Experiment generated"
        );
        Ok(GenerateOutcome::from_experiment(&experiment, false))
    }

    async fn populate_cache(&self, experiment: &Experiment) {
        let result = CachedResult {
            experiment_id: experiment.id.clone(),
            variants: experiment
                .variants
                .iter()
                .map(|v| DraftVariant {
                    text: v.text.clone(),
                    placeholder: v.placeholder,
                })
                .collect(),
            // Overwritten by the cache from its TTL.
            expires_at: Utc::now(),
        };
        self.cache.store(experiment.id.as_str(), result, None).await;
    }

    pub fn select_variant(&self, experiment_id: &ExperimentId) -> InboxResult<SelectedVariant> {
        self.bandit.select_variant(experiment_id)
    }

    pub fn record_event(
        &self,
        variant_id: VariantId,
        event_type: EventType,
        timestamp: Option<DateTime<Utc>>,
        event_id: Option<Uuid>,
    ) -> InboxResult<Ack> {
        self.recorder.record(
            variant_id,
            event_type,
            timestamp.unwrap_or_else(Utc::now),
            event_id,
        )
    }

    pub fn get_stats(&self, experiment_id: &ExperimentId) -> InboxResult<ExperimentStats> {
        let experiment = self.experiment(experiment_id)?;
        Ok(self.bandit.experiment_stats(&experiment))
    }

    pub fn close_experiment(&self, experiment_id: &ExperimentId) -> InboxResult<ExperimentStats> {
        let experiment = self.store.close_experiment(experiment_id)?;
        Ok(self.bandit.experiment_stats(&experiment))
    }

    pub fn reset_experiment(&self, experiment_id: &ExperimentId) -> InboxResult<ExperimentStats> {
        let experiment = self.store.reset_counters(experiment_id)?;
        Ok(self.bandit.experiment_stats(&experiment))
    }

    /// Sweep expired cache entries; returns how many were evicted.
    pub async fn cache_maintenance(&self) -> usize {
        self.cache.maintenance().await
    }

    pub(crate) fn experiment(&self, experiment_id: &ExperimentId) -> InboxResult<Experiment> {
        self.store
            .get_experiment(experiment_id)
            .ok_or_else(|| InboxError::ExperimentNotFound(experiment_id.to_string()))
    }
}

/// Why a cached entry cannot stand in for `input`, if it cannot.
fn check_cached(cached: &CachedResult, input: &NormalizedInput, id: &ExperimentId) -> Result<(), &'static str> {
    let options = input.options();
    if &cached.experiment_id != id {
        return Err("experiment id does not match key");
    }
    if cached.variants.len() != options.max_variants {
        return Err("variant count does not match request");
    }
    let fits = |text: &str| {
        let chars = text.chars().count();
        chars > 0 && chars <= options.max_length
    };
    if !cached.variants.iter().all(|v| fits(&v.text)) {
        return Err("variant text out of bounds");
    }
    Ok(())
}

/// Membership in the single-flight map for one key. Dropping it, even when
/// the owning future is cancelled, removes the key once no one else holds it.
struct InflightSlot<'a> {
    inflight: &'a DashMap<ExperimentId, Arc<AsyncMutex<()>>>,
    id: &'a ExperimentId,
    lock: Option<Arc<AsyncMutex<()>>>,
}

impl<'a> InflightSlot<'a> {
    fn claim(inflight: &'a DashMap<ExperimentId, Arc<AsyncMutex<()>>>, id: &'a ExperimentId) -> Self {
        let lock = inflight.entry(id.clone()).or_default().clone();
        Self {
            inflight,
            id,
            lock: Some(lock),
        }
    }

    async fn lock(&self) -> Option<tokio::sync::MutexGuard<'_, ()>> {
        match &self.lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        }
    }
}

impl Drop for InflightSlot<'_> {
    fn drop(&mut self) {
        drop(self.lock.take());
        self.inflight
            .remove_if(self.id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

fn draft(input: &NormalizedInput, id: &ExperimentId, variants: Vec<DraftVariant>) -> ExperimentDraft {
    ExperimentDraft {
        id: id.clone(),
        source_text: input.content().to_string(),
        original_subject: input.original_subject().map(str::to_string),
        variants,
    }
}
