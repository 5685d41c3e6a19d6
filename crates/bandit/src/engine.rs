use crate::policy::TwoPhasePolicy;
use crate::wilson::wilson_interval;
use inbox_core::config::BanditConfig;
use inbox_core::types::{
    rate, Experiment, ExperimentId, ExperimentStats, Interval, Phase, SelectedVariant, SelectionMethod,
    VariantId, VariantStats,
};
use inbox_core::{InboxError, InboxResult};
use inbox_store::ExperimentStore;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Variant selection and statistics over the experiment store.
pub struct BanditEngine {
    store: Arc<dyn ExperimentStore>,
    policy: TwoPhasePolicy,
    z_score: f64,
}

impl BanditEngine {
    pub fn new(store: Arc<dyn ExperimentStore>, config: &BanditConfig) -> Self {
        Self {
            store,
            policy: TwoPhasePolicy::new(config.exploration_threshold),
            z_score: config.z_score,
        }
    }

    pub fn policy(&self) -> &TwoPhasePolicy {
        &self.policy
    }

    /// Choose the next variant and count the serve.
    pub fn select_variant(&self, experiment_id: &ExperimentId) -> InboxResult<SelectedVariant> {
        let selected = self.store.select_and_serve(experiment_id, &self.policy)?;
        let method = match selected.method {
            SelectionMethod::RoundRobin => "round_robin",
            SelectionMethod::ThompsonSampling => "thompson_sampling",
        };
        metrics::counter!("bandit.selections", "method" => method).increment(1);
        debug!(
            experiment_id = %experiment_id,
            variant_id = %selected.variant_id,
            method = method,
            "Variant selected"
        );
        Ok(selected)
    }

    pub fn phase(&self, experiment: &Experiment) -> Phase {
        self.policy.phase(experiment.total_served())
    }

    /// Wilson interval on the click rate of every variant.
    pub fn confidence_intervals(
        &self,
        experiment_id: &ExperimentId,
    ) -> InboxResult<BTreeMap<VariantId, Interval>> {
        let experiment = self
            .store
            .get_experiment(experiment_id)
            .ok_or_else(|| InboxError::ExperimentNotFound(experiment_id.to_string()))?;
        Ok(experiment
            .variants
            .iter()
            .map(|v| {
                (
                    v.id.clone(),
                    wilson_interval(v.counters.times_succeeded, v.counters.times_served, self.z_score),
                )
            })
            .collect())
    }

    /// Per-variant rates and intervals for a snapshot of an experiment.
    pub fn experiment_stats(&self, experiment: &Experiment) -> ExperimentStats {
        let variants = experiment
            .variants
            .iter()
            .map(|v| {
                let c = v.counters;
                VariantStats {
                    id: v.id.clone(),
                    text: v.text.clone(),
                    placeholder: v.placeholder,
                    times_served: c.times_served,
                    times_succeeded: c.times_succeeded,
                    times_opened: c.times_opened,
                    click_rate: rate(c.times_succeeded, c.times_served),
                    open_rate: rate(c.times_opened, c.times_served),
                    confidence_interval: wilson_interval(c.times_succeeded, c.times_served, self.z_score),
                }
            })
            .collect();

        ExperimentStats {
            experiment_id: experiment.id.clone(),
            active: experiment.active,
            created_at: experiment.created_at,
            phase: self.phase(experiment),
            total_served: experiment.total_served(),
            variants,
        }
    }
}
