use crate::sampling::posterior_sample;
use inbox_core::types::{Experiment, Phase, SelectionMethod, Variant};
use inbox_core::{InboxError, InboxResult};
use inbox_store::VariantSelector;
use rand::Rng;

/// Round-robin until an experiment has served `exploration_threshold`
/// impressions in total, Thompson sampling from then on.
#[derive(Debug, Clone, Copy)]
pub struct TwoPhasePolicy {
    exploration_threshold: u64,
}

impl TwoPhasePolicy {
    pub fn new(exploration_threshold: u64) -> Self {
        Self {
            exploration_threshold,
        }
    }

    pub fn exploration_threshold(&self) -> u64 {
        self.exploration_threshold
    }

    pub fn phase(&self, total_served: u64) -> Phase {
        if total_served < self.exploration_threshold {
            Phase::Exploration
        } else {
            Phase::Exploitation
        }
    }

    /// Pick a variant using the supplied RNG. Exploration never touches it.
    pub fn choose_with<R: Rng + ?Sized>(
        &self,
        experiment: &Experiment,
        rng: &mut R,
    ) -> InboxResult<(usize, SelectionMethod)> {
        if experiment.variants.is_empty() {
            return Err(InboxError::Validation(format!(
                "experiment {} has no variants",
                experiment.id
            )));
        }

        match self.phase(experiment.total_served()) {
            Phase::Exploration => Ok((least_served(&experiment.variants), SelectionMethod::RoundRobin)),
            Phase::Exploitation => Ok((
                thompson(&experiment.variants, rng),
                SelectionMethod::ThompsonSampling,
            )),
        }
    }
}

impl VariantSelector for TwoPhasePolicy {
    fn choose(&self, experiment: &Experiment) -> InboxResult<(usize, SelectionMethod)> {
        self.choose_with(experiment, &mut rand::thread_rng())
    }
}

/// Lowest `times_served`, ties to the lowest index.
fn least_served(variants: &[Variant]) -> usize {
    variants
        .iter()
        .enumerate()
        .min_by_key(|(index, v)| (v.counters.times_served, *index))
        .map(|(index, _)| index)
        .unwrap_or(0)
}

/// One posterior draw per variant from clicks and serves; opens are ignored.
fn thompson<R: Rng + ?Sized>(variants: &[Variant], rng: &mut R) -> usize {
    let mut best_sample = f64::NEG_INFINITY;
    let mut best = 0;
    for (index, variant) in variants.iter().enumerate() {
        let sample = posterior_sample(
            rng,
            variant.counters.times_served,
            variant.counters.times_succeeded,
        );
        if sample > best_sample {
            best_sample = sample;
            best = index;
        }
    }
    best
}
