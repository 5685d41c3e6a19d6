use crate::pipeline::ExperimentPipeline;
use chrono::{DateTime, Duration, Utc};
use inbox_core::types::{
    rate, DashboardMetrics, Experiment, ExperimentComparison, ExperimentId, RecentActivity,
    RecentPerformance, TopPerformer, VariantId, VariantPerformance, Winner,
};
use inbox_core::{InboxError, InboxResult};
use serde::{Deserialize, Serialize};

const DASHBOARD_RECENT_DAYS: i64 = 7;

/// Serves a variant needs before it can be called a winner or top performer.
pub const MIN_DECISION_SERVES: u64 = 100;

const VARIANT_ACTIVITY_HOURS: i64 = 24;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// `healthy`, or `degraded` when the cache has no network tier.
    pub status: String,
    pub store: String,
    pub cache_tiers: Vec<String>,
    pub experiments: usize,
}

impl ExperimentPipeline {
    /// Totals across every experiment.
    pub fn dashboard(&self) -> DashboardMetrics {
        let experiments = self.store.list_experiments();
        let recent_cutoff = Utc::now() - Duration::days(DASHBOARD_RECENT_DAYS);

        let mut metrics = DashboardMetrics {
            total_experiments: experiments.len(),
            recent: RecentPerformance {
                period_days: DASHBOARD_RECENT_DAYS as u32,
                ..RecentPerformance::default()
            },
            ..DashboardMetrics::default()
        };
        for experiment in &experiments {
            if experiment.active {
                metrics.active_experiments += 1;
            } else {
                metrics.completed_experiments += 1;
            }
            metrics.total_variants += experiment.variants.len();
            let recent = experiment.created_at >= recent_cutoff;
            if recent {
                metrics.experiments_created_last_7_days += 1;
            }
            for variant in &experiment.variants {
                let c = variant.counters;
                metrics.total_served += c.times_served;
                metrics.total_opened += c.times_opened;
                metrics.total_clicked += c.times_succeeded;
                if recent {
                    metrics.recent.served += c.times_served;
                    metrics.recent.opened += c.times_opened;
                    metrics.recent.clicked += c.times_succeeded;
                }
            }
        }
        metrics.overall_open_rate = rate(metrics.total_opened, metrics.total_served);
        metrics.overall_click_rate = rate(metrics.total_clicked, metrics.total_served);
        metrics.recent.open_rate = rate(metrics.recent.opened, metrics.recent.served);
        metrics.recent.click_rate = rate(metrics.recent.clicked, metrics.recent.served);
        metrics.top_performer = ranked(experiments, None, MIN_DECISION_SERVES).into_iter().next();
        metrics
    }

    /// Best variants by click rate among experiments created in the last
    /// `days` days. Variants with fewer than `min_served` serves are ignored;
    /// ties go to the more-served variant.
    pub fn top_performers(&self, limit: usize, days: u32, min_served: u64) -> Vec<TopPerformer> {
        let cutoff = Utc::now() - Duration::days(i64::from(days));
        let mut performers = ranked(self.store.list_experiments(), Some(cutoff), min_served);
        performers.truncate(limit);
        performers
    }

    /// Variants of one experiment ranked by click rate, with a winner once the
    /// leader has been served at least [`MIN_DECISION_SERVES`] times.
    pub fn experiment_comparison(&self, experiment_id: &ExperimentId) -> InboxResult<ExperimentComparison> {
        let experiment = self.experiment(experiment_id)?;
        let mut variants = self.bandit.experiment_stats(&experiment).variants;
        variants.sort_by(|a, b| {
            b.click_rate
                .total_cmp(&a.click_rate)
                .then_with(|| b.times_served.cmp(&a.times_served))
                .then_with(|| a.id.cmp(&b.id))
        });

        let winner = variants
            .split_first()
            .filter(|(leader, _)| leader.times_served >= MIN_DECISION_SERVES)
            .map(|(leader, rest)| {
                let mean = if rest.is_empty() {
                    0.0
                } else {
                    rest.iter().map(|v| v.click_rate).sum::<f64>() / rest.len() as f64
                };
                let improvement_pct = if mean > 0.0 {
                    (leader.click_rate - mean) / mean * 100.0
                } else {
                    0.0
                };
                Winner {
                    variant_id: leader.id.clone(),
                    text: leader.text.clone(),
                    click_rate: leader.click_rate,
                    improvement_pct,
                }
            });

        Ok(ExperimentComparison {
            experiment_id: experiment.id.clone(),
            active: experiment.active,
            created_at: experiment.created_at,
            total_variants: variants.len(),
            total_served: experiment.total_served(),
            variants,
            winner,
        })
    }

    /// Lifetime metrics of one variant and its events over the last day.
    pub fn variant_performance(&self, variant_id: &VariantId) -> InboxResult<VariantPerformance> {
        let experiment = self.experiment(&variant_id.experiment_id)?;
        let lifetime = self
            .bandit
            .experiment_stats(&experiment)
            .variants
            .into_iter()
            .find(|v| &v.id == variant_id)
            .ok_or_else(|| InboxError::VariantNotFound(variant_id.to_string()))?;
        let events = self
            .store
            .recent_activity(variant_id, Duration::hours(VARIANT_ACTIVITY_HOURS))?;

        Ok(VariantPerformance {
            experiment_id: experiment.id.clone(),
            experiment_active: experiment.active,
            lifetime,
            recent_activity: RecentActivity {
                period_hours: VARIANT_ACTIVITY_HOURS as u32,
                events,
            },
        })
    }

    pub fn health(&self) -> HealthReport {
        let cache_tiers = self.cache.tier_names();
        let networked = cache_tiers.iter().any(|t| t == "redis");
        HealthReport {
            status: if networked { "healthy" } else { "degraded" }.to_string(),
            store: self.store.durability().to_string(),
            cache_tiers,
            experiments: self.store.list_experiments().len(),
        }
    }
}

/// Non-placeholder variants served at least `max(min_served, 1)` times,
/// best click rate first.
fn ranked(
    experiments: Vec<Experiment>,
    created_after: Option<DateTime<Utc>>,
    min_served: u64,
) -> Vec<TopPerformer> {
    let mut performers: Vec<TopPerformer> = experiments
        .into_iter()
        .filter(|experiment| created_after.map_or(true, |cutoff| experiment.created_at >= cutoff))
        .flat_map(|experiment| {
            let created_at = experiment.created_at;
            experiment
                .variants
                .into_iter()
                .filter(move |v| !v.placeholder && v.counters.times_served >= min_served.max(1))
                .map(move |v| TopPerformer {
                    click_rate: rate(v.counters.times_succeeded, v.counters.times_served),
                    open_rate: rate(v.counters.times_opened, v.counters.times_served),
                    variant_id: v.id,
                    text: v.text,
                    times_served: v.counters.times_served,
                    times_succeeded: v.counters.times_succeeded,
                    experiment_created_at: created_at,
                })
        })
        .collect();

    performers.sort_by(|a, b| {
        b.click_rate
            .total_cmp(&a.click_rate)
            .then_with(|| b.times_served.cmp(&a.times_served))
            .then_with(|| a.variant_id.cmp(&b.variant_id))
    });
    performers
}
