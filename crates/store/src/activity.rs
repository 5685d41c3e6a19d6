//! Hourly event tallies per variant over a bounded retention window.

use chrono::{DateTime, Duration, Utc};
use inbox_core::types::{EventCounts, EventType};
use std::collections::BTreeMap;

/// Hours of activity kept per experiment.
pub const ACTIVITY_RETENTION_HOURS: i64 = 24;

const SECS_PER_HOUR: i64 = 3600;

fn hour_of(at: DateTime<Utc>) -> i64 {
    at.timestamp().div_euclid(SECS_PER_HOUR)
}

/// Per-hour buckets of event counts, one slot per variant.
#[derive(Debug, Default)]
pub(crate) struct ActivityLog {
    buckets: BTreeMap<i64, Vec<EventCounts>>,
}

impl ActivityLog {
    fn oldest_kept_hour(now: DateTime<Utc>) -> i64 {
        hour_of(now) - ACTIVITY_RETENTION_HOURS
    }

    /// Count one event. Events older than the retention window are ignored.
    pub(crate) fn record(
        &mut self,
        variant_index: usize,
        event_type: EventType,
        at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        let oldest = Self::oldest_kept_hour(now);
        let hour = hour_of(at);
        if hour < oldest {
            return;
        }
        if self.buckets.first_key_value().is_some_and(|(h, _)| *h < oldest) {
            self.buckets = self.buckets.split_off(&oldest);
        }

        let slots = self.buckets.entry(hour).or_default();
        if slots.len() <= variant_index {
            slots.resize(variant_index + 1, EventCounts::default());
        }
        slots[variant_index].add(event_type);
    }

    /// Events for one variant since `now - window`, at hour granularity.
    /// The window is clamped to the retention period.
    pub(crate) fn since(&self, variant_index: usize, window: Duration, now: DateTime<Utc>) -> EventCounts {
        let from = hour_of(now - window).max(Self::oldest_kept_hour(now));
        let mut total = EventCounts::default();
        for slots in self.buckets.range(from..).map(|(_, slots)| slots) {
            if let Some(counts) = slots.get(variant_index) {
                total.merge(counts);
            }
        }
        total
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}
