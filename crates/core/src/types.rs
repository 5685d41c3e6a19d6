use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::InboxError;

// ─── Identifiers ────────────────────────────────────────────────────────

/// Content-addressed experiment identifier (hex SHA-256 of the canonical input).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExperimentId(String);

impl ExperimentId {
    pub(crate) fn from_digest(digest: String) -> Self {
        Self(digest)
    }

    /// Parse an id received from outside (API path, event payload).
    pub fn parse(raw: &str) -> Result<Self, InboxError> {
        let raw = raw.trim();
        if raw.len() == 64 && raw.chars().all(|c| c.is_ascii_hexdigit()) {
            Ok(Self(raw.to_ascii_lowercase()))
        } else {
            Err(InboxError::Validation(format!(
                "malformed experiment id: {raw}"
            )))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExperimentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Variant identifier: the owning experiment plus the variant's ordinal.
/// Rendered as `<experiment_id>:<index>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VariantId {
    pub experiment_id: ExperimentId,
    pub index: u32,
}

impl VariantId {
    pub fn new(experiment_id: ExperimentId, index: u32) -> Self {
        Self {
            experiment_id,
            index,
        }
    }
}

impl fmt::Display for VariantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.experiment_id, self.index)
    }
}

impl FromStr for VariantId {
    type Err = InboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (experiment, index) = s
            .rsplit_once(':')
            .ok_or_else(|| InboxError::Validation(format!("malformed variant id: {s}")))?;
        let index = index
            .parse::<u32>()
            .map_err(|_| InboxError::Validation(format!("malformed variant index: {s}")))?;
        Ok(Self::new(ExperimentId::parse(experiment)?, index))
    }
}

impl TryFrom<String> for VariantId {
    type Error = InboxError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<VariantId> for String {
    fn from(value: VariantId) -> Self {
        value.to_string()
    }
}

// ─── Experiments ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    pub id: ExperimentId,
    pub source_text: String,
    pub original_subject: Option<String>,
    pub created_at: DateTime<Utc>,
    pub active: bool,
    pub closed_at: Option<DateTime<Utc>>,
    pub variants: Vec<Variant>,
}

impl Experiment {
    pub fn total_served(&self) -> u64 {
        self.variants.iter().map(|v| v.counters.times_served).sum()
    }

    pub fn variant(&self, index: u32) -> Option<&Variant> {
        self.variants.get(index as usize)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variant {
    pub id: VariantId,
    pub text: String,
    /// Synthesised to pad a short provider response.
    #[serde(default)]
    pub placeholder: bool,
    #[serde(default)]
    pub counters: VariantCounters,
}

/// Outcome counters for one variant. `times_succeeded <= times_served` holds
/// at all times.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantCounters {
    pub times_served: u64,
    pub times_succeeded: u64,
    /// Reporting only; never feeds variant selection.
    pub times_opened: u64,
}

/// Input to experiment creation.
#[derive(Debug, Clone)]
pub struct ExperimentDraft {
    pub id: ExperimentId,
    pub source_text: String,
    pub original_subject: Option<String>,
    pub variants: Vec<DraftVariant>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftVariant {
    pub text: String,
    #[serde(default)]
    pub placeholder: bool,
}

// ─── Events ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// The variant was delivered.
    Served,
    /// Weak engagement; recorded for reporting only.
    Opened,
    /// Strong engagement; the bandit's success signal.
    Clicked,
}

impl FromStr for EventType {
    type Err = InboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "served" | "sent" => Ok(EventType::Served),
            "opened" | "open" => Ok(EventType::Opened),
            "clicked" | "click" => Ok(EventType::Clicked),
            other => Err(InboxError::Validation(format!("unknown event type: {other}"))),
        }
    }
}

/// Write-once outcome record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeEvent {
    pub event_id: Uuid,
    pub variant_id: VariantId,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
}

impl OutcomeEvent {
    pub fn new(variant_id: VariantId, event_type: EventType, timestamp: DateTime<Utc>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            variant_id,
            event_type,
            timestamp,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    pub event_id: Uuid,
    /// The event id had already been applied; nothing changed.
    pub duplicate: bool,
    pub counters: VariantCounters,
}

// ─── Cache ──────────────────────────────────────────────────────────────

/// Expendable copy of an experiment's variants, addressed by experiment id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResult {
    pub experiment_id: ExperimentId,
    pub variants: Vec<DraftVariant>,
    /// Logical expiry, checked on every read whatever tier served the entry.
    pub expires_at: DateTime<Utc>,
}

impl CachedResult {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

// ─── Bandit ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMethod {
    RoundRobin,
    ThompsonSampling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Exploration,
    Exploitation,
}

/// Closed confidence interval on a success rate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    pub lower: f64,
    pub upper: f64,
}

impl Interval {
    pub const ZERO: Interval = Interval {
        lower: 0.0,
        upper: 0.0,
    };

    pub fn contains(&self, value: f64) -> bool {
        value >= self.lower && value <= self.upper
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectedVariant {
    pub variant_id: VariantId,
    pub text: String,
    pub method: SelectionMethod,
    pub counters: VariantCounters,
}

// ─── Reporting ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantStats {
    pub id: VariantId,
    pub text: String,
    pub placeholder: bool,
    pub times_served: u64,
    pub times_succeeded: u64,
    pub times_opened: u64,
    pub click_rate: f64,
    pub open_rate: f64,
    pub confidence_interval: Interval,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentStats {
    pub experiment_id: ExperimentId,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub phase: Phase,
    pub total_served: u64,
    pub variants: Vec<VariantStats>,
}

/// Per-type event tallies over some window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCounts {
    pub served: u64,
    pub opened: u64,
    pub clicked: u64,
}

impl EventCounts {
    pub fn add(&mut self, event_type: EventType) {
        match event_type {
            EventType::Served => self.served += 1,
            EventType::Opened => self.opened += 1,
            EventType::Clicked => self.clicked += 1,
        }
    }

    pub fn merge(&mut self, other: &EventCounts) {
        self.served += other.served;
        self.opened += other.opened;
        self.clicked += other.clicked;
    }
}

/// Aggregate counters of experiments created within the last `period_days`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecentPerformance {
    pub period_days: u32,
    pub served: u64,
    pub opened: u64,
    pub clicked: u64,
    pub open_rate: f64,
    pub click_rate: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DashboardMetrics {
    pub total_experiments: usize,
    pub active_experiments: usize,
    pub completed_experiments: usize,
    pub total_variants: usize,
    pub total_served: u64,
    pub total_opened: u64,
    pub total_clicked: u64,
    pub overall_open_rate: f64,
    pub overall_click_rate: f64,
    pub experiments_created_last_7_days: usize,
    pub recent: RecentPerformance,
    /// Best click rate among variants with enough serves to judge.
    pub top_performer: Option<TopPerformer>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentActivity {
    pub period_hours: u32,
    pub events: EventCounts,
}

/// Lifetime metrics of one variant plus its recent event activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantPerformance {
    pub experiment_id: ExperimentId,
    pub experiment_active: bool,
    pub lifetime: VariantStats,
    pub recent_activity: RecentActivity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Winner {
    pub variant_id: VariantId,
    pub text: String,
    pub click_rate: f64,
    /// Percent improvement over the mean click rate of the other variants;
    /// zero when that mean is zero or there are no other variants.
    pub improvement_pct: f64,
}

/// Variants of one experiment ranked by click rate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentComparison {
    pub experiment_id: ExperimentId,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub total_variants: usize,
    pub total_served: u64,
    pub variants: Vec<VariantStats>,
    pub winner: Option<Winner>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopPerformer {
    pub variant_id: VariantId,
    pub text: String,
    pub times_served: u64,
    pub times_succeeded: u64,
    pub click_rate: f64,
    pub open_rate: f64,
    pub experiment_created_at: DateTime<Utc>,
}

/// Rate with a zero-denominator guard.
pub fn rate(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn experiment_id() -> ExperimentId {
        ExperimentId::parse(&"ab".repeat(32)).unwrap()
    }

    #[test]
    fn test_variant_id_round_trips_through_string() {
        let id = VariantId::new(experiment_id(), 3);
        let rendered = id.to_string();
        assert_eq!(rendered, format!("{}:3", "ab".repeat(32)));
        assert_eq!(rendered.parse::<VariantId>().unwrap(), id);

        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{rendered}\""));
    }

    #[test]
    fn test_malformed_ids_are_validation_errors() {
        assert!(ExperimentId::parse("not-a-hash").is_err());
        assert!("abc".parse::<VariantId>().is_err());
        assert!(format!("{}:x", "ab".repeat(32)).parse::<VariantId>().is_err());
        assert!(serde_json::from_str::<VariantId>("\"nope\"").is_err());
    }

    #[test]
    fn test_event_type_aliases() {
        assert_eq!("sent".parse::<EventType>().unwrap(), EventType::Served);
        assert_eq!("opened".parse::<EventType>().unwrap(), EventType::Opened);
        assert_eq!("click".parse::<EventType>().unwrap(), EventType::Clicked);
        assert!("bounce".parse::<EventType>().is_err());
    }

    #[test]
    fn test_event_counts_tally_by_type() {
        let mut counts = EventCounts::default();
        counts.add(EventType::Served);
        counts.add(EventType::Served);
        counts.add(EventType::Clicked);
        let mut total = EventCounts {
            opened: 4,
            ..EventCounts::default()
        };
        total.merge(&counts);
        assert_eq!(
            total,
            EventCounts {
                served: 2,
                opened: 4,
                clicked: 1,
            }
        );
    }

    #[test]
    fn test_rate_guards_zero() {
        assert_eq!(rate(3, 0), 0.0);
        assert_eq!(rate(1, 4), 0.25);
    }
}
