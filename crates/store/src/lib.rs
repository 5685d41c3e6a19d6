#![warn(clippy::unwrap_used)]
//! Experiment persistence and outcome recording.
//!
//! [`MemoryStore`] keeps every experiment in memory behind a per-experiment
//! lock and appends each mutation to a [`Journal`] so state survives
//! restarts. Variant choice is delegated to a [`VariantSelector`] that runs
//! inside the same critical section as the serve increment.

pub mod activity;
pub mod journal;
pub mod memory;
pub mod recorder;

pub use journal::{Journal, JournalEntry};
pub use memory::MemoryStore;
pub use recorder::EventRecorder;

use chrono::Duration;
use inbox_core::types::{
    Ack, EventCounts, Experiment, ExperimentDraft, ExperimentId, OutcomeEvent, SelectedVariant,
    SelectionMethod, VariantId,
};
use inbox_core::InboxResult;

/// Picks which variant of an experiment to serve next.
///
/// Called with the experiment's lock held, so implementations must not block.
pub trait VariantSelector: Send + Sync {
    fn choose(&self, experiment: &Experiment) -> InboxResult<(usize, SelectionMethod)>;
}

pub trait ExperimentStore: Send + Sync {
    /// Create an experiment, or return the existing one with `false`.
    fn create_experiment(&self, draft: ExperimentDraft) -> InboxResult<(Experiment, bool)>;

    fn get_experiment(&self, id: &ExperimentId) -> Option<Experiment>;

    fn list_experiments(&self) -> Vec<Experiment>;

    /// Choose a variant and count the serve in one critical section.
    fn select_and_serve(
        &self,
        id: &ExperimentId,
        selector: &dyn VariantSelector,
    ) -> InboxResult<SelectedVariant>;

    fn record_event(&self, event: &OutcomeEvent) -> InboxResult<Ack>;

    fn close_experiment(&self, id: &ExperimentId) -> InboxResult<Experiment>;

    fn reset_counters(&self, id: &ExperimentId) -> InboxResult<Experiment>;

    /// Recompute an experiment's counters from its journaled events. Fails
    /// when the store keeps no journal.
    fn rebuild_counters(&self, id: &ExperimentId) -> InboxResult<Experiment>;

    /// Events recorded for one variant within `window` (hour granularity,
    /// at most the last 24 hours).
    fn recent_activity(&self, variant_id: &VariantId, window: Duration) -> InboxResult<EventCounts>;

    /// `"file"` or `"memory"`, for health reporting.
    fn durability(&self) -> &'static str;
}
