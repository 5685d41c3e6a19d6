use crate::activity::ActivityLog;
use crate::journal::{Journal, JournalEntry};
use crate::{ExperimentStore, VariantSelector};
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use inbox_core::config::StoreConfig;
use inbox_core::types::{
    Ack, EventCounts, EventType, Experiment, ExperimentDraft, ExperimentId, OutcomeEvent,
    SelectedVariant, Variant, VariantCounters, VariantId,
};
use inbox_core::{InboxError, InboxResult};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Most recent caller-supplied event ids, oldest evicted first.
struct DedupeWindow {
    ids: HashSet<Uuid>,
    order: VecDeque<Uuid>,
    capacity: usize,
}

impl DedupeWindow {
    fn new(capacity: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn contains(&self, id: &Uuid) -> bool {
        self.ids.contains(id)
    }

    fn insert(&mut self, id: Uuid) {
        if !self.ids.insert(id) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.order.len()
    }
}

struct ExperimentRecord {
    experiment: Experiment,
    /// Event ids already applied, for idempotent retries.
    applied: DedupeWindow,
    activity: ActivityLog,
}

impl ExperimentRecord {
    fn new(experiment: Experiment, dedupe_window: usize) -> Self {
        Self {
            experiment,
            applied: DedupeWindow::new(dedupe_window),
            activity: ActivityLog::default(),
        }
    }

    fn reset(&mut self) {
        for variant in &mut self.experiment.variants {
            variant.counters = VariantCounters::default();
        }
    }
}

/// In-memory experiment store with an append-only journal.
///
/// Every mutation of an experiment happens under that experiment's mutex and
/// is journaled before it is applied, so a failed append leaves counters
/// untouched. Idempotency covers the last `dedupe_window` caller-supplied
/// event ids of each experiment.
pub struct MemoryStore {
    experiments: DashMap<ExperimentId, Arc<Mutex<ExperimentRecord>>>,
    journal: Journal,
    dedupe_window: usize,
}

impl MemoryStore {
    /// Store without durable journal.
    pub fn in_memory() -> Self {
        Self::with_journal(Journal::disabled(), Vec::new(), default_dedupe_window())
    }

    /// Open a file-backed store, replaying whatever the journal already holds.
    pub fn open(path: impl AsRef<Path>) -> InboxResult<Self> {
        Self::open_with_window(path, default_dedupe_window())
    }

    fn open_with_window(path: impl AsRef<Path>, dedupe_window: usize) -> InboxResult<Self> {
        let (journal, entries) = Journal::open(path)?;
        Ok(Self::with_journal(journal, entries, dedupe_window))
    }

    fn with_journal(journal: Journal, entries: Vec<JournalEntry>, dedupe_window: usize) -> Self {
        let records = replay(&entries, dedupe_window, Utc::now());
        if journal.is_durable() {
            info!(experiments = records.len(), "Experiment store recovered from journal");
        }
        let experiments = DashMap::new();
        for (id, record) in records {
            experiments.insert(id, Arc::new(Mutex::new(record)));
        }
        Self {
            experiments,
            journal,
            dedupe_window,
        }
    }

    pub fn from_config(config: &StoreConfig) -> InboxResult<Self> {
        match &config.journal_path {
            Some(path) => Self::open_with_window(path, config.dedupe_window),
            None => Ok(Self::with_journal(
                Journal::disabled(),
                Vec::new(),
                config.dedupe_window,
            )),
        }
    }

    fn record(&self, id: &ExperimentId) -> InboxResult<Arc<Mutex<ExperimentRecord>>> {
        self.experiments
            .get(id)
            .map(|r| r.value().clone())
            .ok_or_else(|| InboxError::ExperimentNotFound(id.to_string()))
    }
}

fn default_dedupe_window() -> usize {
    StoreConfig::default().dedupe_window
}

fn ensure_active(experiment: &Experiment) -> InboxResult<()> {
    if experiment.active {
        Ok(())
    } else {
        Err(InboxError::ExperimentInactive(experiment.id.to_string()))
    }
}

/// Apply one outcome to a variant's counters.
///
/// Opens only touch `times_opened`; a click that would exceed the serve count
/// is refused.
fn apply_outcome(counters: &mut VariantCounters, event_type: EventType) -> InboxResult<()> {
    match event_type {
        EventType::Served => counters.times_served += 1,
        EventType::Opened => counters.times_opened += 1,
        EventType::Clicked => {
            if counters.times_succeeded >= counters.times_served {
                return Err(InboxError::Validation(format!(
                    "click without a matching serve ({} clicks, {} serves)",
                    counters.times_succeeded, counters.times_served
                )));
            }
            counters.times_succeeded += 1;
        }
    }
    Ok(())
}

fn check_outcome(counters: VariantCounters, event_type: EventType) -> InboxResult<()> {
    let mut trial = counters;
    apply_outcome(&mut trial, event_type)
}

/// Rebuild experiment state from journal entries.
///
/// Entries are re-validated as they are applied; one that would have been
/// refused live is skipped.
fn replay(
    entries: &[JournalEntry],
    dedupe_window: usize,
    now: DateTime<Utc>,
) -> HashMap<ExperimentId, ExperimentRecord> {
    let mut records: HashMap<ExperimentId, ExperimentRecord> = HashMap::new();
    for entry in entries {
        match entry {
            JournalEntry::Created { experiment } => {
                records
                    .entry(experiment.id.clone())
                    .or_insert_with(|| ExperimentRecord::new(experiment.clone(), dedupe_window));
            }
            JournalEntry::Served { variant_id, at } => {
                let Some(record) = records.get_mut(&variant_id.experiment_id) else {
                    warn!(variant_id = %variant_id, "Journaled serve for unknown experiment");
                    continue;
                };
                let index = variant_id.index as usize;
                if let Some(variant) = record.experiment.variants.get_mut(index) {
                    variant.counters.times_served += 1;
                    record.activity.record(index, EventType::Served, *at, now);
                }
            }
            JournalEntry::Event { event } => {
                let Some(record) = records.get_mut(&event.variant_id.experiment_id) else {
                    warn!(event_id = %event.event_id, "Journaled event for unknown experiment");
                    continue;
                };
                if record.applied.contains(&event.event_id) {
                    continue;
                }
                let index = event.variant_id.index as usize;
                let Some(variant) = record.experiment.variants.get_mut(index) else {
                    continue;
                };
                if apply_outcome(&mut variant.counters, event.event_type).is_ok() {
                    record.applied.insert(event.event_id);
                    record
                        .activity
                        .record(index, event.event_type, event.timestamp, now);
                }
            }
            JournalEntry::Closed { experiment_id, at } => {
                if let Some(record) = records.get_mut(experiment_id) {
                    record.experiment.active = false;
                    record.experiment.closed_at = Some(*at);
                }
            }
            JournalEntry::Reset { experiment_id, .. } => {
                if let Some(record) = records.get_mut(experiment_id) {
                    record.reset();
                }
            }
        }
    }
    records
}

impl ExperimentStore for MemoryStore {
    fn create_experiment(&self, draft: ExperimentDraft) -> InboxResult<(Experiment, bool)> {
        if draft.variants.is_empty() {
            return Err(InboxError::Validation(
                "an experiment needs at least one variant".to_string(),
            ));
        }

        let record = match self.experiments.entry(draft.id.clone()) {
            Entry::Occupied(existing) => existing.get().clone(),
            Entry::Vacant(slot) => {
                let experiment = Experiment {
                    id: draft.id.clone(),
                    source_text: draft.source_text,
                    original_subject: draft.original_subject,
                    created_at: Utc::now(),
                    active: true,
                    closed_at: None,
                    variants: draft
                        .variants
                        .into_iter()
                        .enumerate()
                        .map(|(index, v)| Variant {
                            id: VariantId::new(draft.id.clone(), index as u32),
                            text: v.text,
                            placeholder: v.placeholder,
                            counters: VariantCounters::default(),
                        })
                        .collect(),
                };
                self.journal.append(&JournalEntry::Created {
                    experiment: experiment.clone(),
                })?;
                slot.insert(Arc::new(Mutex::new(ExperimentRecord::new(
                    experiment.clone(),
                    self.dedupe_window,
                ))));
                metrics::counter!("store.experiments_created").increment(1);
                info!(
                    experiment_id = %experiment.id,
                    variants = experiment.variants.len(),
                    "Experiment created"
                );
                return Ok((experiment, true));
            }
        };

        let experiment = record.lock().experiment.clone();
        debug!(experiment_id = %experiment.id, "Experiment already exists");
        Ok((experiment, false))
    }

    fn get_experiment(&self, id: &ExperimentId) -> Option<Experiment> {
        let record = self.experiments.get(id).map(|r| r.value().clone())?;
        let experiment = record.lock().experiment.clone();
        Some(experiment)
    }

    fn list_experiments(&self) -> Vec<Experiment> {
        let records: Vec<_> = self.experiments.iter().map(|r| r.value().clone()).collect();
        let mut experiments: Vec<Experiment> = records
            .iter()
            .map(|record| record.lock().experiment.clone())
            .collect();
        experiments.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        experiments
    }

    fn select_and_serve(
        &self,
        id: &ExperimentId,
        selector: &dyn VariantSelector,
    ) -> InboxResult<SelectedVariant> {
        let record = self.record(id)?;
        let mut guard = record.lock();
        ensure_active(&guard.experiment)?;

        let (index, method) = selector.choose(&guard.experiment)?;
        let variant_id = guard
            .experiment
            .variants
            .get(index)
            .map(|v| v.id.clone())
            .ok_or_else(|| InboxError::VariantNotFound(format!("{id}:{index}")))?;

        let at = Utc::now();
        self.journal.append(&JournalEntry::Served { variant_id, at })?;

        guard.activity.record(index, EventType::Served, at, at);
        let variant = &mut guard.experiment.variants[index];
        variant.counters.times_served += 1;

        Ok(SelectedVariant {
            variant_id: variant.id.clone(),
            text: variant.text.clone(),
            method,
            counters: variant.counters,
        })
    }

    fn record_event(&self, event: &OutcomeEvent) -> InboxResult<Ack> {
        let record = self.record(&event.variant_id.experiment_id)?;
        let mut guard = record.lock();
        let index = event.variant_id.index as usize;
        let current = guard
            .experiment
            .variants
            .get(index)
            .map(|v| v.counters)
            .ok_or_else(|| InboxError::VariantNotFound(event.variant_id.to_string()))?;

        if guard.applied.contains(&event.event_id) {
            metrics::counter!("store.duplicate_events").increment(1);
            debug!(event_id = %event.event_id, "Duplicate event acknowledged");
            return Ok(Ack {
                event_id: event.event_id,
                duplicate: true,
                counters: current,
            });
        }
        ensure_active(&guard.experiment)?;
        check_outcome(current, event.event_type)?;

        self.journal.append(&JournalEntry::Event { event: event.clone() })?;
        guard.applied.insert(event.event_id);
        guard
            .activity
            .record(index, event.event_type, event.timestamp, Utc::now());
        let counters = &mut guard.experiment.variants[index].counters;
        apply_outcome(counters, event.event_type)?;

        Ok(Ack {
            event_id: event.event_id,
            duplicate: false,
            counters: *counters,
        })
    }

    fn close_experiment(&self, id: &ExperimentId) -> InboxResult<Experiment> {
        let record = self.record(id)?;
        let mut guard = record.lock();
        if guard.experiment.active {
            let at = Utc::now();
            self.journal.append(&JournalEntry::Closed {
                experiment_id: id.clone(),
                at,
            })?;
            guard.experiment.active = false;
            guard.experiment.closed_at = Some(at);
            info!(experiment_id = %id, "Experiment closed");
        }
        Ok(guard.experiment.clone())
    }

    fn reset_counters(&self, id: &ExperimentId) -> InboxResult<Experiment> {
        let record = self.record(id)?;
        let mut guard = record.lock();
        ensure_active(&guard.experiment)?;
        self.journal.append(&JournalEntry::Reset {
            experiment_id: id.clone(),
            at: Utc::now(),
        })?;
        guard.reset();
        info!(experiment_id = %id, "Experiment counters reset");
        Ok(guard.experiment.clone())
    }

    fn rebuild_counters(&self, id: &ExperimentId) -> InboxResult<Experiment> {
        if !self.journal.is_durable() {
            return Err(InboxError::Store(format!(
                "experiment {id} has no journal to rebuild from"
            )));
        }
        let record = self.record(id)?;
        let mut guard = record.lock();
        let entries: Vec<JournalEntry> = self
            .journal
            .entries()?
            .into_iter()
            .filter(|entry| entry.experiment_id() == id)
            .collect();

        let rebuilt = replay(&entries, self.dedupe_window, Utc::now())
            .remove(id)
            .ok_or_else(|| InboxError::Store(format!("no journal entries for experiment {id}")))?;
        for (live, replayed) in guard
            .experiment
            .variants
            .iter_mut()
            .zip(rebuilt.experiment.variants.iter())
        {
            live.counters = replayed.counters;
        }
        guard.applied = rebuilt.applied;
        guard.activity = rebuilt.activity;
        info!(experiment_id = %id, "Experiment counters rebuilt from journal");
        Ok(guard.experiment.clone())
    }

    fn recent_activity(&self, variant_id: &VariantId, window: Duration) -> InboxResult<EventCounts> {
        let record = self.record(&variant_id.experiment_id)?;
        let guard = record.lock();
        let index = variant_id.index as usize;
        if index >= guard.experiment.variants.len() {
            return Err(InboxError::VariantNotFound(variant_id.to_string()));
        }
        Ok(guard.activity.since(index, window, Utc::now()))
    }

    fn durability(&self) -> &'static str {
        if self.journal.is_durable() {
            "file"
        } else {
            "memory"
        }
    }
}
