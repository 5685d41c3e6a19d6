use crate::ExperimentStore;
use chrono::{DateTime, Duration, Utc};
use inbox_core::types::{Ack, EventType, OutcomeEvent, VariantId};
use inbox_core::{InboxError, InboxResult};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Events stamped further than this into the future are refused.
const MAX_CLOCK_SKEW_SECS: i64 = 300;

/// Ingests outcome events into the experiment store.
pub struct EventRecorder {
    store: Arc<dyn ExperimentStore>,
}

impl EventRecorder {
    pub fn new(store: Arc<dyn ExperimentStore>) -> Self {
        Self { store }
    }

    /// Record one outcome. Supplying `event_id` makes retries idempotent;
    /// without one a fresh id is minted.
    pub fn record(
        &self,
        variant_id: VariantId,
        event_type: EventType,
        timestamp: DateTime<Utc>,
        event_id: Option<Uuid>,
    ) -> InboxResult<Ack> {
        if timestamp > Utc::now() + Duration::seconds(MAX_CLOCK_SKEW_SECS) {
            return Err(InboxError::Validation(format!(
                "event timestamp {timestamp} is in the future"
            )));
        }

        let event = OutcomeEvent {
            event_id: event_id.unwrap_or_else(Uuid::new_v4),
            variant_id,
            event_type,
            timestamp,
        };
        self.ingest(&event)
    }

    pub fn ingest(&self, event: &OutcomeEvent) -> InboxResult<Ack> {
        let kind = event_label(event.event_type);
        match self.store.record_event(event) {
            Ok(ack) => {
                if ack.duplicate {
                    metrics::counter!("events.duplicate", "type" => kind).increment(1);
                } else {
                    metrics::counter!("events.recorded", "type" => kind).increment(1);
                }
                debug!(
                    event_id = %event.event_id,
                    variant_id = %event.variant_id,
                    event_type = kind,
                    duplicate = ack.duplicate,
                    "Outcome recorded"
                );
                Ok(ack)
            }
            Err(e) => {
                metrics::counter!("events.rejected", "type" => kind).increment(1);
                warn!(
                    event_id = %event.event_id,
                    variant_id = %event.variant_id,
                    event_type = kind,
                    error = %e,
                    "Outcome rejected"
                );
                Err(e)
            }
        }
    }
}

fn event_label(event_type: EventType) -> &'static str {
    match event_type {
        EventType::Served => "served",
        EventType::Opened => "opened",
        EventType::Clicked => "clicked",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;
    use inbox_core::content::content_hash;
    use inbox_core::types::{DraftVariant, ExperimentDraft, ExperimentId};

    fn setup() -> (EventRecorder, Arc<MemoryStore>, VariantId) {
        let store = Arc::new(MemoryStore::in_memory());
        let id = ExperimentId::parse(&content_hash("recorder")).unwrap();
        store
            .create_experiment(ExperimentDraft {
                id: id.clone(),
                source_text: "body".to_string(),
                original_subject: None,
                variants: vec![DraftVariant {
                    text: "Hello there".to_string(),
                    placeholder: false,
                }],
            })
            .unwrap();
        (EventRecorder::new(store.clone()), store, VariantId::new(id, 0))
    }

    #[test]
    fn test_caller_event_id_makes_retries_idempotent() {
        let (recorder, _, variant) = setup();
        let event_id = Uuid::new_v4();

        let first = recorder
            .record(variant.clone(), EventType::Served, Utc::now(), Some(event_id))
            .unwrap();
        let retry = recorder
            .record(variant.clone(), EventType::Served, Utc::now(), Some(event_id))
            .unwrap();
        assert_eq!(first.event_id, event_id);
        assert!(retry.duplicate);
        assert_eq!(retry.counters.times_served, 1);

        let fresh = recorder.record(variant, EventType::Served, Utc::now(), None).unwrap();
        assert_ne!(fresh.event_id, event_id);
        assert_eq!(fresh.counters.times_served, 2);
    }

    #[test]
    fn test_future_timestamps_are_refused() {
        let (recorder, store, variant) = setup();
        let err = recorder
            .record(variant.clone(), EventType::Served, Utc::now() + Duration::hours(1), None)
            .unwrap_err();
        assert!(matches!(err, InboxError::Validation(_)));
        let exp = store.get_experiment(&variant.experiment_id).unwrap();
        assert_eq!(exp.total_served(), 0);
    }

    #[test]
    fn test_opens_are_reporting_only() {
        let (recorder, _, variant) = setup();
        recorder.record(variant.clone(), EventType::Served, Utc::now(), None).unwrap();
        let ack = recorder.record(variant, EventType::Opened, Utc::now(), None).unwrap();
        assert_eq!(ack.counters.times_opened, 1);
        assert_eq!(ack.counters.times_succeeded, 0);
    }
}
