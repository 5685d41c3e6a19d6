#![warn(clippy::unwrap_used)]

pub mod pipeline;
pub mod reporting;

pub use pipeline::{ExperimentPipeline, GenerateOutcome, GeneratedSubject};
pub use reporting::{HealthReport, MIN_DECISION_SERVES};
