#![warn(clippy::unwrap_used)]
//! Two-phase multi-armed bandit for subject-line experiments: round-robin
//! exploration until an experiment has enough traffic, Thompson sampling
//! afterwards.

pub mod engine;
pub mod policy;
pub mod sampling;
pub mod wilson;

pub use engine::BanditEngine;
pub use policy::TwoPhasePolicy;
pub use wilson::wilson_interval;
