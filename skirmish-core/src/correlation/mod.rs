//! Event correlation: normalizes raw collector events and builds the
//! causally ordered, stage-tagged timeline used for scoring and replay.

pub mod engine;
pub mod rules;

pub use engine::CorrelationEngine;
pub use rules::{validate_dag, Observation};
