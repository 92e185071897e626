//! # Skirmish Core
//!
//! Scenario orchestration and event correlation engine for the Skirmish
//! cyber-range platform.
//!
//! ## Overview
//!
//! - **Run registry**: process-wide bookkeeping of active runs with an
//!   at-most-one-active-run-per-scenario guarantee ([`registry`]).
//! - **Scenario state machine**: the authoritative run lifecycle with a
//!   write-ahead transition log ([`state_machine`]).
//! - **Orchestration pipeline**: drives provisioning, configuration,
//!   attack execution and teardown through pluggable drivers, with retry,
//!   compensation and cooperative cancellation ([`pipeline`]).
//! - **Correlation engine**: fuses raw network and host telemetry into a
//!   causally ordered, stage-tagged timeline ([`correlation`]).
//! - **Scoring engine**: deterministic evaluation of scenario objectives
//!   against the finalized timeline ([`scoring`]).
//!
//! Concrete infrastructure backends stay outside this crate behind the
//! capability traits in [`drivers`]; the REST layer, auth and persistence
//! schemas are platform concerns built on top.

pub mod config;
pub mod correlation;
pub mod drivers;
pub mod error;
pub mod events;
pub mod pipeline;
pub mod registry;
pub mod replay;
pub mod scoring;
pub mod state_machine;
pub mod store;

pub use config::{CoreConfig, RetryPolicy};
pub use correlation::CorrelationEngine;
pub use error::{CoreError, Result};
pub use events::{InProcRunEventBus, RunEvent, RunEventPublisher};
pub use pipeline::{Drivers, RunWorker};
pub use registry::RunRegistry;
pub use store::MemoryRunStore;
