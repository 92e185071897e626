//! Core data model definitions shared across Skirmish crates.
//!
//! Everything here is plain data: typed identifiers, scenario templates,
//! run lifecycle records, raw/correlated events and scoring outcomes. The
//! engine that mutates these lives in `skirmish-core`; collaborators on the
//! other side of the API boundary only ever see these serde-friendly types.

pub mod event;
pub mod ids;
pub mod objective;
pub mod prelude;
pub mod run;
pub mod scenario;

// Intentionally curated re-exports for downstream consumers.
pub use event::{
    AttackStage, CorrelatedEvent, EventPayload, RawEvent, SourceKind,
};
pub use ids::{
    CorrelatedEventId, OperationId, RawEventId, ResourceHandle, RunId,
    ScenarioId, TeamId,
};
pub use objective::{
    DetectionRule, LeaderboardDelta, ObjectiveId, ObjectiveResult, ScoreReport,
};
pub use run::{
    RunState, RunStatus, ScenarioRun, StateTransition, TransitionReason,
};
pub use scenario::{
    AttackPlanRef, NetworkSegment, ObjectiveSpec, PlaybookRef,
    ScenarioDefinition, TopologySpec, VmRole,
};
