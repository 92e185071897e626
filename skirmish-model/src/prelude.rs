//! Convenience re-exports for consumers that want the whole model surface.

pub use crate::event::{
    AttackStage, CorrelatedEvent, EventPayload, RawEvent, SourceKind,
};
pub use crate::ids::{
    CorrelatedEventId, OperationId, RawEventId, ResourceHandle, RunId,
    ScenarioId, TeamId,
};
pub use crate::objective::{
    DetectionRule, LeaderboardDelta, ObjectiveId, ObjectiveResult,
    ObjectiveSpec, ScoreReport,
};
pub use crate::run::{
    RunState, RunStatus, ScenarioRun, StateTransition, TransitionReason,
};
pub use crate::scenario::{
    AttackPlanRef, NetworkSegment, PlaybookRef, ScenarioDefinition,
    TopologySpec, VmRole,
};
