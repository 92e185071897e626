use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ResourceHandle, RunId, ScenarioId, TeamId};

/// Lifecycle states of a scenario run.
///
/// The success path is strictly linear; `Failed` is reachable from any
/// non-terminal state and teardown (`Destroying -> Destroyed`) follows
/// `Completed` or `Failed`. The legal-transition table lives in
/// `skirmish-core`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Queued,
    Provisioning,
    Configuring,
    AttackExecuting,
    Monitoring,
    Scoring,
    Completed,
    Failed,
    Destroying,
    Destroyed,
}

impl RunState {
    /// Terminal states accept no further lifecycle transitions except the
    /// teardown pair.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed | RunState::Destroyed
        )
    }

    /// States in which the run still holds (or may hold) live resources.
    pub fn holds_resources(&self) -> bool {
        !matches!(self, RunState::Queued | RunState::Destroyed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunState::Queued => "queued",
            RunState::Provisioning => "provisioning",
            RunState::Configuring => "configuring",
            RunState::AttackExecuting => "attack_executing",
            RunState::Monitoring => "monitoring",
            RunState::Scoring => "scoring",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
            RunState::Destroying => "destroying",
            RunState::Destroyed => "destroyed",
        };
        write!(f, "{label}")
    }
}

/// Why a transition happened; recorded verbatim in the write-ahead log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum TransitionReason {
    StepCompleted(String),
    StepFailed(String),
    Cancelled(String),
    RetentionExpired,
    Recovery,
}

/// One entry in a run's write-ahead transition log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: RunState,
    pub to: RunState,
    pub at: DateTime<Utc>,
    pub reason: TransitionReason,
}

/// One execution instance of a scenario.
///
/// Exclusively owned and mutated by the orchestration worker assigned to
/// it; everyone else sees snapshots via `RunStatus`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioRun {
    pub id: RunId,
    pub scenario_id: ScenarioId,
    pub team_id: TeamId,
    pub state: RunState,
    pub transitions: Vec<StateTransition>,
    pub resource_handles: Vec<ResourceHandle>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl ScenarioRun {
    pub fn new(scenario_id: ScenarioId, team_id: TeamId) -> Self {
        Self {
            id: RunId::new(),
            scenario_id,
            team_id,
            state: RunState::Queued,
            transitions: Vec::new(),
            resource_handles: Vec::new(),
            started_at: Utc::now(),
            ended_at: None,
            last_error: None,
        }
    }

    /// Timestamp of the transition into the given state, if it happened.
    pub fn entered_at(&self, state: RunState) -> Option<DateTime<Utc>> {
        self.transitions.iter().find(|t| t.to == state).map(|t| t.at)
    }

    pub fn status(&self) -> RunStatus {
        RunStatus {
            run_id: self.id,
            scenario_id: self.scenario_id,
            state: self.state,
            last_error: self.last_error.clone(),
            started_at: self.started_at,
            ended_at: self.ended_at,
        }
    }
}

/// Operator-facing snapshot of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub run_id: RunId,
    pub scenario_id: ScenarioId,
    pub state: RunState,
    pub last_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}
