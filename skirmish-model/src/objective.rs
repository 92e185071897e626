use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::AttackStage;
use crate::ids::{CorrelatedEventId, RunId, ScenarioId, TeamId};

/// Author-assigned identifier for one objective inside a scenario.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ObjectiveId(pub String);

impl ObjectiveId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ObjectiveId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Predicate over the finalized correlated-event DAG.
///
/// Rules are pure data so scenario authors can ship them inside a
/// definition and the scoring engine stays deterministic: evaluation reads
/// only the timeline, never the clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "rule")]
pub enum DetectionRule {
    /// At least one event tagged with the given stage exists.
    StagePresent { stage: AttackStage },
    /// An event tagged `downstream` is causally reachable from an event
    /// tagged `upstream`, and occurred within `within_secs` of it.
    StageSequence {
        upstream: AttackStage,
        downstream: AttackStage,
        within_secs: i64,
    },
    /// An event carries an evidence attribute with the exact given value.
    AttributeEquals { key: String, value: String },
    AllOf { rules: Vec<DetectionRule> },
    AnyOf { rules: Vec<DetectionRule> },
}

/// One scored objective inside a scenario definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectiveSpec {
    pub id: ObjectiveId,
    pub description: String,
    pub rule: DetectionRule,
    /// Relative weight; contributions are normalized across the scenario.
    pub weight: f64,
}

pub type ObjectiveSpecList = Vec<ObjectiveSpec>;

/// Outcome of evaluating one objective against a finalized timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectiveResult {
    pub objective_id: ObjectiveId,
    pub satisfied: bool,
    /// Correlated events that satisfied the rule, in sequence order.
    pub evidence: Vec<CorrelatedEventId>,
    /// Delta between the first satisfying event and the declared attack
    /// start; `None` when the objective was not satisfied.
    pub time_to_detection_secs: Option<i64>,
    pub contribution: f64,
}

/// Leaderboard adjustment produced alongside a score report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardDelta {
    pub team_id: TeamId,
    pub scenario_id: ScenarioId,
    pub points: f64,
}

/// Full scoring output for one completed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreReport {
    pub run_id: RunId,
    pub objectives: Vec<ObjectiveResult>,
    /// Weighted sum of satisfied objectives, normalized to 0..=100.
    pub total_score: f64,
    pub leaderboard: LeaderboardDelta,
    pub scored_at: DateTime<Utc>,
}
