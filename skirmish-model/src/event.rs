use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{CorrelatedEventId, RawEventId, RunId};

/// Where an observation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Network,
    Host,
    Orchestration,
}

/// Opaque structured payload attached to a raw event.
///
/// Collectors ship already-parsed records; the correlation engine extracts
/// the typed views it understands and rejects anything malformed. The model
/// deliberately does not constrain the shape beyond "JSON object".
pub type EventPayload = serde_json::Map<String, serde_json::Value>;

/// A single unprocessed observation from a collector.
///
/// Append-only: once ingested a raw event is never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub id: RawEventId,
    pub run_id: RunId,
    pub source: SourceKind,
    /// VM or agent that produced the observation.
    pub origin: String,
    /// Timestamp assigned by the origin's clock.
    pub observed_at: DateTime<Utc>,
    /// Arrival timestamp assigned at ingestion.
    pub ingested_at: DateTime<Utc>,
    pub payload: EventPayload,
}

/// Fixed attack-stage taxonomy assigned to correlated events.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum AttackStage {
    Reconnaissance,
    InitialAccess,
    Execution,
    LateralMovement,
    Exfiltration,
    Unknown,
}

impl fmt::Display for AttackStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AttackStage::Reconnaissance => "reconnaissance",
            AttackStage::InitialAccess => "initial-access",
            AttackStage::Execution => "execution",
            AttackStage::LateralMovement => "lateral-movement",
            AttackStage::Exfiltration => "exfiltration",
            AttackStage::Unknown => "unknown",
        };
        write!(f, "{label}")
    }
}

/// A causally linked, stage-tagged event derived from one or more raw
/// observations.
///
/// `sequence` is unique and strictly increasing within a run, and every
/// entry in `causes` carries a strictly smaller sequence, so the full set
/// always forms a DAG. Finalization freezes the set; nothing mutates a
/// correlated event after the run reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelatedEvent {
    pub id: CorrelatedEventId,
    pub run_id: RunId,
    pub sequence: u64,
    pub stage: AttackStage,
    /// Earliest origin timestamp among the wrapped raw events.
    pub occurred_at: DateTime<Utc>,
    pub raw_events: Vec<RawEventId>,
    pub causes: Vec<CorrelatedEventId>,
    pub effects: Vec<CorrelatedEventId>,
    /// Flattened evidence fields used by detection rules. BTreeMap keeps
    /// serialization and rule evaluation deterministic.
    pub attributes: BTreeMap<String, String>,
}

impl CorrelatedEvent {
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}
