//! Replay export: renders a finalized timeline as ordered JSON frames for
//! the external replay UI.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use skirmish_model::{AttackStage, CorrelatedEvent, CorrelatedEventId};

use crate::error::Result;

/// One frame of a run replay, in playback order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayFrame {
    pub sequence: u64,
    pub at: DateTime<Utc>,
    pub stage: AttackStage,
    /// Sequences of the frames this one is caused by; the UI draws these
    /// as edges.
    pub caused_by: Vec<u64>,
    pub attributes: std::collections::BTreeMap<String, String>,
}

/// Flatten a finalized timeline into replay frames.
///
/// Cross-references are rewritten from event ids to sequence numbers so
/// the output is self-contained and stable across serialization.
pub fn export_frames(timeline: &[CorrelatedEvent]) -> Vec<ReplayFrame> {
    let sequence_of = |id: &CorrelatedEventId| {
        timeline.iter().find(|e| e.id == *id).map(|e| e.sequence)
    };
    timeline
        .iter()
        .map(|event| ReplayFrame {
            sequence: event.sequence,
            at: event.occurred_at,
            stage: event.stage,
            caused_by: event.causes.iter().filter_map(sequence_of).collect(),
            attributes: event.attributes.clone(),
        })
        .collect()
}

/// Serialize frames as one JSON document for bulk upload.
pub fn export_json(timeline: &[CorrelatedEvent]) -> Result<String> {
    Ok(serde_json::to_string_pretty(&export_frames(timeline))?)
}
