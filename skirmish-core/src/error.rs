use skirmish_model::{ResourceHandle, RunId, RunState, ScenarioId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    /// Retryable infrastructure hiccup (timeout, rate limit, connection
    /// reset). The pipeline backs off and tries again.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Not retryable: bad configuration, quota exceeded, rejected input.
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// Protocol misuse: the requested lifecycle transition is not in the
    /// legal table. State is left unchanged.
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: RunState, to: RunState },

    /// Event origin timestamp predates provisioning completion by more
    /// than the configured skew tolerance. Event dropped, run unaffected.
    #[error("event outside ingestion window (skew {skew_secs}s beyond tolerance)")]
    OutOfWindow { skew_secs: i64 },

    /// Malformed raw event payload. Event dropped, run unaffected.
    #[error("invalid event payload: {0}")]
    InvalidPayload(String),

    /// Timeline violated the sequence/DAG invariants at validation.
    /// Indicates an engine bug, not droppable event noise.
    #[error("corrupt timeline: {0}")]
    CorruptTimeline(String),

    #[error("no active run: {0}")]
    UnknownRun(RunId),

    #[error("scenario {0} already has an active run")]
    RunAlreadyActive(ScenarioId),

    /// Compensation exhausted its retry budget; the listed handles need
    /// manual cleanup.
    #[error("orphaned resources on run {run_id}: {handles:?}")]
    OrphanedResources {
        run_id: RunId,
        handles: Vec<ResourceHandle>,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Retry classification used by the orchestration pipeline. Everything
    /// that is not explicitly transient is treated as permanent; guessing
    /// retryability for unknown failures risks hammering a broken driver.
    pub fn is_transient(&self) -> bool {
        matches!(self, CoreError::Transient(_))
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(CoreError::Transient("timeout".into()).is_transient());
        assert!(!CoreError::Permanent("bad quota".into()).is_transient());
        assert!(!CoreError::InvalidPayload("missing field".into()).is_transient());
    }

    #[test]
    fn invalid_transition_reports_both_states() {
        let err = CoreError::InvalidTransition {
            from: RunState::Queued,
            to: RunState::Scoring,
        };
        assert_eq!(err.to_string(), "invalid transition: queued -> scoring");
    }
}
