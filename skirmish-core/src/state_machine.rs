//! Run lifecycle state machine with a write-ahead transition log.
//!
//! Transitions are strictly linear on the success path; `Failed` is
//! reachable from any non-terminal state and teardown follows `Completed`
//! or `Failed`. Every transition is appended to the durable log *before*
//! the in-memory state changes, so a crash mid-transition is detectable by
//! replaying the log and resuming from the last durable state.

use chrono::Utc;
use skirmish_model::{
    RunState, ScenarioRun, StateTransition, TransitionReason,
};
use tracing::info;

use crate::drivers::RunStore;
use crate::error::{CoreError, Result};

/// Legal-transition table. Everything not listed here fails with
/// `InvalidTransition` and leaves state untouched.
pub fn is_legal(from: RunState, to: RunState) -> bool {
    use RunState::*;
    match (from, to) {
        (Queued, Provisioning)
        | (Provisioning, Configuring)
        | (Configuring, AttackExecuting)
        | (AttackExecuting, Monitoring)
        | (Monitoring, Scoring)
        | (Scoring, Completed) => true,
        (Completed, Destroying) | (Failed, Destroying) => true,
        (Destroying, Destroyed) => true,
        // Unrecoverable errors can interrupt any state that is not already
        // settled, including teardown itself (compensation exhausted).
        (from, Failed) => !matches!(from, Completed | Failed | Destroyed),
        _ => false,
    }
}

/// Apply a transition to a run, write-ahead style: the log entry is
/// persisted first, then the in-memory state flips, then the run document
/// is saved. Returns the recorded transition.
pub async fn transition(
    store: &dyn RunStore,
    run: &mut ScenarioRun,
    to: RunState,
    reason: TransitionReason,
) -> Result<StateTransition> {
    let from = run.state;
    if !is_legal(from, to) {
        return Err(CoreError::InvalidTransition { from, to });
    }

    let entry = StateTransition {
        from,
        to,
        at: Utc::now(),
        reason,
    };
    store.append_transition(run.id, &entry).await?;

    run.state = to;
    run.transitions.push(entry.clone());
    if let TransitionReason::StepFailed(msg) | TransitionReason::Cancelled(msg) =
        &entry.reason
    {
        run.last_error = Some(msg.clone());
    }
    if to.is_terminal() && run.ended_at.is_none() {
        run.ended_at = Some(entry.at);
    }
    store.save_run(run).await?;

    info!(run_id = %run.id, %from, %to, "run state transition");
    Ok(entry)
}

/// Replay a transition log from `Queued` and return the reconstructed
/// state. Fails if the log contains an illegal edge or does not chain.
pub fn replay(log: &[StateTransition]) -> Result<RunState> {
    let mut state = RunState::Queued;
    for entry in log {
        if entry.from != state || !is_legal(entry.from, entry.to) {
            return Err(CoreError::InvalidTransition {
                from: entry.from,
                to: entry.to,
            });
        }
        state = entry.to;
    }
    Ok(state)
}

/// Reconcile a loaded run against its durable log after a crash. The log
/// is authoritative; the run document is rewritten if it lags behind.
pub async fn recover(store: &dyn RunStore, run: &mut ScenarioRun) -> Result<RunState> {
    let log = store.load_transitions(run.id).await?;
    let durable = replay(&log)?;
    if run.state != durable {
        info!(
            run_id = %run.id,
            stale = %run.state,
            %durable,
            "recovering run state from transition log"
        );
        run.state = durable;
        run.transitions = log;
        store.save_run(run).await?;
    }
    Ok(durable)
}

#[cfg(test)]
mod tests {
    use skirmish_model::{ScenarioId, TeamId};

    use super::*;
    use crate::store::MemoryRunStore;

    fn new_run() -> ScenarioRun {
        ScenarioRun::new(ScenarioId::new(), TeamId::new())
    }

    #[test]
    fn success_path_is_linear() {
        use RunState::*;
        let path = [
            Queued,
            Provisioning,
            Configuring,
            AttackExecuting,
            Monitoring,
            Scoring,
            Completed,
        ];
        for pair in path.windows(2) {
            assert!(is_legal(pair[0], pair[1]), "{} -> {}", pair[0], pair[1]);
        }
        assert!(!is_legal(Queued, Configuring));
        assert!(!is_legal(Provisioning, Monitoring));
        assert!(!is_legal(Completed, Queued));
    }

    #[test]
    fn failed_reachable_from_non_terminal_only() {
        use RunState::*;
        for from in [Queued, Provisioning, Configuring, AttackExecuting, Monitoring, Scoring, Destroying] {
            assert!(is_legal(from, Failed), "{from} -> failed");
        }
        assert!(!is_legal(Completed, Failed));
        assert!(!is_legal(Destroyed, Failed));
        assert!(!is_legal(Failed, Failed));
    }

    #[tokio::test]
    async fn illegal_transition_leaves_state_unchanged() {
        let store = MemoryRunStore::new();
        let mut run = new_run();
        let err = transition(
            &store,
            &mut run,
            RunState::Scoring,
            TransitionReason::StepCompleted("skip ahead".into()),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { .. }));
        assert_eq!(run.state, RunState::Queued);
        assert!(store.load_transitions(run.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn replaying_the_log_reconstructs_current_state() {
        let store = MemoryRunStore::new();
        let mut run = new_run();
        for (state, reason) in [
            (RunState::Provisioning, "queued for execution"),
            (RunState::Configuring, "topology applied"),
            (RunState::AttackExecuting, "hosts configured"),
        ] {
            transition(
                &store,
                &mut run,
                state,
                TransitionReason::StepCompleted(reason.into()),
            )
            .await
            .unwrap();
        }

        let log = store.load_transitions(run.id).await.unwrap();
        assert_eq!(replay(&log).unwrap(), run.state);
    }

    #[tokio::test]
    async fn recovery_prefers_the_durable_log() {
        let store = MemoryRunStore::new();
        let mut run = new_run();
        transition(
            &store,
            &mut run,
            RunState::Provisioning,
            TransitionReason::StepCompleted("queued for execution".into()),
        )
        .await
        .unwrap();

        // Simulate a crash after the log write but before the run document
        // caught up.
        let mut stale = run.clone();
        stale.state = RunState::Queued;
        stale.transitions.clear();

        let recovered = recover(&store, &mut stale).await.unwrap();
        assert_eq!(recovered, RunState::Provisioning);
        assert_eq!(stale.state, RunState::Provisioning);
        assert_eq!(stale.transitions.len(), 1);
    }

    #[tokio::test]
    async fn terminal_transition_records_end_time_and_error() {
        let store = MemoryRunStore::new();
        let mut run = new_run();
        transition(
            &store,
            &mut run,
            RunState::Provisioning,
            TransitionReason::StepCompleted("queued for execution".into()),
        )
        .await
        .unwrap();
        transition(
            &store,
            &mut run,
            RunState::Failed,
            TransitionReason::StepFailed("provider quota exceeded".into()),
        )
        .await
        .unwrap();

        assert!(run.ended_at.is_some());
        assert_eq!(
            run.last_error.as_deref(),
            Some("provider quota exceeded")
        );
    }
}
