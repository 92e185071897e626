//! Process-wide bookkeeping of active runs.
//!
//! The registry is the operator-facing surface of the core: `start`,
//! `cancel`, `status`. It enforces at most one active run per scenario
//! definition with an acquire-on-start / release-on-terminal lock keyed by
//! definition id, and owns the worker task driving each run.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use skirmish_model::{
    RunId, RunState, RunStatus, ScenarioDefinition, ScenarioId, ScenarioRun,
    TeamId, TransitionReason,
};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::CoreConfig;
use crate::correlation::CorrelationEngine;
use crate::drivers::RunStore;
use crate::error::{CoreError, Result};
use crate::events::RunEventPublisher;
use crate::pipeline::{teardown, Drivers, RunWorker};
use crate::state_machine::{recover, transition};

struct ActiveRun {
    run_id: RunId,
    cancel: CancellationToken,
}

/// Registry of active runs; one per process.
pub struct RunRegistry {
    config: CoreConfig,
    drivers: Drivers,
    store: Arc<dyn RunStore>,
    engine: Arc<CorrelationEngine>,
    bus: Arc<dyn RunEventPublisher>,
    active: RwLock<HashMap<ScenarioId, ActiveRun>>,
}

impl std::fmt::Debug for RunRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunRegistry").finish_non_exhaustive()
    }
}

impl RunRegistry {
    pub fn new(
        config: CoreConfig,
        drivers: Drivers,
        store: Arc<dyn RunStore>,
        engine: Arc<CorrelationEngine>,
        bus: Arc<dyn RunEventPublisher>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            drivers,
            store,
            engine,
            bus,
            active: RwLock::new(HashMap::new()),
        })
    }

    /// Start a run for a definition and spawn its worker.
    ///
    /// Fails with `RunAlreadyActive` while another run for the same
    /// definition is in a non-terminal state; the existing run is left
    /// untouched.
    pub async fn start(
        self: &Arc<Self>,
        definition: Arc<ScenarioDefinition>,
        team_id: TeamId,
    ) -> Result<RunId> {
        let mut active = self.active.write().await;
        if active.contains_key(&definition.id) {
            return Err(CoreError::RunAlreadyActive(definition.id));
        }

        let run = ScenarioRun::new(definition.id, team_id);
        let run_id = run.id;
        self.store.save_run(&run).await?;

        let cancel = CancellationToken::new();
        active.insert(
            definition.id,
            ActiveRun {
                run_id,
                cancel: cancel.clone(),
            },
        );
        drop(active);

        info!(%run_id, scenario_id = %definition.id, "starting scenario run");
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let worker = RunWorker::new(
                registry.config.clone(),
                registry.drivers.clone(),
                Arc::clone(&registry.store),
                Arc::clone(&registry.engine),
                Arc::clone(&registry.bus),
                cancel,
            );
            let mut run = run;
            if let Err(err) = worker.drive(&mut run, &definition).await {
                warn!(%run_id, %err, "run ended in failure");
            }
            registry.release(definition.id, run_id).await;
        });

        Ok(run_id)
    }

    /// Request cooperative cancellation of a run in any non-terminal
    /// state. The worker gives in-flight driver calls the configured
    /// grace period, then fails the run and compensates.
    pub async fn cancel(&self, run_id: RunId) -> Result<()> {
        let active = self.active.read().await;
        let entry = active
            .values()
            .find(|entry| entry.run_id == run_id)
            .ok_or(CoreError::UnknownRun(run_id))?;
        info!(%run_id, "cancellation requested");
        entry.cancel.cancel();
        Ok(())
    }

    /// Current state and last error of a run, active or archived.
    pub async fn status(&self, run_id: RunId) -> Result<RunStatus> {
        let run = self
            .store
            .load_run(run_id)
            .await?
            .ok_or(CoreError::UnknownRun(run_id))?;
        Ok(run.status())
    }

    pub async fn list_active(&self) -> Result<Vec<RunStatus>> {
        Ok(self
            .store
            .list_active()
            .await?
            .iter()
            .map(ScenarioRun::status)
            .collect())
    }

    /// Manual teardown of a settled (`Completed`/`Failed`) run.
    pub async fn request_teardown(&self, run_id: RunId) -> Result<()> {
        let mut run = self
            .store
            .load_run(run_id)
            .await?
            .ok_or(CoreError::UnknownRun(run_id))?;
        teardown(
            &self.config,
            self.store.as_ref(),
            self.drivers.provisioning.as_ref(),
            self.bus.as_ref(),
            &mut run,
            TransitionReason::StepCompleted("teardown requested".into()),
        )
        .await
    }

    /// Tear down settled runs older than the retention window.
    pub async fn sweep_retention(&self) -> Result<usize> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(self.config.retention)
                .unwrap_or_else(|_| ChronoDuration::days(30));
        let mut swept = 0;
        for mut run in self.store.list_all().await? {
            let settled = matches!(run.state, RunState::Completed | RunState::Failed);
            let expired = run.ended_at.is_some_and(|ended| ended < cutoff);
            if !settled || !expired {
                continue;
            }
            match teardown(
                &self.config,
                self.store.as_ref(),
                self.drivers.provisioning.as_ref(),
                self.bus.as_ref(),
                &mut run,
                TransitionReason::RetentionExpired,
            )
            .await
            {
                Ok(()) => swept += 1,
                Err(err) => warn!(run_id = %run.id, %err, "retention teardown failed"),
            }
        }
        if swept > 0 {
            info!(swept, "retention sweep released expired runs");
        }
        Ok(swept)
    }

    /// Reconcile stored runs after a restart: replay each active run's
    /// transition log, then fail and compensate runs whose workers died
    /// with the process.
    pub async fn recover_interrupted(&self) -> Result<Vec<RunId>> {
        let mut recovered = Vec::new();
        for mut run in self.store.list_active().await? {
            let durable = recover(self.store.as_ref(), &mut run).await?;
            if durable.is_terminal() {
                continue;
            }
            transition(
                self.store.as_ref(),
                &mut run,
                RunState::Failed,
                TransitionReason::Recovery,
            )
            .await?;
            run.last_error = Some("run interrupted by process restart".into());
            self.store.save_run(&run).await?;
            if let Err(err) = teardown(
                &self.config,
                self.store.as_ref(),
                self.drivers.provisioning.as_ref(),
                self.bus.as_ref(),
                &mut run,
                TransitionReason::Recovery,
            )
            .await
            {
                warn!(run_id = %run.id, %err, "recovery teardown failed");
            }
            recovered.push(run.id);
        }
        if !recovered.is_empty() {
            info!(count = recovered.len(), "recovered interrupted runs");
        }
        Ok(recovered)
    }

    async fn release(&self, scenario_id: ScenarioId, run_id: RunId) {
        let mut active = self.active.write().await;
        // Guard against a newer run for the same definition.
        if active.get(&scenario_id).is_some_and(|e| e.run_id == run_id) {
            active.remove(&scenario_id);
        }
    }
}
