//! Orchestration pipeline: drives one scenario run through its lifecycle.
//!
//! Each run is owned by exactly one worker task. Steps delegate to the
//! external drivers; transient failures are retried with capped
//! exponential backoff, permanent ones fail the run immediately, and any
//! failure triggers compensation that releases every resource handle
//! recorded so far.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use rand::Rng;
use skirmish_model::{
    ResourceHandle, RunState, ScenarioDefinition, ScenarioRun, ScoreReport,
    TransitionReason,
};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::CoreConfig;
use crate::correlation::CorrelationEngine;
use crate::drivers::{
    AdversaryDriver, ConfigurationDriver, ProvisioningDriver, RunStore,
    TimelineSink,
};
use crate::error::{CoreError, Result};
use crate::events::{RunEvent, RunEventPublisher};
use crate::scoring;
use crate::state_machine::transition;

/// Bundle of driver implementations handed to the pipeline.
#[derive(Clone)]
pub struct Drivers {
    pub provisioning: Arc<dyn ProvisioningDriver>,
    pub configuration: Arc<dyn ConfigurationDriver>,
    pub adversary: Arc<dyn AdversaryDriver>,
    pub timeline_sink: Arc<dyn TimelineSink>,
}

impl std::fmt::Debug for Drivers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Drivers").finish_non_exhaustive()
    }
}

/// Worker that owns one run end to end.
pub struct RunWorker {
    config: CoreConfig,
    drivers: Drivers,
    store: Arc<dyn RunStore>,
    engine: Arc<CorrelationEngine>,
    bus: Arc<dyn RunEventPublisher>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for RunWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunWorker").finish_non_exhaustive()
    }
}

impl RunWorker {
    pub fn new(
        config: CoreConfig,
        drivers: Drivers,
        store: Arc<dyn RunStore>,
        engine: Arc<CorrelationEngine>,
        bus: Arc<dyn RunEventPublisher>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            drivers,
            store,
            engine,
            bus,
            cancel,
        }
    }

    /// Drive the run to a terminal state. On failure the run is moved to
    /// `Failed` and compensation runs before this returns; the run is
    /// never left holding resources without at least a teardown attempt.
    pub async fn drive(
        &self,
        run: &mut ScenarioRun,
        definition: &ScenarioDefinition,
    ) -> Result<ScoreReport> {
        match self.lifecycle(run, definition).await {
            Ok(report) => Ok(report),
            Err(err) => {
                // Failed runs never finalize; discard the correlation
                // buffer so late telemetry is rejected, not retained.
                self.engine.close_run(run.id).await;
                self.fail(run, &err).await;
                if let Err(comp_err) = teardown(
                    &self.config,
                    self.store.as_ref(),
                    self.drivers.provisioning.as_ref(),
                    self.bus.as_ref(),
                    run,
                    TransitionReason::StepCompleted("compensating failed run".into()),
                )
                .await
                {
                    error!(run_id = %run.id, %comp_err, "compensation failed");
                }
                Err(err)
            }
        }
    }

    async fn lifecycle(
        &self,
        run: &mut ScenarioRun,
        definition: &ScenarioDefinition,
    ) -> Result<ScoreReport> {
        // Provisioning. Handles from failed attempts are kept so
        // compensation can release a partially applied topology.
        self.advance(run, RunState::Provisioning, "queued for execution")
            .await?;
        let partial = Mutex::new(Vec::<ResourceHandle>::new());
        let partial_ref = &partial;
        let provisioned = self
            .step(run, "provision", || async move {
                match self.drivers.provisioning.apply(&definition.topology).await {
                    Ok(handles) => Ok(handles),
                    Err(failure) => {
                        let mut held = partial_ref.lock().await;
                        for handle in failure.partial {
                            if !held.contains(&handle) {
                                held.push(handle);
                            }
                        }
                        Err(failure.error)
                    }
                }
            })
            .await;
        let mut handles = partial.into_inner();
        match provisioned {
            Ok(full) => {
                for handle in full {
                    if !handles.contains(&handle) {
                        handles.push(handle);
                    }
                }
            }
            Err(err) => {
                run.resource_handles = handles;
                self.store.save_run(run).await?;
                return Err(err);
            }
        }
        run.resource_handles = handles;
        self.store.save_run(run).await?;
        self.engine.open_run(run.id, Utc::now()).await;

        // Configuring
        self.advance(run, RunState::Configuring, "topology applied")
            .await?;
        let summary = self
            .step(run, "configure", || {
                self.drivers
                    .configuration
                    .run(&definition.playbook, &run.resource_handles)
            })
            .await?;
        if summary.failed > 0 {
            return Err(CoreError::Permanent(format!(
                "configuration failed on {} host(s)",
                summary.failed
            )));
        }

        // AttackExecuting
        self.advance(run, RunState::AttackExecuting, "hosts configured")
            .await?;
        let operation = self
            .step(run, "start_operation", || {
                self.drivers
                    .adversary
                    .start_operation(&definition.attack_plan, &run.resource_handles)
            })
            .await?;
        let stream = self
            .step(run, "event_stream", || {
                self.drivers.adversary.event_stream(&operation)
            })
            .await?;

        // Forward adversary telemetry into the correlation buffer.
        // Rejected events are dropped locally; they never fail the run.
        let engine = Arc::clone(&self.engine);
        let run_id = run.id;
        let mut forwarder = tokio::spawn(async move {
            let mut stream = stream;
            while let Some(event) = stream.next().await {
                if let Err(err) = engine.ingest(run_id, event).await {
                    warn!(%run_id, %err, "dropping rejected event");
                }
            }
        });

        let cancelled = tokio::select! {
            _ = &mut forwarder => false,
            _ = self.cancel.cancelled() => true,
        };
        if cancelled {
            // Cooperative stop: ask the driver to wind down, then give the
            // stream the configured grace period to close on its own.
            if let Err(err) = self.drivers.adversary.stop_operation(&operation).await {
                warn!(run_id = %run.id, %err, "stop_operation failed during cancel");
            }
            if timeout(self.config.cancel_grace, &mut forwarder).await.is_err() {
                warn!(
                    run_id = %run.id,
                    grace_secs = self.config.cancel_grace.as_secs(),
                    "adversary stream did not close within grace period"
                );
                forwarder.abort();
            }
            return Err(CoreError::Transient("run cancelled".into()));
        }
        self.engine.flush(run.id).await?;

        // Monitoring: keep draining collector telemetry for the configured
        // window after the operation ends.
        self.advance(run, RunState::Monitoring, "attack operation finished")
            .await?;
        tokio::select! {
            _ = tokio::time::sleep(self.config.monitor_window) => {}
            _ = self.cancel.cancelled() => {
                return Err(CoreError::Transient("run cancelled".into()));
            }
        }

        // Scoring: finalization barrier, then pure evaluation.
        self.advance(run, RunState::Scoring, "monitoring window elapsed")
            .await?;
        let timeline = self.engine.finalize(run.id).await?;
        self.bus
            .publish(RunEvent::TimelineFinalized {
                run_id: run.id,
                event_count: timeline.len(),
            })
            .await?;
        self.step(run, "timeline_sink", || {
            self.drivers.timeline_sink.ingest_bulk(&timeline)
        })
        .await?;

        let report = scoring::score(definition, run, &timeline)?;
        self.store.save_results(run.id, &report.objectives).await?;
        self.advance(run, RunState::Completed, "scoring finished").await?;
        info!(run_id = %run.id, score = report.total_score, "run completed");
        Ok(report)
    }

    async fn advance(
        &self,
        run: &mut ScenarioRun,
        to: RunState,
        why: &str,
    ) -> Result<()> {
        let from = run.state;
        transition(
            self.store.as_ref(),
            run,
            to,
            TransitionReason::StepCompleted(why.to_string()),
        )
        .await?;
        self.bus
            .publish(RunEvent::StateChanged {
                run_id: run.id,
                from,
                to,
            })
            .await
    }

    /// Execute one step with per-attempt timeout and capped exponential
    /// backoff. Only transient errors are retried; a timed-out call counts
    /// as transient. Cancellation is honored between attempts, never by
    /// killing an in-flight call.
    async fn step<T, F, Fut>(
        &self,
        run: &ScenarioRun,
        name: &str,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let retry = self.config.retry;
        for attempt in 1..=retry.max_attempts {
            if self.cancel.is_cancelled() {
                return Err(CoreError::Transient("run cancelled".into()));
            }
            let outcome = match timeout(self.config.step_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(CoreError::Transient(format!(
                    "step `{name}` timed out after {:?}",
                    self.config.step_timeout
                ))),
            };
            match outcome {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < retry.max_attempts => {
                    let delay = retry.delay_for(attempt) + jitter();
                    warn!(
                        run_id = %run.id,
                        step = name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        %err,
                        "transient step failure, backing off"
                    );
                    self.bus
                        .publish(RunEvent::StepRetrying {
                            run_id: run.id,
                            step: name.to_string(),
                            attempt,
                            error: err.to_string(),
                        })
                        .await?;
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => {
                            return Err(CoreError::Transient("run cancelled".into()));
                        }
                    }
                }
                Err(err) => return Err(err),
            }
        }
        Err(CoreError::Transient(format!(
            "step `{name}` exhausted its retry budget"
        )))
    }

    async fn fail(&self, run: &mut ScenarioRun, err: &CoreError) {
        if run.state == RunState::Failed {
            return;
        }
        let reason = if self.cancel.is_cancelled() {
            TransitionReason::Cancelled(err.to_string())
        } else {
            TransitionReason::StepFailed(err.to_string())
        };
        let from = run.state;
        match transition(self.store.as_ref(), run, RunState::Failed, reason).await {
            Ok(_) => {
                let _ = self
                    .bus
                    .publish(RunEvent::StateChanged {
                        run_id: run.id,
                        from,
                        to: RunState::Failed,
                    })
                    .await;
            }
            Err(trans_err) => {
                error!(run_id = %run.id, %trans_err, "could not record failure transition");
            }
        }
    }
}

fn jitter() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(0..250))
}

/// Release every resource handle recorded on the run.
///
/// Runs after any failure and for retention/manual teardown of settled
/// runs. Destroy is retried a bounded number of times; when the budget is
/// exhausted the handles are surfaced as an `OrphanedResources` alert for
/// manual intervention instead of looping forever.
pub async fn teardown(
    config: &CoreConfig,
    store: &dyn RunStore,
    provisioning: &dyn ProvisioningDriver,
    bus: &dyn RunEventPublisher,
    run: &mut ScenarioRun,
    reason: TransitionReason,
) -> Result<()> {
    transition(store, run, RunState::Destroying, reason).await?;

    if run.resource_handles.is_empty() {
        transition(
            store,
            run,
            RunState::Destroyed,
            TransitionReason::StepCompleted("no resources to release".into()),
        )
        .await?;
        return Ok(());
    }

    let mut last_error = String::new();
    let handle_count = run.resource_handles.len();
    for attempt in 1..=config.compensation_attempts {
        let destroyed = provisioning.destroy(&run.resource_handles).await;
        match destroyed {
            Ok(()) => {
                transition(
                    store,
                    run,
                    RunState::Destroyed,
                    TransitionReason::StepCompleted(format!(
                        "released {handle_count} resource handle(s)"
                    )),
                )
                .await?;
                return Ok(());
            }
            Err(err) => {
                warn!(
                    run_id = %run.id,
                    attempt,
                    %err,
                    "compensation destroy failed"
                );
                last_error = err.to_string();
                if attempt < config.compensation_attempts {
                    tokio::time::sleep(config.retry.delay_for(attempt)).await;
                }
            }
        }
    }

    let handles = run.resource_handles.clone();
    error!(
        run_id = %run.id,
        handles = handles.len(),
        "compensation exhausted, resources orphaned"
    );
    bus.publish(RunEvent::OrphanedResources {
        run_id: run.id,
        handles: handles.clone(),
    })
    .await?;
    transition(
        store,
        run,
        RunState::Failed,
        TransitionReason::StepFailed(format!(
            "orphaned resources after teardown: {last_error}"
        )),
    )
    .await?;
    Err(CoreError::OrphanedResources {
        run_id: run.id,
        handles,
    })
}
