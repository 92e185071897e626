//! Capability contracts for the external tools the pipeline drives.
//!
//! Concrete backends (infrastructure-as-code provisioners, playbook
//! runners, adversary-emulation servers, search indices, document stores)
//! live outside this crate; the pipeline is written against these traits
//! only and receives implementations as `Arc<dyn _>` at construction.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use skirmish_model::{
    CorrelatedEvent, ObjectiveResult, OperationId, RawEvent, ResourceHandle,
    RunId, ScenarioRun, StateTransition, TopologySpec,
};
use skirmish_model::{AttackPlanRef, PlaybookRef};

use crate::error::{CoreError, Result};

/// Summary returned by a configuration run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSummary {
    pub hosts_configured: u32,
    pub changed: u32,
    pub failed: u32,
}

/// Failure from a provisioning apply, carrying whatever the driver
/// managed to allocate before it failed. Everything in `partial` is
/// recorded on the run and released during compensation; a partially
/// applied topology is never left orphaned.
#[derive(Debug)]
pub struct ApplyError {
    pub partial: Vec<ResourceHandle>,
    pub error: CoreError,
}

impl From<CoreError> for ApplyError {
    fn from(error: CoreError) -> Self {
        Self {
            partial: Vec::new(),
            error,
        }
    }
}

/// Provisions and tears down exercise infrastructure.
#[async_trait]
pub trait ProvisioningDriver: Send + Sync {
    /// Partial failures must report the handles they allocated via
    /// [`ApplyError::partial`].
    async fn apply(
        &self,
        spec: &TopologySpec,
    ) -> std::result::Result<Vec<ResourceHandle>, ApplyError>;

    /// Must be idempotent: destroying an already-released handle succeeds.
    async fn destroy(&self, handles: &[ResourceHandle]) -> Result<()>;
}

/// Applies configuration playbooks to provisioned hosts.
#[async_trait]
pub trait ConfigurationDriver: Send + Sync {
    async fn run(
        &self,
        playbook: &PlaybookRef,
        inventory: &[ResourceHandle],
    ) -> Result<ConfigSummary>;
}

/// Runs scripted adversary operations and streams back their telemetry.
#[async_trait]
pub trait AdversaryDriver: Send + Sync {
    async fn start_operation(
        &self,
        plan: &AttackPlanRef,
        targets: &[ResourceHandle],
    ) -> Result<OperationId>;

    /// Lazy, unbounded sequence of raw events for a running operation.
    /// The stream ends when the operation finishes or is stopped.
    async fn event_stream(
        &self,
        operation: &OperationId,
    ) -> Result<BoxStream<'static, RawEvent>>;

    /// Cooperative stop; the driver is expected to close the event stream
    /// shortly afterwards.
    async fn stop_operation(&self, operation: &OperationId) -> Result<()>;
}

/// Persists finalized timelines to an external search/replay index.
#[async_trait]
pub trait TimelineSink: Send + Sync {
    async fn ingest_bulk(&self, events: &[CorrelatedEvent]) -> Result<()>;
}

/// Durable store for runs, their transition logs and scoring results.
///
/// Treated as a transactional document interface; the in-memory
/// implementation in [`crate::store`] backs tests and single-process
/// deployments.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn save_run(&self, run: &ScenarioRun) -> Result<()>;

    async fn load_run(&self, run_id: RunId) -> Result<Option<ScenarioRun>>;

    /// Write-ahead append: called before the in-memory state change
    /// becomes externally visible.
    async fn append_transition(
        &self,
        run_id: RunId,
        transition: &StateTransition,
    ) -> Result<()>;

    async fn load_transitions(&self, run_id: RunId) -> Result<Vec<StateTransition>>;

    async fn save_results(
        &self,
        run_id: RunId,
        results: &[ObjectiveResult],
    ) -> Result<()>;

    async fn list_active(&self) -> Result<Vec<ScenarioRun>>;

    /// Every stored run, terminal ones included; the retention sweep
    /// reads this to find runs due for teardown.
    async fn list_all(&self) -> Result<Vec<ScenarioRun>>;
}
