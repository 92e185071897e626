//! Scripted driver fakes shared by the integration tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use skirmish_core::drivers::{
    AdversaryDriver, ApplyError, ConfigSummary, ConfigurationDriver,
    ProvisioningDriver, TimelineSink,
};
use skirmish_core::{CoreError, Result};
use skirmish_model::{
    AttackPlanRef, CorrelatedEvent, NetworkSegment, ObjectiveSpec,
    OperationId, PlaybookRef, RawEvent, ResourceHandle, ScenarioDefinition,
    ScenarioId, TopologySpec, VmRole,
};
use tokio::sync::{mpsc, Notify};

/// Install a subscriber once so failing tests print engine logs; tune
/// with `RUST_LOG`.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Ordered record of observable side effects, used to assert sequencing
/// (e.g. compensation only after the adversary stream closed).
#[derive(Clone, Default)]
pub struct CallLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: impl Into<String>) {
        self.entries.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries.lock().unwrap().iter().position(|e| e == entry)
    }
}

pub fn definition(objectives: Vec<ObjectiveSpec>) -> Arc<ScenarioDefinition> {
    Arc::new(ScenarioDefinition {
        id: ScenarioId::new(),
        name: "smb-lateral-drill".into(),
        version: 1,
        objectives,
        topology: TopologySpec {
            segments: vec![NetworkSegment {
                name: "corp".into(),
                cidr: "10.0.0.0/24".into(),
                roles: vec![VmRole::Attacker, VmRole::Workstation, VmRole::Server],
            }],
        },
        playbook: PlaybookRef("harden.yml".into()),
        attack_plan: AttackPlanRef("smb-lateral".into()),
    })
}

pub struct FakeProvisioner {
    handles: Vec<ResourceHandle>,
    /// Errors returned by `apply` before it starts succeeding.
    apply_failures: Mutex<VecDeque<ApplyError>>,
    destroy_failures: Mutex<VecDeque<CoreError>>,
    pub apply_calls: AtomicU32,
    pub destroyed: Mutex<Vec<Vec<ResourceHandle>>>,
    log: CallLog,
}

impl FakeProvisioner {
    pub fn new(log: CallLog) -> Self {
        Self {
            handles: vec!["vm-attacker".into(), "vm-ws".into(), "net-corp".into()],
            apply_failures: Mutex::new(VecDeque::new()),
            destroy_failures: Mutex::new(VecDeque::new()),
            apply_calls: AtomicU32::new(0),
            destroyed: Mutex::new(Vec::new()),
            log,
        }
    }

    pub fn fail_apply_with(self, errors: Vec<CoreError>) -> Self {
        *self.apply_failures.lock().unwrap() =
            errors.into_iter().map(ApplyError::from).collect();
        self
    }

    /// Script one apply failure that leaves half-built resources behind.
    pub fn fail_apply_abandoning(
        self,
        partial: Vec<ResourceHandle>,
        error: CoreError,
    ) -> Self {
        self.apply_failures
            .lock()
            .unwrap()
            .push_back(ApplyError { partial, error });
        self
    }

    pub fn fail_destroy_with(self, errors: Vec<CoreError>) -> Self {
        *self.destroy_failures.lock().unwrap() = errors.into();
        self
    }

    pub fn handles(&self) -> Vec<ResourceHandle> {
        self.handles.clone()
    }
}

#[async_trait]
impl ProvisioningDriver for FakeProvisioner {
    async fn apply(
        &self,
        _spec: &TopologySpec,
    ) -> std::result::Result<Vec<ResourceHandle>, ApplyError> {
        self.apply_calls.fetch_add(1, Ordering::SeqCst);
        self.log.record("apply");
        if let Some(err) = self.apply_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(self.handles.clone())
    }

    async fn destroy(&self, handles: &[ResourceHandle]) -> Result<()> {
        self.log.record("destroy");
        if let Some(err) = self.destroy_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.destroyed.lock().unwrap().push(handles.to_vec());
        Ok(())
    }
}

pub struct FakeConfigurator {
    failures: Mutex<VecDeque<CoreError>>,
    pub run_calls: AtomicU32,
}

impl FakeConfigurator {
    pub fn new() -> Self {
        Self {
            failures: Mutex::new(VecDeque::new()),
            run_calls: AtomicU32::new(0),
        }
    }

    pub fn fail_with(self, errors: Vec<CoreError>) -> Self {
        *self.failures.lock().unwrap() = errors.into();
        self
    }
}

#[async_trait]
impl ConfigurationDriver for FakeConfigurator {
    async fn run(
        &self,
        _playbook: &PlaybookRef,
        inventory: &[ResourceHandle],
    ) -> Result<ConfigSummary> {
        self.run_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(ConfigSummary {
            hosts_configured: inventory.len() as u32,
            changed: inventory.len() as u32,
            failed: 0,
        })
    }
}

/// Adversary fake backed by a channel: the test feeds raw events in and
/// decides when the stream closes. `stop_operation` wakes the feeder so
/// it can wind the stream down, mimicking a cooperative driver.
pub struct FakeAdversary {
    stream_rx: Mutex<Option<mpsc::UnboundedReceiver<RawEvent>>>,
    pub stop_requested: Arc<Notify>,
    log: CallLog,
}

impl FakeAdversary {
    pub fn new(log: CallLog) -> (Self, mpsc::UnboundedSender<RawEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let fake = Self {
            stream_rx: Mutex::new(Some(rx)),
            stop_requested: Arc::new(Notify::new()),
            log,
        };
        (fake, tx)
    }
}

#[async_trait]
impl AdversaryDriver for FakeAdversary {
    async fn start_operation(
        &self,
        _plan: &AttackPlanRef,
        _targets: &[ResourceHandle],
    ) -> Result<OperationId> {
        self.log.record("start_operation");
        Ok(OperationId("op-1".into()))
    }

    async fn event_stream(
        &self,
        _operation: &OperationId,
    ) -> Result<BoxStream<'static, RawEvent>> {
        let rx = self
            .stream_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| CoreError::Permanent("stream already taken".into()))?;
        let log = self.log.clone();
        let stream = tokio_stream::wrappers::UnboundedReceiverStream::new(rx)
            .chain(futures::stream::poll_fn(move |_| {
                log.record("stream_closed");
                std::task::Poll::Ready(Option::<RawEvent>::None)
            }));
        Ok(stream.boxed())
    }

    async fn stop_operation(&self, _operation: &OperationId) -> Result<()> {
        self.log.record("stop_operation");
        self.stop_requested.notify_one();
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeSink {
    pub batches: Mutex<Vec<Vec<CorrelatedEvent>>>,
}

impl FakeSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TimelineSink for FakeSink {
    async fn ingest_bulk(&self, events: &[CorrelatedEvent]) -> Result<()> {
        self.batches.lock().unwrap().push(events.to_vec());
        Ok(())
    }
}

/// Poll a condition until it holds or the (auto-advanced) clock gives up.
pub async fn wait_until<F, Fut>(mut probe: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..5_000 {
        if probe().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached in time");
}
