//! In-process run lifecycle notifications.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use skirmish_model::{ResourceHandle, RunId, RunState};
use tokio::sync::broadcast;

use crate::error::Result;

/// Lifecycle notification emitted by the orchestration pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RunEvent {
    StateChanged {
        run_id: RunId,
        from: RunState,
        to: RunState,
    },
    StepRetrying {
        run_id: RunId,
        step: String,
        attempt: u32,
        error: String,
    },
    /// Compensation exhausted its budget; operator attention required.
    OrphanedResources {
        run_id: RunId,
        handles: Vec<ResourceHandle>,
    },
    TimelineFinalized {
        run_id: RunId,
        event_count: usize,
    },
}

#[async_trait]
pub trait RunEventPublisher: Send + Sync {
    async fn publish(&self, event: RunEvent) -> Result<()>;
}

/// Lightweight in-process event bus fanning out run notifications to
/// observers inside the runtime. Keeps the wiring flexible until an
/// external message broker is plugged in at the platform boundary.
#[derive(Debug)]
pub struct InProcRunEventBus {
    sender: broadcast::Sender<RunEvent>,
}

impl InProcRunEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl RunEventPublisher for InProcRunEventBus {
    async fn publish(&self, event: RunEvent) -> Result<()> {
        // No subscribers is fine; notifications are best-effort.
        let _ = self.sender.send(event);
        Ok(())
    }
}
