//! In-memory `RunStore` backing tests and single-process deployments.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use skirmish_model::{
    ObjectiveResult, RunId, ScenarioRun, StateTransition,
};
use tokio::sync::RwLock;

use crate::drivers::RunStore;
use crate::error::Result;

#[derive(Debug, Default)]
struct StoreInner {
    runs: HashMap<RunId, ScenarioRun>,
    transitions: HashMap<RunId, Vec<StateTransition>>,
    results: HashMap<RunId, Vec<ObjectiveResult>>,
}

/// Document-style store keeping everything behind one `RwLock`.
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    inner: Arc<RwLock<StoreInner>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn results(&self, run_id: RunId) -> Vec<ObjectiveResult> {
        self.inner
            .read()
            .await
            .results
            .get(&run_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn save_run(&self, run: &ScenarioRun) -> Result<()> {
        self.inner.write().await.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn load_run(&self, run_id: RunId) -> Result<Option<ScenarioRun>> {
        Ok(self.inner.read().await.runs.get(&run_id).cloned())
    }

    async fn append_transition(
        &self,
        run_id: RunId,
        transition: &StateTransition,
    ) -> Result<()> {
        self.inner
            .write()
            .await
            .transitions
            .entry(run_id)
            .or_default()
            .push(transition.clone());
        Ok(())
    }

    async fn load_transitions(&self, run_id: RunId) -> Result<Vec<StateTransition>> {
        Ok(self
            .inner
            .read()
            .await
            .transitions
            .get(&run_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_results(
        &self,
        run_id: RunId,
        results: &[ObjectiveResult],
    ) -> Result<()> {
        self.inner
            .write()
            .await
            .results
            .insert(run_id, results.to_vec());
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<ScenarioRun>> {
        Ok(self
            .inner
            .read()
            .await
            .runs
            .values()
            .filter(|run| !run.state.is_terminal())
            .cloned()
            .collect())
    }

    async fn list_all(&self) -> Result<Vec<ScenarioRun>> {
        Ok(self.inner.read().await.runs.values().cloned().collect())
    }
}
