//! FlowRunner – loads a session, executes exactly **one** graph step, and persists the
//! updated session back to storage.
//!
//! Callers that drive a workflow to completion (a background orchestrator, a CLI demo) simply
//! call [`FlowRunner::run`] in a loop until the returned status is no longer
//! [`ExecutionStatus::Advanced`](crate::ExecutionStatus::Advanced). Because the session is
//! saved after every step, progress and status are always visible to readers of the storage.

use std::sync::Arc;

use crate::{
    error::{GraphError, Result},
    graph::{ExecutionResult, Graph},
    signal::StopSignal,
    storage::SessionStorage,
};

/// High-level helper that orchestrates the common _load → execute → save_ pattern.
#[derive(Clone)]
pub struct FlowRunner {
    graph: Arc<Graph>,
    storage: Arc<dyn SessionStorage>,
}

impl FlowRunner {
    pub fn new(graph: Arc<Graph>, storage: Arc<dyn SessionStorage>) -> Self {
        Self { graph, storage }
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    pub fn storage(&self) -> &Arc<dyn SessionStorage> {
        &self.storage
    }

    /// Execute **exactly one** task for the given `session_id` and persist the updated session.
    pub async fn run(&self, session_id: &str) -> Result<ExecutionResult> {
        self.run_with_signal(session_id, &StopSignal::new()).await
    }

    /// Like [`FlowRunner::run`], but the step is skipped when `signal` has been raised.
    pub async fn run_with_signal(
        &self,
        session_id: &str,
        signal: &StopSignal,
    ) -> Result<ExecutionResult> {
        let mut session = self
            .storage
            .get(session_id)
            .await?
            .ok_or_else(|| GraphError::SessionNotFound(session_id.to_string()))?;

        let result = self
            .graph
            .execute_session_with_signal(&mut session, signal)
            .await?;

        self.storage.save(session).await?;

        Ok(result)
    }
}
