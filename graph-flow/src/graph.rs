use dashmap::DashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::{
    context::Context,
    error::{GraphError, Result},
    signal::StopSignal,
    storage::Session,
    task::{NextAction, Task, TaskResult},
};

/// Type alias for edge condition functions
pub type EdgeCondition = Arc<dyn Fn(&Context) -> bool + Send + Sync>;

/// Edge between tasks in the graph
#[derive(Clone)]
pub struct Edge {
    pub from: String,
    pub to: String,
    pub condition: Option<EdgeCondition>,
}

/// A graph of tasks that can be executed
pub struct Graph {
    pub id: String,
    tasks: DashMap<String, Arc<dyn Task>>,
    edges: Mutex<Vec<Edge>>,
    start_task_id: Mutex<Option<String>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Graph {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tasks: DashMap::new(),
            edges: Mutex::new(Vec::new()),
            start_task_id: Mutex::new(None),
        }
    }

    /// Add a task to the graph. The first task added becomes the start task.
    pub fn add_task(&self, task: Arc<dyn Task>) -> &Self {
        let task_id = task.id().to_string();
        let is_first = self.tasks.is_empty();
        self.tasks.insert(task_id.clone(), task);

        if is_first {
            *lock(&self.start_task_id) = Some(task_id);
        }

        self
    }

    pub fn set_start_task(&self, task_id: impl Into<String>) -> &Self {
        let task_id = task_id.into();
        if self.tasks.contains_key(&task_id) {
            *lock(&self.start_task_id) = Some(task_id);
        }
        self
    }

    pub fn add_edge(&self, from: impl Into<String>, to: impl Into<String>) -> &Self {
        lock(&self.edges).push(Edge {
            from: from.into(),
            to: to.into(),
            condition: None,
        });
        self
    }

    /// Add a branch: `yes` is taken when `condition` holds, `no` otherwise
    pub fn add_conditional_edge<F>(
        &self,
        from: impl Into<String>,
        condition: F,
        yes: impl Into<String>,
        no: impl Into<String>,
    ) -> &Self
    where
        F: Fn(&Context) -> bool + Send + Sync + 'static,
    {
        let from = from.into();
        let mut edges = lock(&self.edges);
        edges.push(Edge {
            from: from.clone(),
            to: yes.into(),
            condition: Some(Arc::new(condition)),
        });
        edges.push(Edge {
            from,
            to: no.into(),
            condition: None,
        });
        self
    }

    /// Run the session's current task and move the session along the graph.
    pub async fn execute_session(&self, session: &mut Session) -> Result<ExecutionResult> {
        let signal = session.stop_signal.clone();
        self.execute_session_with_signal(session, &signal).await
    }

    /// Same as [`Graph::execute_session`], but stops at the next task boundary once
    /// `signal` is raised.
    pub async fn execute_session_with_signal(
        &self,
        session: &mut Session,
        signal: &StopSignal,
    ) -> Result<ExecutionResult> {
        if signal.is_raised() {
            info!(session_id = %session.id, task_id = %session.current_task_id, "session stopped before task");
            return Ok(ExecutionResult::from_session(session, None, ExecutionStatus::Cancelled));
        }

        let result = self
            .execute_single_task(&session.current_task_id, session.context.clone())
            .await?;

        session.status_message = result.status_message.clone();
        if let Some(progress) = result.progress {
            session.record_progress(progress);
        }

        match &result.next_action {
            NextAction::Continue => match self.find_next_task(&result.task_id, &session.context) {
                Some(next_task_id) => {
                    session.current_task_id = next_task_id.clone();
                    Ok(ExecutionResult::from_session(
                        session,
                        result.response,
                        ExecutionStatus::Advanced { next_task_id },
                    ))
                }
                None => {
                    session.current_task_id = result.task_id.clone();
                    Ok(ExecutionResult::from_session(
                        session,
                        result.response,
                        ExecutionStatus::WaitingForInput,
                    ))
                }
            },
            NextAction::ContinueAndExecute => {
                match self.find_next_task(&result.task_id, &session.context) {
                    Some(next_task_id) => {
                        session.current_task_id = next_task_id;
                        Box::pin(self.execute_session_with_signal(session, signal)).await
                    }
                    None => {
                        session.current_task_id = result.task_id.clone();
                        Ok(ExecutionResult::from_session(
                            session,
                            result.response,
                            ExecutionStatus::WaitingForInput,
                        ))
                    }
                }
            }
            NextAction::WaitForInput => {
                session.current_task_id = result.task_id.clone();
                Ok(ExecutionResult::from_session(
                    session,
                    result.response,
                    ExecutionStatus::WaitingForInput,
                ))
            }
            NextAction::End => {
                session.current_task_id = result.task_id.clone();
                Ok(ExecutionResult::from_session(
                    session,
                    result.response,
                    ExecutionStatus::Completed,
                ))
            }
            NextAction::GoTo(target_id) => {
                if self.tasks.contains_key(target_id) {
                    session.current_task_id = target_id.clone();
                    Ok(ExecutionResult::from_session(
                        session,
                        result.response,
                        ExecutionStatus::Advanced {
                            next_task_id: target_id.clone(),
                        },
                    ))
                } else {
                    Err(GraphError::TaskNotFound(target_id.clone()))
                }
            }
        }
    }

    /// Execute a single task without following any edges
    async fn execute_single_task(&self, task_id: &str, context: Context) -> Result<TaskResult> {
        let task = self
            .tasks
            .get(task_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| GraphError::TaskNotFound(task_id.to_string()))?;

        debug!(graph_id = %self.id, task_id = %task_id, "running task");
        let mut result = task.run(context).await?;
        result.task_id = task_id.to_string();

        Ok(result)
    }

    /// Find the next task based on edges and conditions.
    ///
    /// Edges are checked in insertion order; the first conditional edge whose condition
    /// holds wins, otherwise the first unconditional edge is taken.
    pub fn find_next_task(&self, current_task_id: &str, context: &Context) -> Option<String> {
        let edges = lock(&self.edges);
        let outgoing = || edges.iter().filter(|edge| edge.from == current_task_id);

        outgoing()
            .find(|edge| edge.condition.as_ref().is_some_and(|condition| condition(context)))
            .or_else(|| outgoing().find(|edge| edge.condition.is_none()))
            .map(|edge| edge.to.clone())
    }

    pub fn start_task_id(&self) -> Option<String> {
        lock(&self.start_task_id).clone()
    }

    pub fn get_task(&self, task_id: &str) -> Option<Arc<dyn Task>> {
        self.tasks.get(task_id).map(|entry| entry.clone())
    }
}

/// Builder for creating graphs
pub struct GraphBuilder {
    graph: Graph,
}

impl GraphBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            graph: Graph::new(id),
        }
    }

    pub fn add_task(self, task: Arc<dyn Task>) -> Self {
        self.graph.add_task(task);
        self
    }

    pub fn add_edge(self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.graph.add_edge(from, to);
        self
    }

    pub fn add_conditional_edge<F>(
        self,
        from: impl Into<String>,
        condition: F,
        yes: impl Into<String>,
        no: impl Into<String>,
    ) -> Self
    where
        F: Fn(&Context) -> bool + Send + Sync + 'static,
    {
        self.graph.add_conditional_edge(from, condition, yes, no);
        self
    }

    pub fn set_start_task(self, task_id: impl Into<String>) -> Self {
        self.graph.set_start_task(task_id);
        self
    }

    pub fn build(self) -> Graph {
        self.graph
    }
}

/// Outcome of one `execute_session` call
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub response: Option<String>,
    pub status: ExecutionStatus,
    pub progress: u8,
    pub status_message: Option<String>,
}

impl ExecutionResult {
    fn from_session(session: &Session, response: Option<String>, status: ExecutionStatus) -> Self {
        Self {
            response,
            status,
            progress: session.progress,
            status_message: session.status_message.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// One task finished and the session moved on to `next_task_id`
    Advanced { next_task_id: String },
    /// The current task needs outside input before it can finish
    WaitingForInput,
    /// Workflow completed successfully
    Completed,
    /// The stop signal was raised before the next task started
    Cancelled,
    /// Error occurred during execution
    Error(String),
}
