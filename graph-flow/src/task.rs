use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{context::Context, error::Result};

/// Result of a task execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    /// Response to hand back to the caller
    pub response: Option<String>,
    /// Next action to take
    pub next_action: NextAction,
    /// Human-readable status persisted with the session
    pub status_message: Option<String>,
    /// Overall workflow progress (0-100) reached by this task
    pub progress: Option<u8>,
    /// Filled in by the graph with the id of the task that produced this result
    #[serde(default)]
    pub task_id: String,
}

impl TaskResult {
    pub fn new(response: Option<String>, next_action: NextAction) -> Self {
        Self {
            response,
            next_action,
            status_message: None,
            progress: None,
            task_id: String::new(),
        }
    }

    pub fn new_with_status(
        response: Option<String>,
        next_action: NextAction,
        status_message: Option<String>,
    ) -> Self {
        Self {
            status_message,
            ..Self::new(response, next_action)
        }
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress.min(100));
        self
    }
}

/// Defines what should happen after a task completes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NextAction {
    /// Move to the next task and hand control back to the caller
    Continue,
    /// Move to the next task and run it immediately
    ContinueAndExecute,
    /// Go to a specific task by ID
    GoTo(String),
    /// Stay on this task until the caller supplies more input
    WaitForInput,
    /// End the graph execution
    End,
}

/// Core trait that all tasks must implement
#[async_trait]
pub trait Task: Send + Sync {
    /// Unique identifier for this task
    fn id(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Execute the task with the given context
    async fn run(&self, context: Context) -> Result<TaskResult>;
}
