use thiserror::Error;

/// Errors raised by the workflow engine itself
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("task execution failed: {0}")]
    TaskExecutionFailed(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("context error: {0}")]
    ContextError(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("storage error: {0}")]
    StorageError(String),
}

pub type Result<T> = std::result::Result<T, GraphError>;

impl From<sqlx::Error> for GraphError {
    fn from(err: sqlx::Error) -> Self {
        GraphError::StorageError(err.to_string())
    }
}

impl From<serde_json::Error> for GraphError {
    fn from(err: serde_json::Error) -> Self {
        GraphError::ContextError(err.to_string())
    }
}
