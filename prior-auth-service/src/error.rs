use std::time::Duration;

use graph_flow::GraphError;
use thiserror::Error;

/// Failure of one call to an external capability (search, extraction, analysis, validation).
///
/// Every variant is recoverable: pipeline stages turn it into partial or fallback data.
#[derive(Debug, Clone, Error)]
pub enum CapabilityError {
    #[error("{operation} timed out after {}ms", .after.as_millis())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("capability unavailable: {0}")]
    Unavailable(String),
}

impl CapabilityError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Transport(_))
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("case not found: {0}")]
    CaseNotFound(String),

    #[error("case already exists: {0}")]
    Duplicate(String),
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("case not found: {0}")]
    CaseNotFound(String),

    #[error("case {0} is already running")]
    AlreadyRunning(String),

    #[error("case {0} is not waiting for clinician input")]
    NotPaused(String),

    #[error("invalid case: {0}")]
    InvalidCase(String),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_capability_errors() {
        let timeout = CapabilityError::Timeout {
            operation: "search",
            after: Duration::from_secs(1),
        };
        assert!(timeout.is_transient());
        assert!(CapabilityError::Transport("reset".to_string()).is_transient());
        assert!(!CapabilityError::Malformed("not json".to_string()).is_transient());
        assert!(!CapabilityError::Unavailable("offline".to_string()).is_transient());
    }
}
