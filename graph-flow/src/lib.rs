pub mod context;
pub mod error;
pub mod graph;
pub mod runner;
pub mod signal;
pub mod storage;
pub mod storage_postgres;
pub mod task;

// Re-export commonly used types
pub use context::Context;
pub use error::{GraphError, Result};
pub use graph::{ExecutionResult, ExecutionStatus, Graph, GraphBuilder};
pub use runner::FlowRunner;
pub use signal::StopSignal;
pub use storage::{InMemorySessionStorage, Session, SessionStorage};
pub use storage_postgres::PostgresSessionStorage;
pub use task::{NextAction, Task, TaskResult};
