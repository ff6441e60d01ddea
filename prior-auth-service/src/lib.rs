pub mod agent;
pub mod cache;
pub mod capabilities;
pub mod config;
pub mod error;
pub mod llm;
pub mod models;
pub mod orchestrator;
pub mod pipeline;
pub mod service;
pub mod store;
pub mod tasks;
pub mod workflow;

pub use config::PipelineConfig;
pub use error::{CapabilityError, OrchestratorError};
pub use orchestrator::Orchestrator;
pub use pipeline::{Capabilities, Pipeline};
pub use service::{AppState, build_router, create_app, create_app_state};
pub use workflow::{build_prior_auth_workflow, create_case_session};
pub use models::*;
