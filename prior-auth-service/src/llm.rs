//! Text-completion backends behind the policy agent.
//!
//! A backend only turns a prompt into text. Interpreting that text is the
//! agent's job, so the same parsing applies whichever provider answered.

use std::sync::Arc;

use async_trait::async_trait;
use rig::client::CompletionClient;
use rig::completion::Prompt;
use rig::providers::{openai, openrouter};
use tracing::{debug, warn};

use crate::config::{LlmConfig, LlmProvider};
use crate::error::CapabilityError;

/// Which model family a request needs. Search calls go to a web-search capable model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmPurpose {
    Search,
    Analysis,
}

#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub purpose: LlmPurpose,
    pub preamble: String,
    pub prompt: String,
    pub temperature: f64,
}

impl LlmRequest {
    pub fn search(preamble: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            purpose: LlmPurpose::Search,
            preamble: preamble.into(),
            prompt: prompt.into(),
            temperature: 0.1,
        }
    }

    pub fn analysis(preamble: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            purpose: LlmPurpose::Analysis,
            preamble: preamble.into(),
            prompt: prompt.into(),
            temperature: 0.1,
        }
    }
}

#[async_trait]
pub trait LlmBackend: Send + Sync {
    fn name(&self) -> &str;

    fn is_available(&self) -> bool {
        true
    }

    async fn complete(&self, request: LlmRequest) -> Result<String, CapabilityError>;
}

#[derive(Debug, Clone)]
struct ModelSelection {
    search: String,
    analysis: String,
}

impl ModelSelection {
    fn for_purpose(&self, purpose: LlmPurpose) -> &str {
        match purpose {
            LlmPurpose::Search => &self.search,
            LlmPurpose::Analysis => &self.analysis,
        }
    }
}

pub struct OpenRouterBackend {
    client: openrouter::Client,
    models: ModelSelection,
}

impl OpenRouterBackend {
    pub fn new(api_key: &str, search_model: Option<&str>, analysis_model: Option<&str>) -> Self {
        Self {
            client: openrouter::Client::new(api_key),
            models: ModelSelection {
                search: search_model
                    .unwrap_or("openai/gpt-4o-mini-search-preview")
                    .to_string(),
                analysis: analysis_model.unwrap_or("openai/gpt-4o-mini").to_string(),
            },
        }
    }
}

#[async_trait]
impl LlmBackend for OpenRouterBackend {
    fn name(&self) -> &str {
        "openrouter"
    }

    async fn complete(&self, request: LlmRequest) -> Result<String, CapabilityError> {
        let model = self.models.for_purpose(request.purpose);
        debug!(backend = "openrouter", model, purpose = ?request.purpose, "Sending completion request");
        let agent = self
            .client
            .agent(model)
            .preamble(&request.preamble)
            .temperature(request.temperature)
            .build();
        agent
            .prompt(request.prompt.as_str())
            .await
            .map_err(|e| CapabilityError::Transport(e.to_string()))
    }
}

pub struct OpenAiBackend {
    client: openai::Client,
    models: ModelSelection,
}

impl OpenAiBackend {
    pub fn new(api_key: &str, search_model: Option<&str>, analysis_model: Option<&str>) -> Self {
        Self {
            client: openai::Client::new(api_key),
            models: ModelSelection {
                search: search_model.unwrap_or("gpt-4o-mini-search-preview").to_string(),
                analysis: analysis_model.unwrap_or("gpt-4o").to_string(),
            },
        }
    }
}

#[async_trait]
impl LlmBackend for OpenAiBackend {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, request: LlmRequest) -> Result<String, CapabilityError> {
        let model = self.models.for_purpose(request.purpose);
        debug!(backend = "openai", model, purpose = ?request.purpose, "Sending completion request");
        let agent = self
            .client
            .agent(model)
            .preamble(&request.preamble)
            .temperature(request.temperature)
            .build();
        agent
            .prompt(request.prompt.as_str())
            .await
            .map_err(|e| CapabilityError::Transport(e.to_string()))
    }
}

/// Stand-in used when no API key is configured. Every call reports `Unavailable`,
/// which pushes each stage onto its fallback path.
#[derive(Debug, Default)]
pub struct OfflineBackend;

#[async_trait]
impl LlmBackend for OfflineBackend {
    fn name(&self) -> &str {
        "offline"
    }

    fn is_available(&self) -> bool {
        false
    }

    async fn complete(&self, _request: LlmRequest) -> Result<String, CapabilityError> {
        Err(CapabilityError::Unavailable(
            "no LLM API key configured".to_string(),
        ))
    }
}

pub fn backend_from_config(config: &LlmConfig) -> Arc<dyn LlmBackend> {
    let Some(api_key) = config.api_key() else {
        warn!(
            provider = ?config.provider,
            "No API key configured for LLM provider, running in degraded offline mode"
        );
        return Arc::new(OfflineBackend);
    };
    let search_model = config.search_model.as_deref();
    let analysis_model = config.analysis_model.as_deref();
    match config.provider {
        LlmProvider::OpenRouter => Arc::new(OpenRouterBackend::new(api_key, search_model, analysis_model)),
        LlmProvider::OpenAi => Arc::new(OpenAiBackend::new(api_key, search_model, analysis_model)),
    }
}
