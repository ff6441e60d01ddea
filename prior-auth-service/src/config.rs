use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ConfigError;
use crate::pipeline::criteria::UnclassifiedPolicy;

pub const CONFIG_PATH_ENV: &str = "PRIOR_AUTH_CONFIG";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    #[default]
    OpenRouter,
    OpenAi,
}

impl FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openrouter" => Ok(Self::OpenRouter),
            "openai" => Ok(Self::OpenAi),
            _ => Err(ConfigError::InvalidValue {
                key: "LLM_PROVIDER".to_string(),
                value: value.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    #[serde(skip_serializing)]
    pub openrouter_api_key: Option<String>,
    #[serde(skip_serializing)]
    pub openai_api_key: Option<String>,
    pub search_model: Option<String>,
    pub analysis_model: Option<String>,
}

impl LlmConfig {
    pub fn api_key(&self) -> Option<&str> {
        let key = match self.provider {
            LlmProvider::OpenRouter => self.openrouter_api_key.as_deref(),
            LlmProvider::OpenAi => self.openai_api_key.as_deref(),
        };
        key.filter(|k| !k.trim().is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub query_budget: usize,
    pub top_n: usize,
    pub timeout_secs: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            query_budget: 5,
            top_n: 10,
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    pub top_k: usize,
    pub timeout_secs: u64,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            top_k: 3,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub timeout_secs: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CriteriaConfig {
    pub timeout_secs: u64,
    pub validation_timeout_secs: u64,
    pub unclassified: UnclassifiedPolicy,
    pub pause_when_validation_unavailable: bool,
}

impl Default for CriteriaConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            validation_timeout_secs: 60,
            unclassified: UnclassifiedPolicy::AssumeMet,
            pause_when_validation_unavailable: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    #[serde(skip_serializing)]
    pub database_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            database_url: None,
        }
    }
}

/// Tunables for the whole pipeline: defaults, then the YAML file named by
/// `PRIOR_AUTH_CONFIG`, then individual environment variables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub llm: LlmConfig,
    pub search: SearchConfig,
    pub extraction: ExtractionConfig,
    pub analysis: AnalysisConfig,
    pub criteria: CriteriaConfig,
    pub server: ServerConfig,
}

impl PipelineConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        info!(
            provider = ?config.llm.provider,
            llm_configured = config.llm.api_key().is_some(),
            query_budget = config.search.query_budget,
            top_n = config.search.top_n,
            top_k = config.extraction.top_k,
            "Pipeline configuration loaded"
        );
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        debug!(path = %path.display(), "Reading pipeline configuration file");
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Budgets, result counts and timeouts must all be positive.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("QUERY_BUDGET", self.search.query_budget as u64),
            ("SEARCH_TOP_N", self.search.top_n as u64),
            ("SEARCH_TIMEOUT_SECS", self.search.timeout_secs),
            ("EXTRACTION_TOP_K", self.extraction.top_k as u64),
            ("EXTRACTION_TIMEOUT_SECS", self.extraction.timeout_secs),
            ("ANALYSIS_TIMEOUT_SECS", self.analysis.timeout_secs),
            ("CRITERIA_TIMEOUT_SECS", self.criteria.timeout_secs),
            ("VALIDATION_TIMEOUT_SECS", self.criteria.validation_timeout_secs),
        ];
        match positive.iter().find(|(_, value)| *value == 0) {
            Some((key, value)) => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                value: value.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Applies `KEY=value` overrides looked up through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("LLM_PROVIDER") {
            self.llm.provider = value.parse()?;
        }
        if let Some(value) = lookup("OPENROUTER_API_KEY") {
            self.llm.openrouter_api_key = Some(value);
        }
        if let Some(value) = lookup("OPENAI_API_KEY") {
            self.llm.openai_api_key = Some(value);
        }
        if let Some(value) = lookup("SEARCH_MODEL") {
            self.llm.search_model = Some(value);
        }
        if let Some(value) = lookup("ANALYSIS_MODEL") {
            self.llm.analysis_model = Some(value);
        }

        override_parsed(&lookup, "QUERY_BUDGET", &mut self.search.query_budget)?;
        override_parsed(&lookup, "SEARCH_TOP_N", &mut self.search.top_n)?;
        override_parsed(&lookup, "SEARCH_TIMEOUT_SECS", &mut self.search.timeout_secs)?;
        override_parsed(&lookup, "EXTRACTION_TOP_K", &mut self.extraction.top_k)?;
        override_parsed(&lookup, "EXTRACTION_TIMEOUT_SECS", &mut self.extraction.timeout_secs)?;
        override_parsed(&lookup, "ANALYSIS_TIMEOUT_SECS", &mut self.analysis.timeout_secs)?;
        override_parsed(&lookup, "CRITERIA_TIMEOUT_SECS", &mut self.criteria.timeout_secs)?;
        override_parsed(
            &lookup,
            "VALIDATION_TIMEOUT_SECS",
            &mut self.criteria.validation_timeout_secs,
        )?;
        override_parsed(
            &lookup,
            "PAUSE_WHEN_VALIDATION_UNAVAILABLE",
            &mut self.criteria.pause_when_validation_unavailable,
        )?;
        if let Some(value) = lookup("UNCLASSIFIED_REQUIREMENTS") {
            self.criteria.unclassified = match value.trim() {
                "assume_met" => UnclassifiedPolicy::AssumeMet,
                "assume_unmet" => UnclassifiedPolicy::AssumeUnmet,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "UNCLASSIFIED_REQUIREMENTS".to_string(),
                        value,
                    });
                }
            };
        }
        override_parsed(&lookup, "PORT", &mut self.server.port)?;
        if let Some(value) = lookup("DATABASE_URL") {
            self.server.database_url = Some(value);
        }
        self.validate()
    }
}

fn override_parsed<F, T>(lookup: &F, key: &str, slot: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(value) = lookup(key) {
        *slot = value.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value,
        })?;
    }
    Ok(())
}

impl SearchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl ExtractionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl AnalysisConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl CriteriaConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn validation_timeout(&self) -> Duration {
        Duration::from_secs(self.validation_timeout_secs)
    }
}
