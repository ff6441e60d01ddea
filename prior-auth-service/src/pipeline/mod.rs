//! The analysis stages, each usable on its own, and the bundle the workflow drives.

pub mod coverage;
pub mod criteria;
pub mod defaults;
pub mod extractor;
pub mod gate;
pub mod planner;
pub mod recommend;
pub mod search;

use std::sync::Arc;

use crate::cache::PolicyCache;
use crate::capabilities::{
    AnalysisCapability, CriteriaCapability, ExtractionCapability, SearchCapability,
};
use crate::config::PipelineConfig;

use coverage::CoverageAnalyzer;
use criteria::CriteriaMatcher;
use extractor::DocumentExtractor;
use gate::ValidationGate;
use planner::QueryPlanner;
use recommend::RecommendationGenerator;
use search::{SearchExecutor, SearchSettings};

/// The external capabilities a pipeline is wired to.
#[derive(Clone)]
pub struct Capabilities {
    pub search: Arc<dyn SearchCapability>,
    pub extraction: Arc<dyn ExtractionCapability>,
    pub analysis: Arc<dyn AnalysisCapability>,
    pub criteria: Arc<dyn CriteriaCapability>,
}

impl Capabilities {
    /// All four roles served by one implementation.
    pub fn uniform<T>(provider: Arc<T>) -> Self
    where
        T: SearchCapability + ExtractionCapability + AnalysisCapability + CriteriaCapability + 'static,
    {
        Self {
            search: provider.clone(),
            extraction: provider.clone(),
            analysis: provider.clone(),
            criteria: provider,
        }
    }
}

pub struct Pipeline {
    pub planner: QueryPlanner,
    pub search: SearchExecutor,
    pub extractor: DocumentExtractor,
    pub coverage: CoverageAnalyzer,
    pub criteria: CriteriaMatcher,
    pub recommender: RecommendationGenerator,
    pub gate: ValidationGate,
}

impl Pipeline {
    pub fn new(config: &PipelineConfig, capabilities: Capabilities, cache: Arc<PolicyCache>) -> Self {
        Self {
            planner: QueryPlanner::new(),
            search: SearchExecutor::new(
                capabilities.search,
                cache.clone(),
                SearchSettings {
                    query_budget: config.search.query_budget,
                    top_n: config.search.top_n,
                    per_call_timeout: config.search.timeout(),
                },
            ),
            extractor: DocumentExtractor::new(
                capabilities.extraction,
                cache,
                config.extraction.top_k,
                config.extraction.timeout(),
            ),
            coverage: CoverageAnalyzer::new(capabilities.analysis.clone(), config.analysis.timeout()),
            criteria: CriteriaMatcher::new(
                capabilities.criteria.clone(),
                config.criteria.timeout(),
                config.criteria.unclassified,
            ),
            recommender: RecommendationGenerator::new(capabilities.analysis, config.analysis.timeout()),
            gate: ValidationGate::new(
                capabilities.criteria,
                config.criteria.validation_timeout(),
                config.criteria.pause_when_validation_unavailable,
            ),
        }
    }

    /// True when runs can only produce default or rule-based results.
    pub fn is_degraded(&self) -> bool {
        !self.search.is_available()
    }
}
