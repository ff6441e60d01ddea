use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::capabilities::AnalysisCapability;
use crate::models::{CoverageAnalysis, CriteriaMatch, PatientContext};
use crate::pipeline::defaults::DEFAULT_RECOMMENDATIONS;

pub const MAX_RECOMMENDATIONS: usize = 7;

pub struct RecommendationGenerator {
    capability: Arc<dyn AnalysisCapability>,
    timeout: Duration,
}

impl RecommendationGenerator {
    pub fn new(capability: Arc<dyn AnalysisCapability>, timeout: Duration) -> Self {
        Self {
            capability,
            timeout,
        }
    }

    /// Up to seven actionable items; never empty.
    pub async fn recommend(
        &self,
        analysis: &CoverageAnalysis,
        criteria: &CriteriaMatch,
        context: &PatientContext,
    ) -> Vec<String> {
        if self.capability.is_available() {
            let call = self.capability.recommend(analysis, criteria, context);
            match tokio::time::timeout(self.timeout, call).await {
                Ok(Ok(items)) => {
                    let cleaned = clean(items);
                    if !cleaned.is_empty() {
                        return cleaned;
                    }
                    debug!("Recommendation call returned nothing usable");
                }
                Ok(Err(e)) => warn!(error = %e, "Recommendation call failed"),
                Err(_) => warn!("Recommendation call timed out"),
            }
        }
        fallback_recommendations(analysis, criteria)
    }
}

/// Items for each unmet requirement, then the standing defaults.
pub fn fallback_recommendations(analysis: &CoverageAnalysis, criteria: &CriteriaMatch) -> Vec<String> {
    let targeted = analysis
        .requirements
        .iter()
        .filter(|r| !criteria.is_met(&r.requirement_type))
        .map(|r| {
            let needed = if r.documentation_needed.is_empty() {
                r.requirement_type.clone()
            } else {
                r.documentation_needed.join(", ")
            };
            format!("Obtain and attach {} before submitting", needed.to_lowercase())
        });
    let defaults = DEFAULT_RECOMMENDATIONS.iter().map(|d| d.to_string());
    clean(targeted.chain(defaults).collect())
}

fn clean(items: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty() && seen.insert(item.to_lowercase()))
        .take(MAX_RECOMMENDATIONS)
        .collect()
}
