// Prior authorization workflow tasks, one per pipeline stage
pub mod analyze_coverage;
pub mod extract_documents;
pub mod form_completion;
pub mod generate_recommendations;
pub mod match_criteria;
pub mod plan_queries;
pub mod search_policies;
pub mod validation_gate;

// Shared modules
pub mod types;

pub use analyze_coverage::AnalyzeCoverageTask;
pub use extract_documents::ExtractDocumentsTask;
pub use form_completion::FormCompletionTask;
pub use generate_recommendations::GenerateRecommendationsTask;
pub use match_criteria::MatchCriteriaTask;
pub use plan_queries::PlanQueriesTask;
pub use search_policies::SearchPoliciesTask;
pub use validation_gate::ValidationGateTask;

pub use types::{progress, session_keys};

use graph_flow::{Context, GraphError, Result};
use serde::de::DeserializeOwned;

use crate::models::{Case, PatientContext};

pub(crate) async fn require<T: DeserializeOwned>(context: &Context, key: &str) -> Result<T> {
    context
        .get(key)
        .await
        .ok_or_else(|| GraphError::ContextError(format!("{key} not found")))
}

/// The case's own facts with anything the clinician supplied layered on top.
pub(crate) async fn effective_patient_context(context: &Context, case: &Case) -> PatientContext {
    let supplied: PatientContext = context
        .get(session_keys::SUPPLIED_FACTS)
        .await
        .unwrap_or_default();
    case.patient_context.overlay(&supplied)
}
