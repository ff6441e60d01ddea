use std::sync::Arc;

use graph_flow::{Graph, GraphBuilder, Result, Session, Task};

use crate::models::Case;
use crate::pipeline::Pipeline;
use crate::pipeline::search::SearchBatch;
use crate::tasks::*;

pub const WORKFLOW_ID: &str = "prior_authorization";

/// plan -> search -> [extract] -> coverage -> criteria -> recommend -> gate -> form.
/// Extraction is skipped when the search produced nothing.
pub fn build_prior_auth_workflow(pipeline: Arc<Pipeline>) -> Graph {
    let plan_task = Arc::new(PlanQueriesTask::new(pipeline.clone()));
    let plan_id = plan_task.id().to_string();

    let search_task = Arc::new(SearchPoliciesTask::new(pipeline.clone()));
    let search_id = search_task.id().to_string();

    let extract_task = Arc::new(ExtractDocumentsTask::new(pipeline.clone()));
    let extract_id = extract_task.id().to_string();

    let coverage_task = Arc::new(AnalyzeCoverageTask::new(pipeline.clone()));
    let coverage_id = coverage_task.id().to_string();

    let criteria_task = Arc::new(MatchCriteriaTask::new(pipeline.clone()));
    let criteria_id = criteria_task.id().to_string();

    let recommend_task = Arc::new(GenerateRecommendationsTask::new(pipeline.clone()));
    let recommend_id = recommend_task.id().to_string();

    let gate_task = Arc::new(ValidationGateTask::new(pipeline));
    let gate_id = gate_task.id().to_string();

    let form_task = Arc::new(FormCompletionTask);
    let form_id = form_task.id().to_string();

    GraphBuilder::new(WORKFLOW_ID)
        .add_task(plan_task)
        .add_task(search_task)
        .add_task(extract_task)
        .add_task(coverage_task)
        .add_task(criteria_task)
        .add_task(recommend_task)
        .add_task(gate_task)
        .add_task(form_task)
        .add_edge(&plan_id, &search_id)
        .add_conditional_edge(
            &search_id,
            |context| {
                context
                    .get_sync::<SearchBatch>(session_keys::SEARCH_BATCH)
                    .map(|batch| !batch.results.is_empty())
                    .unwrap_or(false)
            },
            &extract_id,
            &coverage_id,
        )
        .add_edge(&extract_id, &coverage_id)
        .add_edge(&coverage_id, &criteria_id)
        .add_edge(&criteria_id, &recommend_id)
        .add_edge(&recommend_id, &gate_id)
        .add_edge(&gate_id, &form_id)
        .set_start_task(&plan_id)
        .build()
}

/// Fresh session for a case, keyed by the case id and positioned at the first stage.
pub async fn create_case_session(case: &Case) -> Result<Session> {
    let mut session = Session::new_from_task(case.id.clone(), std::any::type_name::<PlanQueriesTask>());
    session.graph_id = WORKFLOW_ID.to_string();
    session.context.set(session_keys::CASE, case).await?;
    Ok(session)
}
