use async_trait::async_trait;
use chrono::Utc;
use graph_flow::{Context, NextAction, Result, Task, TaskResult};
use tracing::info;

use super::{progress, require, session_keys};
use crate::models::{Case, CoverageAnalysis, CriteriaMatch, PolicyDocument, PriorAuthSubmission};

/// Assembles the submission once the gate has passed.
pub struct FormCompletionTask;

#[async_trait]
impl Task for FormCompletionTask {
    async fn run(&self, context: Context) -> Result<TaskResult> {
        let case: Case = require(&context, session_keys::CASE).await?;
        let analysis: CoverageAnalysis = require(&context, session_keys::ANALYSIS).await?;
        let criteria: CriteriaMatch = require(&context, session_keys::CRITERIA_MATCH).await?;
        let documents: Vec<PolicyDocument> = context
            .get(session_keys::DOCUMENTS)
            .await
            .unwrap_or_default();

        let submission = PriorAuthSubmission {
            case_id: case.id.clone(),
            procedure_code: case.procedure_code.clone(),
            payer: case.payer.clone(),
            service_category: case.service_category.clone(),
            coverage_status: analysis.coverage_status,
            requirements_met: criteria
                .iter()
                .filter(|(_, met)| *met)
                .map(|(name, _)| name.to_string())
                .collect(),
            supporting_documents: documents.iter().map(|d| d.url.clone()).collect(),
            recommendations: analysis.recommendations.clone(),
            confidence_score: analysis.confidence_score,
            prepared_at: Utc::now(),
        };
        info!(case_id = %case.id, task_id = %self.id(), "Prior authorization submission prepared");
        context.set(session_keys::SUBMISSION, submission).await?;

        Ok(TaskResult::new_with_status(
            Some("Prior authorization request ready for submission".to_string()),
            NextAction::End,
            Some("Automation complete".to_string()),
        )
        .with_progress(progress::COMPLETED))
    }
}
