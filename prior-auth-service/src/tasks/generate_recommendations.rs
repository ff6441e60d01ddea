use std::sync::Arc;

use async_trait::async_trait;
use graph_flow::{Context, NextAction, Result, Task, TaskResult};
use tracing::info;

use super::{effective_patient_context, progress, require, session_keys};
use crate::models::{Case, CoverageAnalysis, CriteriaMatch};
use crate::pipeline::Pipeline;

pub struct GenerateRecommendationsTask {
    pipeline: Arc<Pipeline>,
}

impl GenerateRecommendationsTask {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl Task for GenerateRecommendationsTask {
    async fn run(&self, context: Context) -> Result<TaskResult> {
        let case: Case = require(&context, session_keys::CASE).await?;
        let mut analysis: CoverageAnalysis = require(&context, session_keys::ANALYSIS).await?;
        let criteria: CriteriaMatch = require(&context, session_keys::CRITERIA_MATCH).await?;
        let patient = effective_patient_context(&context, &case).await;

        analysis.recommendations = self
            .pipeline
            .recommender
            .recommend(&analysis, &criteria, &patient)
            .await;
        info!(case_id = %case.id, task_id = %self.id(), count = analysis.recommendations.len(), "Recommendations ready");
        context.set(session_keys::ANALYSIS, analysis).await?;

        Ok(TaskResult::new_with_status(
            None,
            NextAction::Continue,
            Some("Recommendations prepared".to_string()),
        )
        .with_progress(progress::RECOMMENDED))
    }
}
