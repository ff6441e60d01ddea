use std::sync::Arc;

use async_trait::async_trait;
use graph_flow::{Context, NextAction, Result, Task, TaskResult};
use tracing::info;

use super::{effective_patient_context, progress, require, session_keys};
use crate::models::{Case, CoverageAnalysis};
use crate::pipeline::Pipeline;

pub struct MatchCriteriaTask {
    pipeline: Arc<Pipeline>,
}

impl MatchCriteriaTask {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl Task for MatchCriteriaTask {
    async fn run(&self, context: Context) -> Result<TaskResult> {
        let case: Case = require(&context, session_keys::CASE).await?;
        let mut analysis: CoverageAnalysis = require(&context, session_keys::ANALYSIS).await?;
        let patient = effective_patient_context(&context, &case).await;

        let criteria = self
            .pipeline
            .criteria
            .evaluate(&analysis.requirements, &patient)
            .await;
        let unmet = criteria.iter().filter(|(_, met)| !met).count();
        info!(case_id = %case.id, task_id = %self.id(), unmet, total = criteria.len(), "Patient criteria matched");

        analysis.criteria_match = criteria.clone();
        context.set(session_keys::CRITERIA_MATCH, criteria).await?;
        context.set(session_keys::ANALYSIS, analysis).await?;

        Ok(TaskResult::new_with_status(
            None,
            NextAction::Continue,
            Some(format!("{unmet} requirement(s) not yet met")),
        )
        .with_progress(progress::MATCHED))
    }
}
