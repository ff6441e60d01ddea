use std::sync::Arc;

use async_trait::async_trait;
use graph_flow::{Context, NextAction, Result, Task, TaskResult};
use tracing::info;

use super::{progress, require, session_keys};
use crate::models::{Case, PolicyDocument};
use crate::pipeline::Pipeline;
use crate::pipeline::search::SearchBatch;

pub struct AnalyzeCoverageTask {
    pipeline: Arc<Pipeline>,
}

impl AnalyzeCoverageTask {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl Task for AnalyzeCoverageTask {
    async fn run(&self, context: Context) -> Result<TaskResult> {
        let case: Case = require(&context, session_keys::CASE).await?;
        let documents: Vec<PolicyDocument> = context
            .get(session_keys::DOCUMENTS)
            .await
            .unwrap_or_default();
        let batch: SearchBatch = require(&context, session_keys::SEARCH_BATCH).await?;

        let mut analysis = self.pipeline.coverage.analyze(&case, &documents).await;
        analysis.sources = batch.results;
        info!(
            case_id = %case.id,
            task_id = %self.id(),
            status = %analysis.coverage_status,
            requirements = analysis.requirements.len(),
            confidence = analysis.confidence_score,
            "Coverage analyzed"
        );

        let status = format!("Coverage: {}", analysis.coverage_status);
        context.set(session_keys::ANALYSIS, analysis).await?;

        Ok(TaskResult::new_with_status(None, NextAction::Continue, Some(status))
            .with_progress(progress::ANALYZED))
    }
}
