use std::sync::Arc;

use async_trait::async_trait;
use graph_flow::{Context, NextAction, Result, Task, TaskResult};
use tracing::info;

use super::{progress, require, session_keys};
use crate::pipeline::Pipeline;
use crate::pipeline::search::SearchBatch;

pub struct ExtractDocumentsTask {
    pipeline: Arc<Pipeline>,
}

impl ExtractDocumentsTask {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl Task for ExtractDocumentsTask {
    async fn run(&self, context: Context) -> Result<TaskResult> {
        let batch: SearchBatch = require(&context, session_keys::SEARCH_BATCH).await?;
        info!(task_id = %self.id(), results = batch.results.len(), "Extracting policy documents");

        let documents = self.pipeline.extractor.extract(&batch.results).await;
        let count = documents.len();
        context.set(session_keys::DOCUMENTS, documents).await?;

        Ok(TaskResult::new_with_status(
            None,
            NextAction::Continue,
            Some(format!("Read {count} policy documents")),
        )
        .with_progress(progress::EXTRACTED))
    }
}
