use std::sync::Arc;

use async_trait::async_trait;
use graph_flow::{Context, NextAction, Result, Task, TaskResult};
use tracing::{info, warn};

use super::{progress, require, session_keys};
use crate::models::Case;
use crate::pipeline::Pipeline;
use crate::pipeline::planner::SearchQuery;

pub struct SearchPoliciesTask {
    pipeline: Arc<Pipeline>,
}

impl SearchPoliciesTask {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl Task for SearchPoliciesTask {
    async fn run(&self, context: Context) -> Result<TaskResult> {
        let case: Case = require(&context, session_keys::CASE).await?;
        let queries: Vec<SearchQuery> = require(&context, session_keys::QUERIES).await?;
        info!(case_id = %case.id, task_id = %self.id(), queries = queries.len(), "Searching policy sources");

        let batch = self.pipeline.search.execute_for_case(&case, &queries).await;
        if batch.degraded {
            warn!(case_id = %case.id, "Policy search skipped, continuing with defaults");
            context.set(session_keys::DEGRADED, true).await?;
        }

        let status = if batch.from_cache {
            format!("Reused {} cached policy sources", batch.results.len())
        } else {
            format!(
                "Found {} policy sources ({} of {} searches failed)",
                batch.results.len(),
                batch.failed.len(),
                batch.dispatched
            )
        };
        context.set(session_keys::SEARCH_BATCH, batch).await?;

        Ok(TaskResult::new_with_status(None, NextAction::Continue, Some(status))
            .with_progress(progress::SEARCHED))
    }
}
