use std::sync::Arc;

use async_trait::async_trait;
use graph_flow::{Context, NextAction, Result, Task, TaskResult};
use tracing::info;

use super::{progress, require, session_keys};
use crate::models::Case;
use crate::pipeline::Pipeline;
use crate::pipeline::planner::SearchQuery;

pub struct PlanQueriesTask {
    pipeline: Arc<Pipeline>,
}

impl PlanQueriesTask {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl Task for PlanQueriesTask {
    async fn run(&self, context: Context) -> Result<TaskResult> {
        let case: Case = require(&context, session_keys::CASE).await?;
        info!(case_id = %case.id, task_id = %self.id(), "Planning policy searches");

        let queries: Vec<SearchQuery> = self.pipeline.planner.plan_queries(&case);
        let count = queries.len();
        context.set(session_keys::QUERIES, queries).await?;

        Ok(TaskResult::new_with_status(
            None,
            NextAction::Continue,
            Some(format!("Planned {count} policy searches")),
        )
        .with_progress(progress::PLANNED))
    }
}
