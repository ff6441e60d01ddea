use std::sync::Arc;

use async_trait::async_trait;
use graph_flow::{Context, NextAction, Result, Task, TaskResult};
use tracing::info;

use super::{effective_patient_context, progress, require, session_keys};
use crate::models::{Case, CoverageAnalysis, CriteriaMatch, PolicyDocument};
use crate::pipeline::Pipeline;
use crate::pipeline::gate::GateDecision;

pub const WAITING_STATUS: &str = "Waiting for clinician input - requirements not met";

/// Checkpoint before submission. An invalid decision parks the workflow here
/// until new facts are supplied; re-entry without them keeps it parked.
pub struct ValidationGateTask {
    pipeline: Arc<Pipeline>,
}

impl ValidationGateTask {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }

    fn waiting(decision: &GateDecision) -> TaskResult {
        TaskResult::new_with_status(
            decision.clinician_message.clone(),
            NextAction::WaitForInput,
            Some(WAITING_STATUS.to_string()),
        )
        .with_progress(progress::VALIDATED)
    }
}

#[async_trait]
impl Task for ValidationGateTask {
    async fn run(&self, context: Context) -> Result<TaskResult> {
        let case: Case = require(&context, session_keys::CASE).await?;
        let supplied: bool = context
            .get(session_keys::MISSING_INFO_SUPPLIED)
            .await
            .unwrap_or(false);
        let previous: Option<GateDecision> = context.get(session_keys::GATE_DECISION).await;

        if let Some(previous) = previous.as_ref().filter(|d| !d.is_valid) {
            if !supplied {
                info!(case_id = %case.id, "No new information since last check, still waiting");
                return Ok(Self::waiting(previous));
            }
        }

        let mut analysis: CoverageAnalysis = require(&context, session_keys::ANALYSIS).await?;
        let documents: Vec<PolicyDocument> = context
            .get(session_keys::DOCUMENTS)
            .await
            .unwrap_or_default();
        let patient = effective_patient_context(&context, &case).await;

        let criteria: CriteriaMatch = if supplied {
            info!(case_id = %case.id, "Re-checking criteria with supplied information");
            let rechecked = self
                .pipeline
                .criteria
                .evaluate(&analysis.requirements, &patient)
                .await;
            analysis.criteria_match = rechecked.clone();
            context.set(session_keys::CRITERIA_MATCH, rechecked.clone()).await?;
            context.set(session_keys::ANALYSIS, analysis.clone()).await?;
            rechecked
        } else {
            require(&context, session_keys::CRITERIA_MATCH).await?
        };

        let decision = self
            .pipeline
            .gate
            .evaluate(&case, &analysis, &criteria, &documents, &patient)
            .await;
        context.set(session_keys::GATE_DECISION, decision.clone()).await?;
        context.set(session_keys::MISSING_INFO_SUPPLIED, false).await?;

        if decision.is_valid {
            info!(case_id = %case.id, task_id = %self.id(), "Request valid, continuing to form completion");
            Ok(TaskResult::new_with_status(
                None,
                NextAction::Continue,
                Some("Coverage analysis complete. Starting form completion...".to_string()),
            )
            .with_progress(progress::VALIDATED))
        } else {
            info!(
                case_id = %case.id,
                task_id = %self.id(),
                missing = decision.missing_documents.len(),
                "Request incomplete, waiting for clinician"
            );
            Ok(Self::waiting(&decision))
        }
    }
}
