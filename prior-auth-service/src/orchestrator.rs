//! Drives cases through the workflow graph one stage at a time, persisting
//! progress after every stage and parking cases that need clinician input.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use graph_flow::{ExecutionStatus, FlowRunner, SessionStorage, StopSignal};
use tracing::{debug, error, info, warn};

use crate::error::OrchestratorError;
use crate::models::{Case, CaseStatus, PatientContext, WorkflowState};
use crate::pipeline::Pipeline;
use crate::pipeline::gate::GateDecision;
use crate::store::{CaseEventKind, CaseStore};
use crate::tasks::session_keys;
use crate::tasks::validation_gate::WAITING_STATUS;
use crate::workflow::{build_prior_auth_workflow, create_case_session};

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Releases the one-driver-per-case claim when dropped.
struct DriverClaim<'a> {
    active: &'a DashMap<String, ()>,
    case_id: String,
}

impl Drop for DriverClaim<'_> {
    fn drop(&mut self) {
        self.active.remove(&self.case_id);
    }
}

pub struct Orchestrator {
    runner: FlowRunner,
    sessions: Arc<dyn SessionStorage>,
    store: Arc<dyn CaseStore>,
    degraded: bool,
    signals: DashMap<String, StopSignal>,
    active: DashMap<String, ()>,
}

impl Orchestrator {
    pub fn new(
        pipeline: Arc<Pipeline>,
        sessions: Arc<dyn SessionStorage>,
        store: Arc<dyn CaseStore>,
    ) -> Self {
        let degraded = pipeline.is_degraded();
        let graph = Arc::new(build_prior_auth_workflow(pipeline));
        Self {
            runner: FlowRunner::new(graph, sessions.clone()),
            sessions,
            store,
            degraded,
            signals: DashMap::new(),
            active: DashMap::new(),
        }
    }

    /// Accepts a case and creates its workflow session without running it.
    pub async fn submit(&self, case: Case) -> Result<CaseStatus> {
        case.validate().map_err(OrchestratorError::InvalidCase)?;
        let session = create_case_session(&case).await?;
        let case_id = case.id.clone();

        let status = self.store.insert(case)?;
        self.sessions.save(session).await?;
        self.signals.insert(case_id.clone(), StopSignal::new());
        if self.degraded {
            warn!(case_id = %case_id, "No analysis backend configured, case will use fallback data");
            self.store.mark_degraded(&case_id)?;
        }
        info!(case_id = %case_id, "Case submitted");
        Ok(status)
    }

    /// Submit and drive until the case completes, pauses, fails or is cancelled.
    pub async fn start(&self, case: Case) -> Result<CaseStatus> {
        let case_id = case.id.clone();
        self.submit(case).await?;
        self.drive(&case_id).await
    }

    pub fn status(&self, case_id: &str) -> Result<CaseStatus> {
        Ok(self.store.status(case_id)?)
    }

    /// Requests cancellation. A running case stops before its next stage;
    /// an idle case is cancelled immediately.
    pub fn cancel(&self, case_id: &str) -> Result<CaseStatus> {
        let record = self.store.record(case_id)?;
        if record.state.is_terminal() {
            return Ok(record.status());
        }
        self.signals
            .entry(case_id.to_string())
            .or_default()
            .raise();
        info!(case_id, "Cancellation requested");

        if !self.active.contains_key(case_id) {
            self.finish_cancelled(case_id)?;
        }
        self.status(case_id)
    }

    /// Records facts supplied for a paused case. The case stays paused until driven.
    ///
    /// Holds the driver claim for the whole read-modify-save, so it fails with
    /// `AlreadyRunning` while the case is being driven.
    pub async fn provide_missing_info(&self, case_id: &str, facts: PatientContext) -> Result<()> {
        let _claim = self.claim(case_id)?;
        let record = self.store.record(case_id)?;
        if !matches!(record.state, WorkflowState::Paused { .. }) {
            return Err(OrchestratorError::NotPaused(case_id.to_string()));
        }

        let session = self
            .sessions
            .get(case_id)
            .await?
            .ok_or_else(|| OrchestratorError::CaseNotFound(case_id.to_string()))?;
        let previous: PatientContext = session
            .context
            .get(session_keys::SUPPLIED_FACTS)
            .await
            .unwrap_or_default();
        session
            .context
            .set(session_keys::SUPPLIED_FACTS, previous.overlay(&facts))
            .await?;
        session
            .context
            .set(session_keys::MISSING_INFO_SUPPLIED, true)
            .await?;
        self.sessions.save(session).await?;

        self.store
            .append_event(case_id, CaseEventKind::MissingInfoSupplied { facts })?;
        info!(case_id, "Missing information supplied");
        Ok(())
    }

    /// Supplies facts to a paused case and drives it again.
    pub async fn resume(&self, case_id: &str, facts: PatientContext) -> Result<CaseStatus> {
        self.provide_missing_info(case_id, facts).await?;
        self.drive(case_id).await
    }

    /// Runs stages until the workflow stops advancing. Stage failures end the
    /// case as failed rather than surfacing as errors.
    pub async fn drive(&self, case_id: &str) -> Result<CaseStatus> {
        let _claim = self.claim(case_id)?;
        let record = self.store.record(case_id)?;
        if record.state.is_terminal() {
            return Ok(record.status());
        }

        let signal = self
            .signals
            .entry(case_id.to_string())
            .or_default()
            .clone();
        if signal.is_raised() {
            return self.finish_cancelled(case_id);
        }
        if matches!(record.state, WorkflowState::Paused { .. })
            && !self.missing_info_pending(case_id).await?
        {
            debug!(case_id, "Paused case has no newly supplied information, leaving it paused");
            return Ok(record.status());
        }

        self.store
            .update_status(case_id, WorkflowState::Running, &record.message)?;
        self.store.append_event(case_id, CaseEventKind::Started)?;
        info!(case_id, "Driving case");

        loop {
            if signal.is_raised() {
                return self.finish_cancelled(case_id);
            }

            let runner = self.runner.clone();
            let session_id = case_id.to_string();
            let step_signal = signal.clone();
            let step = tokio::spawn(async move {
                runner.run_with_signal(&session_id, &step_signal).await
            })
            .await;

            let result = match step {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => return self.finish_failed(case_id, e.to_string()),
                Err(e) => return self.finish_failed(case_id, format!("stage panicked: {e}")),
            };

            let message = result.status_message.clone().unwrap_or_default();
            self.store
                .update_progress(case_id, result.progress, &message)?;

            if signal.is_raised() {
                return self.finish_cancelled(case_id);
            }

            match result.status {
                ExecutionStatus::Advanced { next_task_id } => {
                    self.store.append_event(
                        case_id,
                        CaseEventKind::StageCompleted {
                            stage: message,
                            progress: result.progress,
                        },
                    )?;
                    debug!(case_id, next_task_id = %next_task_id, "Stage completed");
                }
                ExecutionStatus::WaitingForInput => return self.finish_paused(case_id).await,
                ExecutionStatus::Completed => return self.finish_completed(case_id),
                ExecutionStatus::Cancelled => return self.finish_cancelled(case_id),
                ExecutionStatus::Error(reason) => return self.finish_failed(case_id, reason),
            }
        }
    }

    async fn missing_info_pending(&self, case_id: &str) -> Result<bool> {
        Ok(match self.sessions.get(case_id).await? {
            Some(session) => session
                .context
                .get(session_keys::MISSING_INFO_SUPPLIED)
                .await
                .unwrap_or(false),
            None => false,
        })
    }

    fn claim(&self, case_id: &str) -> Result<DriverClaim<'_>> {
        match self.active.entry(case_id.to_string()) {
            Entry::Occupied(_) => Err(OrchestratorError::AlreadyRunning(case_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(());
                Ok(DriverClaim {
                    active: &self.active,
                    case_id: case_id.to_string(),
                })
            }
        }
    }

    async fn finish_paused(&self, case_id: &str) -> Result<CaseStatus> {
        let decision: Option<GateDecision> = match self.sessions.get(case_id).await? {
            Some(session) => session.context.get(session_keys::GATE_DECISION).await,
            None => None,
        };
        let (clinician_message, missing_documents) = match decision {
            Some(decision) => (
                decision
                    .clinician_message
                    .unwrap_or_else(|| WAITING_STATUS.to_string()),
                decision.missing_documents,
            ),
            None => (WAITING_STATUS.to_string(), Vec::new()),
        };

        info!(case_id, missing = missing_documents.len(), "Case paused for clinician input");
        self.store.update_status(
            case_id,
            WorkflowState::Paused {
                clinician_message,
                missing_documents: missing_documents.clone(),
            },
            WAITING_STATUS,
        )?;
        self.store
            .append_event(case_id, CaseEventKind::Paused { missing_documents })?;
        self.status(case_id)
    }

    fn finish_completed(&self, case_id: &str) -> Result<CaseStatus> {
        info!(case_id, "Case completed");
        self.store
            .update_status(case_id, WorkflowState::Completed, "Automation complete")?;
        self.store.append_event(case_id, CaseEventKind::Completed)?;
        self.status(case_id)
    }

    fn finish_cancelled(&self, case_id: &str) -> Result<CaseStatus> {
        info!(case_id, "Case cancelled");
        self.store
            .update_status(case_id, WorkflowState::Cancelled, "Cancelled")?;
        self.store.append_event(case_id, CaseEventKind::Cancelled)?;
        self.status(case_id)
    }

    fn finish_failed(&self, case_id: &str, reason: String) -> Result<CaseStatus> {
        error!(case_id, reason = %reason, "Case failed");
        self.store.update_status(
            case_id,
            WorkflowState::Failed {
                reason: reason.clone(),
            },
            "Failed",
        )?;
        self.store
            .append_event(case_id, CaseEventKind::Failed { reason })?;
        self.status(case_id)
    }
}
