use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

use crate::error::StoreError;
use crate::models::{Case, CaseStatus, PatientContext, WorkflowState};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CaseEventKind {
    Submitted,
    Started,
    StageCompleted { stage: String, progress: u8 },
    Paused { missing_documents: Vec<String> },
    MissingInfoSupplied { facts: PatientContext },
    Completed,
    Failed { reason: String },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaseEvent {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: CaseEventKind,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaseRecord {
    pub case: Case,
    pub state: WorkflowState,
    pub progress: u8,
    pub message: String,
    pub degraded: bool,
    pub events: Vec<CaseEvent>,
    pub updated_at: DateTime<Utc>,
}

impl CaseRecord {
    pub fn status(&self) -> CaseStatus {
        CaseStatus {
            case_id: self.case.id.clone(),
            state: self.state.clone(),
            progress: self.progress,
            message: self.message.clone(),
            degraded: self.degraded,
            updated_at: self.updated_at,
        }
    }

    fn push(&mut self, kind: CaseEventKind) {
        self.updated_at = Utc::now();
        self.events.push(CaseEvent {
            at: self.updated_at,
            kind,
        });
    }
}

/// Sink for workflow status and progress. Writes are acknowledged synchronously.
pub trait CaseStore: Send + Sync {
    fn insert(&self, case: Case) -> Result<CaseStatus, StoreError>;

    fn record(&self, case_id: &str) -> Result<CaseRecord, StoreError>;

    fn update_status(&self, case_id: &str, state: WorkflowState, message: &str) -> Result<(), StoreError>;

    /// Progress only moves forward; lower values are ignored.
    fn update_progress(&self, case_id: &str, progress: u8, message: &str) -> Result<(), StoreError>;

    fn mark_degraded(&self, case_id: &str) -> Result<(), StoreError>;

    fn append_event(&self, case_id: &str, kind: CaseEventKind) -> Result<(), StoreError>;

    fn status(&self, case_id: &str) -> Result<CaseStatus, StoreError> {
        self.record(case_id).map(|record| record.status())
    }
}

/// Writes to one case serialize on its map shard.
#[derive(Debug, Default)]
pub struct InMemoryCaseStore {
    records: DashMap<String, CaseRecord>,
}

impl InMemoryCaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_record<F>(&self, case_id: &str, update: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut CaseRecord),
    {
        let mut record = self
            .records
            .get_mut(case_id)
            .ok_or_else(|| StoreError::CaseNotFound(case_id.to_string()))?;
        update(record.value_mut());
        Ok(())
    }
}

impl CaseStore for InMemoryCaseStore {
    fn insert(&self, case: Case) -> Result<CaseStatus, StoreError> {
        use dashmap::mapref::entry::Entry;

        match self.records.entry(case.id.clone()) {
            Entry::Occupied(_) => Err(StoreError::Duplicate(case.id)),
            Entry::Vacant(slot) => {
                let now = Utc::now();
                let record = CaseRecord {
                    case,
                    state: WorkflowState::Pending,
                    progress: 0,
                    message: "Queued".to_string(),
                    degraded: false,
                    events: vec![CaseEvent {
                        at: now,
                        kind: CaseEventKind::Submitted,
                    }],
                    updated_at: now,
                };
                let status = record.status();
                slot.insert(record);
                Ok(status)
            }
        }
    }

    fn record(&self, case_id: &str) -> Result<CaseRecord, StoreError> {
        self.records
            .get(case_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::CaseNotFound(case_id.to_string()))
    }

    fn update_status(&self, case_id: &str, state: WorkflowState, message: &str) -> Result<(), StoreError> {
        debug!(case_id, state = state.label(), "Updating case status");
        self.with_record(case_id, |record| {
            record.state = state;
            record.message = message.to_string();
            record.updated_at = Utc::now();
        })
    }

    fn update_progress(&self, case_id: &str, progress: u8, message: &str) -> Result<(), StoreError> {
        self.with_record(case_id, |record| {
            record.progress = record.progress.max(progress.min(100));
            if !message.is_empty() {
                record.message = message.to_string();
            }
            record.updated_at = Utc::now();
        })
    }

    fn mark_degraded(&self, case_id: &str) -> Result<(), StoreError> {
        self.with_record(case_id, |record| record.degraded = true)
    }

    fn append_event(&self, case_id: &str, kind: CaseEventKind) -> Result<(), StoreError> {
        self.with_record(case_id, |record| record.push(kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_never_regresses() {
        let store = InMemoryCaseStore::new();
        let case = Case::new("81162", "Medicare", "genetic testing");
        let id = case.id.clone();
        store.insert(case).unwrap();

        store.update_progress(&id, 40, "Extracting").unwrap();
        store.update_progress(&id, 30, "Late search update").unwrap();
        let status = store.status(&id).unwrap();
        assert_eq!(status.progress, 40);
        assert_eq!(status.state, WorkflowState::Pending);
    }

    #[test]
    fn test_duplicate_and_unknown_cases() {
        let store = InMemoryCaseStore::new();
        let case = Case::new("81162", "Medicare", "");
        store.insert(case.clone()).unwrap();
        assert!(matches!(store.insert(case), Err(StoreError::Duplicate(_))));
        assert!(matches!(store.status("missing"), Err(StoreError::CaseNotFound(_))));
    }

    #[test]
    fn test_events_are_appended_in_order() {
        let store = InMemoryCaseStore::new();
        let case = Case::new("81162", "Medicare", "");
        let id = case.id.clone();
        store.insert(case).unwrap();
        store.append_event(&id, CaseEventKind::Started).unwrap();
        store.append_event(&id, CaseEventKind::Completed).unwrap();

        let kinds: Vec<_> = store.record(&id).unwrap().events.into_iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![CaseEventKind::Submitted, CaseEventKind::Started, CaseEventKind::Completed]
        );
    }
}
