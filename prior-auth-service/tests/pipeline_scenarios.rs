use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use graph_flow::{InMemorySessionStorage, SessionStorage};
use prior_auth_service::cache::PolicyCache;
use prior_auth_service::capabilities::{
    AnalysisCapability, CoverageDraft, CoverageRequest, CriteriaCapability, ExtractionCapability,
    SearchCapability,
};
use prior_auth_service::error::{CapabilityError, OrchestratorError};
use prior_auth_service::llm::OfflineBackend;
use prior_auth_service::agent::LlmPolicyAgent;
use prior_auth_service::models::{
    Case, CoverageAnalysis, CoverageStatus, CriteriaMatch, DocumentCategory, PatientContext,
    PolicyDocument, PriorAuthSubmission, Requirement, RequestValidation, SearchResult,
    WorkflowState, facts,
};
use prior_auth_service::pipeline::search::{SearchBatch, SearchExecutor, SearchSettings};
use prior_auth_service::pipeline::{Capabilities, Pipeline};
use prior_auth_service::store::{CaseEventKind, CaseStore, InMemoryCaseStore};
use prior_auth_service::tasks::session_keys;
use prior_auth_service::{Orchestrator, PipelineConfig};
use tokio::sync::Notify;

/// Search behaviour keyed by the order in which calls arrive.
#[derive(Default)]
enum SearchScript {
    #[default]
    AlwaysHits,
    /// First call fails, second outlives the timeout, the rest hit.
    FirstFailsSecondHangs,
    /// Every call announces itself and then sleeps.
    Slow(Duration),
}

/// Policy service fake: deterministic search and coverage, no external
/// criteria or validation, so the gate runs on local rules only.
#[derive(Default)]
struct ScriptedPolicyService {
    script: SearchScript,
    calls: AtomicUsize,
    entered: Notify,
}

impl ScriptedPolicyService {
    fn with_script(script: SearchScript) -> Self {
        Self {
            script,
            ..Self::default()
        }
    }

    fn hits() -> Vec<SearchResult> {
        vec![
            SearchResult::new(
                "NCD 90.2 Next Generation Sequencing 81162",
                "https://www.cms.gov/medicare-coverage-database/ncd/90.2",
                DocumentCategory::Ncd,
                95,
            )
            .with_source("CMS"),
            SearchResult::new(
                "LCD L38972 Genetic Testing for Oncology",
                "https://www.cms.gov/medicare-coverage-database/lcd/L38972",
                DocumentCategory::Lcd,
                85,
            )
            .with_source("CMS"),
        ]
    }
}

#[async_trait]
impl SearchCapability for ScriptedPolicyService {
    async fn search(&self, _query: &str) -> Result<Vec<SearchResult>, CapabilityError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.script {
            SearchScript::AlwaysHits => Ok(Self::hits()),
            SearchScript::FirstFailsSecondHangs => match call {
                0 => Err(CapabilityError::Transport("connection reset".to_string())),
                1 => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(Self::hits())
                }
                _ => Ok(Self::hits()),
            },
            SearchScript::Slow(delay) => {
                self.entered.notify_one();
                tokio::time::sleep(*delay).await;
                Ok(Self::hits())
            }
        }
    }
}

#[async_trait]
impl ExtractionCapability for ScriptedPolicyService {
    async fn analyze_document(&self, result: &SearchResult) -> Result<PolicyDocument, CapabilityError> {
        let mut document = PolicyDocument::fallback_for(result);
        document.applicable_codes = vec!["81162".to_string()];
        document.requirements = vec!["Genetic counseling prior to testing".to_string()];
        Ok(document)
    }
}

#[async_trait]
impl AnalysisCapability for ScriptedPolicyService {
    async fn analyze_coverage(
        &self,
        request: CoverageRequest<'_>,
    ) -> Result<CoverageDraft, CapabilityError> {
        let requirement = |requirement_type: &str, documentation: &str| Requirement {
            requirement_type: requirement_type.to_string(),
            description: format!("{requirement_type} for {}", request.procedure_code),
            evidence_basis: "NCD 90.2".to_string(),
            documentation_needed: vec![documentation.to_string()],
            clinical_criteria: Vec::new(),
            source_document: "NCD 90.2".to_string(),
            confidence_score: 0.9,
        };
        Ok(CoverageDraft {
            coverage_status: Some(CoverageStatus::PriorAuthorizationRequired),
            coverage_details: Some("Covered with prior authorization under NCD 90.2".to_string()),
            requirements: vec![
                requirement("Genetic counseling", "Genetic counselor consultation note"),
                requirement("Clinical indication", "Pathology report"),
            ],
            confidence_score: Some(0.92),
            recommendations: Vec::new(),
            ncd_applicable: Some(true),
            lcd_applicable: Some(false),
        })
    }

    async fn recommend(
        &self,
        _analysis: &CoverageAnalysis,
        _criteria: &CriteriaMatch,
        _patient_context: &PatientContext,
    ) -> Result<Vec<String>, CapabilityError> {
        Ok(vec!["Attach the pathology report".to_string()])
    }
}

#[async_trait]
impl CriteriaCapability for ScriptedPolicyService {
    fn is_available(&self) -> bool {
        false
    }

    async fn check(
        &self,
        _requirements: &[Requirement],
        _patient_context: &PatientContext,
    ) -> Result<CriteriaMatch, CapabilityError> {
        Err(CapabilityError::Unavailable("no criteria service".to_string()))
    }

    async fn validate_request(
        &self,
        _analysis: &CoverageAnalysis,
        _documents: &[PolicyDocument],
        _patient_context: &PatientContext,
    ) -> Result<RequestValidation, CapabilityError> {
        Err(CapabilityError::Unavailable("no validation service".to_string()))
    }
}

struct Harness {
    orchestrator: Arc<Orchestrator>,
    sessions: Arc<dyn SessionStorage>,
    store: Arc<dyn CaseStore>,
}

fn harness_with(capabilities: Capabilities, search_timeout: Duration) -> Harness {
    let config = PipelineConfig::default();
    let cache = Arc::new(PolicyCache::new());
    let mut pipeline = Pipeline::new(&config, capabilities.clone(), cache.clone());
    pipeline.search = SearchExecutor::new(
        capabilities.search,
        cache,
        SearchSettings {
            query_budget: config.search.query_budget,
            top_n: config.search.top_n,
            per_call_timeout: search_timeout,
        },
    );

    let sessions: Arc<dyn SessionStorage> = Arc::new(InMemorySessionStorage::new());
    let store: Arc<dyn CaseStore> = Arc::new(InMemoryCaseStore::new());
    Harness {
        orchestrator: Arc::new(Orchestrator::new(
            Arc::new(pipeline),
            sessions.clone(),
            store.clone(),
        )),
        sessions,
        store,
    }
}

fn harness(script: SearchScript) -> (Harness, Arc<ScriptedPolicyService>) {
    let service = Arc::new(ScriptedPolicyService::with_script(script));
    let harness = harness_with(Capabilities::uniform(service.clone()), Duration::from_secs(5));
    (harness, service)
}

fn medicare_case(context: PatientContext) -> Case {
    Case::new("81162", "Medicare", "genetic testing").with_patient_context(context)
}

fn counseled_patient() -> PatientContext {
    PatientContext::new()
        .with_flag(facts::HAS_GENETIC_COUNSELING, true)
        .with_flag(facts::HAS_FAMILY_HISTORY, true)
        .with_flag(facts::HAS_CLINICAL_INDICATION, true)
}

fn event_kinds(store: &Arc<dyn CaseStore>, case_id: &str) -> Vec<CaseEventKind> {
    store
        .record(case_id)
        .unwrap()
        .events
        .into_iter()
        .map(|event| event.kind)
        .collect()
}

async fn submission(sessions: &Arc<dyn SessionStorage>, case_id: &str) -> Option<PriorAuthSubmission> {
    let session = sessions.get(case_id).await.unwrap().unwrap();
    session.context.get(session_keys::SUBMISSION).await
}

#[tokio::test]
async fn test_case_with_all_criteria_met_completes() {
    let (h, _) = harness(SearchScript::AlwaysHits);
    let case = medicare_case(counseled_patient());
    let case_id = case.id.clone();

    let status = h.orchestrator.start(case).await.unwrap();

    assert_eq!(status.state, WorkflowState::Completed);
    assert_eq!(status.progress, 100);
    assert!(!status.degraded);

    let submission = submission(&h.sessions, &case_id).await.unwrap();
    assert_eq!(submission.procedure_code, "81162");
    assert_eq!(submission.coverage_status, CoverageStatus::PriorAuthorizationRequired);
    assert!(!submission.recommendations.is_empty());

    let session = h.sessions.get(&case_id).await.unwrap().unwrap();
    let analysis: CoverageAnalysis = session.context.get(session_keys::ANALYSIS).await.unwrap();
    assert!(analysis.ncd_applicable);
    assert!(!analysis.sources.is_empty());
}

#[tokio::test]
async fn test_missing_counseling_pauses_at_validation() {
    let (h, _) = harness(SearchScript::AlwaysHits);
    let case = medicare_case(
        PatientContext::new()
            .with_flag(facts::HAS_GENETIC_COUNSELING, false)
            .with_flag(facts::HAS_FAMILY_HISTORY, true)
            .with_flag(facts::HAS_CLINICAL_INDICATION, true),
    );
    let case_id = case.id.clone();

    let status = h.orchestrator.start(case).await.unwrap();

    assert_eq!(status.progress, 50);
    match &status.state {
        WorkflowState::Paused {
            clinician_message,
            missing_documents,
        } => {
            assert_eq!(missing_documents.len(), 1);
            assert!(missing_documents[0].starts_with("Genetic counseling documentation"));
            assert!(clinician_message.contains("81162"));
        }
        other => panic!("expected a paused case, got {other:?}"),
    }
    assert!(submission(&h.sessions, &case_id).await.is_none());
}

#[tokio::test]
async fn test_resume_with_counseling_completes() {
    let (h, _) = harness(SearchScript::AlwaysHits);
    let case = medicare_case(PatientContext::new().with_flag(facts::HAS_FAMILY_HISTORY, true));
    let case_id = case.id.clone();

    let paused = h.orchestrator.start(case).await.unwrap();
    assert!(matches!(paused.state, WorkflowState::Paused { .. }));

    let facts = PatientContext::new().with_flag(facts::HAS_GENETIC_COUNSELING, true);
    let status = h.orchestrator.resume(&case_id, facts).await.unwrap();

    assert_eq!(status.state, WorkflowState::Completed);
    assert_eq!(status.progress, 100);

    let kinds = event_kinds(&h.store, &case_id);
    let supplied = kinds
        .iter()
        .position(|k| matches!(k, CaseEventKind::MissingInfoSupplied { .. }))
        .unwrap();
    let paused_at = kinds
        .iter()
        .position(|k| matches!(k, CaseEventKind::Paused { .. }))
        .unwrap();
    let completed = kinds
        .iter()
        .position(|k| *k == CaseEventKind::Completed)
        .unwrap();
    assert!(paused_at < supplied && supplied < completed);
}

#[tokio::test]
async fn test_driving_a_paused_case_without_new_facts_stays_paused() {
    let (h, _) = harness(SearchScript::AlwaysHits);
    let case = medicare_case(PatientContext::new());
    let case_id = case.id.clone();

    h.orchestrator.start(case).await.unwrap();
    let status = h.orchestrator.drive(&case_id).await.unwrap();

    assert!(matches!(status.state, WorkflowState::Paused { .. }));
    assert_eq!(status.progress, 50);
    let kinds = event_kinds(&h.store, &case_id);
    assert!(!kinds.iter().any(|k| *k == CaseEventKind::Completed));
    assert_eq!(kinds.iter().filter(|k| **k == CaseEventKind::Started).count(), 1);
}

#[tokio::test]
async fn test_supplying_info_while_driving_is_rejected() {
    let (h, service) = harness(SearchScript::Slow(Duration::from_millis(200)));
    let case = medicare_case(counseled_patient());
    let case_id = case.id.clone();
    h.orchestrator.submit(case).await.unwrap();

    let orchestrator = h.orchestrator.clone();
    let id = case_id.clone();
    let driver = tokio::spawn(async move { orchestrator.drive(&id).await });
    service.entered.notified().await;

    let facts = PatientContext::new().with_flag(facts::HAS_FAMILY_HISTORY, true);
    let err = h
        .orchestrator
        .provide_missing_info(&case_id, facts)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::AlreadyRunning(_)));

    driver.await.unwrap().unwrap();
    assert!(
        !event_kinds(&h.store, &case_id)
            .iter()
            .any(|k| matches!(k, CaseEventKind::MissingInfoSupplied { .. }))
    );
    let session = h.sessions.get(&case_id).await.unwrap().unwrap();
    let supplied: Option<PatientContext> = session.context.get(session_keys::SUPPLIED_FACTS).await;
    assert!(supplied.is_none());
}

#[tokio::test]
async fn test_failed_and_hung_searches_do_not_fail_the_case() {
    let service = Arc::new(ScriptedPolicyService::with_script(
        SearchScript::FirstFailsSecondHangs,
    ));
    let h = harness_with(Capabilities::uniform(service), Duration::from_millis(100));
    let case = medicare_case(counseled_patient());
    let case_id = case.id.clone();

    let status = h.orchestrator.start(case).await.unwrap();
    assert_eq!(status.state, WorkflowState::Completed);

    let session = h.sessions.get(&case_id).await.unwrap().unwrap();
    let batch: SearchBatch = session.context.get(session_keys::SEARCH_BATCH).await.unwrap();
    assert_eq!(batch.failed.len(), 2);
    assert_eq!(batch.results.len(), 2);
    assert!(batch.failed.iter().any(|f| f.reason.contains("timed out")));
}

#[tokio::test]
async fn test_offline_backend_runs_degraded_on_defaults() {
    let agent = Arc::new(LlmPolicyAgent::new(Arc::new(OfflineBackend)));
    let h = harness_with(Capabilities::uniform(agent), Duration::from_secs(1));
    let case = medicare_case(counseled_patient());
    let case_id = case.id.clone();

    let status = h.orchestrator.start(case).await.unwrap();

    assert_eq!(status.state, WorkflowState::Completed);
    assert!(status.degraded);

    let session = h.sessions.get(&case_id).await.unwrap().unwrap();
    let analysis: CoverageAnalysis = session.context.get(session_keys::ANALYSIS).await.unwrap();
    assert_eq!(analysis.requirements.len(), 4);
    assert_eq!(analysis.confidence_score, 0.8);
    let degraded: bool = session.context.get(session_keys::DEGRADED).await.unwrap();
    assert!(degraded);
}

#[tokio::test]
async fn test_offline_backend_still_pauses_for_missing_counseling() {
    let agent = Arc::new(LlmPolicyAgent::new(Arc::new(OfflineBackend)));
    let h = harness_with(Capabilities::uniform(agent), Duration::from_secs(1));

    let status = h
        .orchestrator
        .start(medicare_case(PatientContext::new()))
        .await
        .unwrap();

    match status.state {
        WorkflowState::Paused {
            missing_documents, ..
        } => {
            assert!(missing_documents.iter().any(|d| d.starts_with("Genetic counseling")));
            assert!(missing_documents.iter().any(|d| d.starts_with("Family history")));
        }
        other => panic!("expected a paused case, got {other:?}"),
    }
}

#[tokio::test]
async fn test_cancel_during_search_ends_cancelled() {
    let (h, service) = harness(SearchScript::Slow(Duration::from_millis(300)));
    let case = medicare_case(counseled_patient());
    let case_id = case.id.clone();
    h.orchestrator.submit(case).await.unwrap();

    let orchestrator = h.orchestrator.clone();
    let id = case_id.clone();
    let driver = tokio::spawn(async move { orchestrator.drive(&id).await });

    service.entered.notified().await;
    let requested = h.orchestrator.cancel(&case_id).unwrap();
    assert_eq!(requested.state, WorkflowState::Running);

    let status = driver.await.unwrap().unwrap();
    assert_eq!(status.state, WorkflowState::Cancelled);
    assert!(status.progress < 100);
    assert!(submission(&h.sessions, &case_id).await.is_none());
}

#[tokio::test]
async fn test_cancel_idle_case_is_immediate() {
    let (h, _) = harness(SearchScript::AlwaysHits);
    let case = medicare_case(counseled_patient());
    let case_id = case.id.clone();
    h.orchestrator.submit(case).await.unwrap();

    let status = h.orchestrator.cancel(&case_id).unwrap();
    assert_eq!(status.state, WorkflowState::Cancelled);

    let driven = h.orchestrator.drive(&case_id).await.unwrap();
    assert_eq!(driven.state, WorkflowState::Cancelled);
    assert_eq!(driven.progress, 0);
}

#[tokio::test]
async fn test_second_driver_is_rejected() {
    let (h, service) = harness(SearchScript::Slow(Duration::from_millis(200)));
    let case = medicare_case(counseled_patient());
    let case_id = case.id.clone();
    h.orchestrator.submit(case).await.unwrap();

    let orchestrator = h.orchestrator.clone();
    let id = case_id.clone();
    let driver = tokio::spawn(async move { orchestrator.drive(&id).await });
    service.entered.notified().await;

    let second = h.orchestrator.drive(&case_id).await;
    assert!(matches!(second, Err(OrchestratorError::AlreadyRunning(_))));

    let status = driver.await.unwrap().unwrap();
    assert_eq!(status.state, WorkflowState::Completed);
}

#[tokio::test]
async fn test_supplying_info_requires_a_paused_case() {
    let (h, _) = harness(SearchScript::AlwaysHits);
    let case = medicare_case(counseled_patient());
    let case_id = case.id.clone();
    h.orchestrator.start(case).await.unwrap();

    let err = h
        .orchestrator
        .provide_missing_info(&case_id, PatientContext::new())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::NotPaused(_)));

    let err = h
        .orchestrator
        .provide_missing_info("unknown", PatientContext::new())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Store(_)));
}

#[tokio::test]
async fn test_progress_is_monotonic_across_stages() {
    let (h, _) = harness(SearchScript::AlwaysHits);
    let case = medicare_case(counseled_patient());
    let case_id = case.id.clone();
    h.orchestrator.start(case).await.unwrap();

    let progress: Vec<u8> = event_kinds(&h.store, &case_id)
        .into_iter()
        .filter_map(|kind| match kind {
            CaseEventKind::StageCompleted { progress, .. } => Some(progress),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![10, 30, 40, 45, 48, 49, 50]);
}

#[tokio::test]
async fn test_invalid_case_is_rejected_on_submit() {
    let (h, _) = harness(SearchScript::AlwaysHits);
    let err = h
        .orchestrator
        .submit(Case::new("", "Medicare", "genetic testing"))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidCase(_)));
}
