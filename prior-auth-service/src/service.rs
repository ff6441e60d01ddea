use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, State},
    http::{HeaderValue, Request, StatusCode},
    middleware::{Next, from_fn},
    response::Json,
    routing::{get, post},
};
use graph_flow::{InMemorySessionStorage, PostgresSessionStorage, SessionStorage};
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{Instrument, error, info, warn};
use uuid::Uuid;

use crate::agent::LlmPolicyAgent;
use crate::cache::PolicyCache;
use crate::config::PipelineConfig;
use crate::error::{OrchestratorError, StoreError};
use crate::llm::backend_from_config;
use crate::models::{CoverageAnalysis, NewCase, PatientContext, PriorAuthSubmission};
use crate::orchestrator::Orchestrator;
use crate::pipeline::gate::GateDecision;
use crate::pipeline::{Capabilities, Pipeline};
use crate::store::{CaseStore, InMemoryCaseStore};
use crate::tasks::session_keys;

type ApiError = (StatusCode, Json<Value>);
type ApiResult<T> = Result<(StatusCode, Json<T>), ApiError>;

fn api_error(status: StatusCode, message: &str, case_id: Option<&str>) -> ApiError {
    (status, Json(json!({ "error": message, "case_id": case_id })))
}

fn orchestrator_error(error: OrchestratorError) -> ApiError {
    let message = error.to_string();
    match &error {
        OrchestratorError::CaseNotFound(id) | OrchestratorError::Store(StoreError::CaseNotFound(id)) => {
            api_error(StatusCode::NOT_FOUND, &message, Some(id))
        }
        OrchestratorError::AlreadyRunning(id) | OrchestratorError::NotPaused(id) => {
            api_error(StatusCode::CONFLICT, &message, Some(id))
        }
        OrchestratorError::InvalidCase(_) => api_error(StatusCode::BAD_REQUEST, &message, None),
        _ => {
            error!(error = %message, "Request failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, &message, None)
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub sessions: Arc<dyn SessionStorage>,
}

#[derive(Debug, Deserialize)]
pub struct ResumeRequest {
    #[serde(default)]
    pub facts: PatientContext,
}

pub async fn create_app(config: &PipelineConfig) -> Router {
    build_router(create_app_state(config).await)
}

pub async fn create_app_state(config: &PipelineConfig) -> AppState {
    let sessions = create_session_storage(config).await;
    let agent = Arc::new(LlmPolicyAgent::new(backend_from_config(&config.llm)));
    info!(backend = agent.backend_name(), "Policy agent ready");

    let pipeline = Arc::new(Pipeline::new(
        config,
        Capabilities::uniform(agent),
        Arc::new(PolicyCache::new()),
    ));
    let store: Arc<dyn CaseStore> = Arc::new(InMemoryCaseStore::new());
    AppState {
        orchestrator: Arc::new(Orchestrator::new(pipeline, sessions.clone(), store)),
        sessions,
    }
}

async fn create_session_storage(config: &PipelineConfig) -> Arc<dyn SessionStorage> {
    match config.server.database_url.as_deref() {
        Some(database_url) => match PostgresSessionStorage::connect(database_url).await {
            Ok(storage) => {
                info!("Using PostgreSQL session storage");
                Arc::new(storage)
            }
            Err(e) => {
                error!(error = %e, "Failed to connect to PostgreSQL, falling back to in-memory storage");
                Arc::new(InMemorySessionStorage::new())
            }
        },
        None => {
            info!("Using in-memory session storage (set DATABASE_URL to use PostgreSQL)");
            Arc::new(InMemorySessionStorage::new())
        }
    }
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/cases", post(submit_case))
        .route("/cases/{case_id}", get(get_case))
        .route("/cases/{case_id}/resume", post(resume_case))
        .route("/cases/{case_id}/cancel", post(cancel_case))
        .layer(from_fn(correlation_id_middleware))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

async fn correlation_id_middleware(
    mut request: Request<axum::body::Body>,
    next: Next,
) -> axum::response::Response {
    let correlation_id = Uuid::new_v4().to_string();
    if let Ok(value) = HeaderValue::from_str(&correlation_id) {
        request.headers_mut().insert("x-correlation-id", value);
    }
    let span = tracing::info_span!("http_request", correlation_id = %correlation_id);
    next.run(request).instrument(span).await
}

async fn root() -> Json<Value> {
    Json(json!({
        "service": "Prior Authorization Service",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "POST /cases": "Submit a case and start the analysis workflow",
            "GET /cases/{case_id}": "Case status, progress and results",
            "POST /cases/{case_id}/resume": "Supply missing information for a paused case",
            "POST /cases/{case_id}/cancel": "Cancel a case",
            "GET /health": "Health check"
        }
    }))
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// Drives the case on a background task; callers poll `GET /cases/{id}`.
fn spawn_drive(state: &AppState, case_id: String) {
    let orchestrator = state.orchestrator.clone();
    tokio::spawn(
        async move {
            match orchestrator.drive(&case_id).await {
                Ok(status) => info!(case_id = %case_id, state = status.state.label(), "Drive finished"),
                Err(e) => warn!(case_id = %case_id, error = %e, "Drive did not run"),
            }
        }
        .in_current_span(),
    );
}

async fn submit_case(
    State(state): State<AppState>,
    Json(request): Json<NewCase>,
) -> ApiResult<Value> {
    let case = request.into_case();
    let case_id = case.id.clone();
    info!(case_id = %case_id, procedure_code = %case.procedure_code, payer = %case.payer, "Submitting case");

    let status = state.orchestrator.submit(case).await.map_err(orchestrator_error)?;
    spawn_drive(&state, case_id);
    Ok((StatusCode::ACCEPTED, Json(json!(status))))
}

async fn get_case(
    State(state): State<AppState>,
    Path(case_id): Path<String>,
) -> ApiResult<Value> {
    let status = state.orchestrator.status(&case_id).map_err(orchestrator_error)?;

    let mut body = json!(status);
    match state.sessions.get(&case_id).await {
        Ok(Some(session)) => {
            let analysis: Option<CoverageAnalysis> = session.context.get(session_keys::ANALYSIS).await;
            let gate: Option<GateDecision> = session.context.get(session_keys::GATE_DECISION).await;
            let submission: Option<PriorAuthSubmission> =
                session.context.get(session_keys::SUBMISSION).await;
            body["analysis"] = json!(analysis);
            body["gate_decision"] = json!(gate);
            body["submission"] = json!(submission);
        }
        Ok(None) => warn!(case_id = %case_id, "Case has no workflow session"),
        Err(e) => {
            error!(case_id = %case_id, error = %e, "Failed to load session");
            return Err(api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to load case session",
                Some(&case_id),
            ));
        }
    }
    Ok((StatusCode::OK, Json(body)))
}

async fn resume_case(
    State(state): State<AppState>,
    Path(case_id): Path<String>,
    Json(request): Json<ResumeRequest>,
) -> ApiResult<Value> {
    info!(case_id = %case_id, facts = request.facts.len(), "Resuming case with supplied information");
    state
        .orchestrator
        .provide_missing_info(&case_id, request.facts)
        .await
        .map_err(orchestrator_error)?;
    spawn_drive(&state, case_id.clone());

    let status = state.orchestrator.status(&case_id).map_err(orchestrator_error)?;
    Ok((StatusCode::ACCEPTED, Json(json!(status))))
}

async fn cancel_case(
    State(state): State<AppState>,
    Path(case_id): Path<String>,
) -> ApiResult<Value> {
    let status = state.orchestrator.cancel(&case_id).map_err(orchestrator_error)?;
    Ok((StatusCode::OK, Json(json!(status))))
}
