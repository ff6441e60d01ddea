use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use graph_flow::{InMemorySessionStorage, SessionStorage};
use prior_auth_service::agent::LlmPolicyAgent;
use prior_auth_service::cache::PolicyCache;
use prior_auth_service::llm::OfflineBackend;
use prior_auth_service::store::{CaseStore, InMemoryCaseStore};
use prior_auth_service::{AppState, Capabilities, Orchestrator, Pipeline, PipelineConfig, build_router};
use serde_json::{Value, json};
use tower::ServiceExt;

fn offline_app() -> Router {
    let agent = Arc::new(LlmPolicyAgent::new(Arc::new(OfflineBackend)));
    let pipeline = Arc::new(Pipeline::new(
        &PipelineConfig::default(),
        Capabilities::uniform(agent),
        Arc::new(PolicyCache::new()),
    ));
    let sessions: Arc<dyn SessionStorage> = Arc::new(InMemorySessionStorage::new());
    let store: Arc<dyn CaseStore> = Arc::new(InMemoryCaseStore::new());
    build_router(AppState {
        orchestrator: Arc::new(Orchestrator::new(pipeline, sessions.clone(), store)),
        sessions,
    })
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(body) => {
            request = request.header("content-type", "application/json");
            Body::from(body.to_string())
        }
        None => Body::empty(),
    };
    let response = app.clone().oneshot(request.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn wait_for_state(app: &Router, case_id: &str, state: &str) -> Value {
    for _ in 0..100 {
        let (status, body) = call(app, "GET", &format!("/cases/{case_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        if body["state"] == state {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("case {case_id} never reached {state}");
}

#[tokio::test]
async fn test_health_check() {
    let app = offline_app();
    let (status, body) = call(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_submitted_case_runs_to_completion() {
    let app = offline_app();
    let (status, body) = call(
        &app,
        "POST",
        "/cases",
        Some(json!({
            "procedure_code": "81162",
            "payer": "Medicare",
            "service_category": "genetic testing",
            "patient_context": {
                "has_genetic_counseling": true,
                "has_family_history": "yes"
            }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let case_id = body["case_id"].as_str().unwrap().to_string();

    let done = wait_for_state(&app, &case_id, "completed").await;
    assert_eq!(done["progress"], 100);
    assert_eq!(done["degraded"], true);
    assert_eq!(done["submission"]["procedure_code"], "81162");
}

#[tokio::test]
async fn test_paused_case_resumes_over_http() {
    let app = offline_app();
    let (_, body) = call(
        &app,
        "POST",
        "/cases",
        Some(json!({ "procedure_code": "81162", "payer": "Medicare" })),
    )
    .await;
    let case_id = body["case_id"].as_str().unwrap().to_string();

    let paused = wait_for_state(&app, &case_id, "paused").await;
    assert_eq!(paused["progress"], 50);
    assert_eq!(paused["gate_decision"]["is_valid"], false);

    let (status, _) = call(
        &app,
        "POST",
        &format!("/cases/{case_id}/resume"),
        Some(json!({
            "facts": { "has_genetic_counseling": true, "has_family_history": true }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let done = wait_for_state(&app, &case_id, "completed").await;
    assert_eq!(done["progress"], 100);
}

#[tokio::test]
async fn test_error_responses() {
    let app = offline_app();

    let (status, _) = call(
        &app,
        "POST",
        "/cases",
        Some(json!({ "procedure_code": " ", "payer": "Medicare" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = call(&app, "GET", "/cases/unknown", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["case_id"], "unknown");

    let (status, _) = call(&app, "POST", "/cases/unknown/cancel", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, body) = call(
        &app,
        "POST",
        "/cases",
        Some(json!({
            "procedure_code": "81162",
            "payer": "Medicare",
            "patient_context": { "has_genetic_counseling": true, "has_family_history": true }
        })),
    )
    .await;
    let case_id = body["case_id"].as_str().unwrap().to_string();
    wait_for_state(&app, &case_id, "completed").await;

    let (status, _) = call(
        &app,
        "POST",
        &format!("/cases/{case_id}/resume"),
        Some(json!({ "facts": {} })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}
