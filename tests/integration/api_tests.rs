//! API module tests - Integration tests
//!
//! These tests drive the router with in-memory stores and fake collaborators.

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use kbflow::api::AppState;
use kbflow::catalog::{Catalog, Repository, RepositoryConfig, RepositoryKind};
use kbflow::storage::MemoryStore;
use kbflow::testing::FakeCollaborators;
use kbflow::{Engine, EngineConfig, SqliteStore, WorkflowSettings};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

fn create_test_engine() -> Arc<Engine<MemoryStore>> {
    let fakes = FakeCollaborators::new();
    Arc::new(
        Engine::new(MemoryStore::new(), fakes.collaborators(), EngineConfig::default())
            .with_settings(WorkflowSettings::without_delays()),
    )
}

fn create_test_router(engine: Arc<Engine<MemoryStore>>) -> Router {
    kbflow::api::router(Arc::new(AppState { engine }))
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_execution(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/executions")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let router = create_test_router(create_test_engine());

    let (status, body) = send(&router, get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "ok", "database": "healthy"}));
}

#[tokio::test]
async fn test_health_endpoint_sqlite() {
    let store = SqliteStore::in_memory().await.unwrap();
    let engine = Engine::new(
        store,
        FakeCollaborators::new().collaborators(),
        EngineConfig::default(),
    );
    let router = kbflow::api::router(Arc::new(AppState {
        engine: Arc::new(engine),
    }));

    let (status, body) = send(&router, get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["database"], "healthy");
}

#[tokio::test]
async fn test_start_execution_accepted() {
    let engine = create_test_engine();
    let router = create_test_router(engine.clone());

    let (status, body) = send(
        &router,
        post_execution(json!({
            "workflow": "create-store",
            "input": {"repositoryId": "docs", "type": "opensearch"}
        })),
    )
    .await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["created"], true);

    let id: Uuid = serde_json::from_value(body["executionId"].clone()).unwrap();
    let (status, body) = send(&router, get(&format!("/executions/{}", id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["workflow"], "create-store");
    assert_eq!(body["status"], "queued");
    assert_eq!(body["stateName"], "CreateCatalogEntry");
    assert!(body.get("settings").is_none());
}

#[tokio::test]
async fn test_start_execution_with_idempotency_key() {
    let router = create_test_router(create_test_engine());
    let request = json!({
        "workflow": "delete-pipeline",
        "input": {"repositoryId": "docs", "bucket": "source", "key": "a.pdf"},
        "idempotencyKey": "evt-42"
    });

    let (_, first) = send(&router, post_execution(request.clone())).await;
    let (status, second) = send(&router, post_execution(request)).await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(second["created"], false);
    assert_eq!(first["executionId"], second["executionId"]);
}

#[tokio::test]
async fn test_start_unknown_workflow() {
    let router = create_test_router(create_test_engine());

    let (status, body) = send(
        &router,
        post_execution(json!({"workflow": "rebuild-index", "input": {}})),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("rebuild-index"));
}

#[tokio::test]
async fn test_start_invalid_input() {
    let engine = create_test_engine();
    let router = create_test_router(engine.clone());

    let (status, _) = send(
        &router,
        post_execution(json!({"workflow": "delete-store", "input": {"repositoryId": " "}})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &router,
        post_execution(json!({"workflow": "ingest-pipeline", "input": {"trigger": "daily"}})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(&router, get("/executions")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn test_malformed_body_rejected() {
    let router = create_test_router(create_test_engine());

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/executions")
                .header("content-type", "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert!(response.status().is_client_error());
}

#[tokio::test]
async fn test_get_nonexistent_execution() {
    let router = create_test_router(create_test_engine());

    let (status, body) = send(&router, get(&format!("/executions/{}", Uuid::now_v7()))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());

    let (status, _) = send(
        &router,
        get(&format!("/executions/{}/history", Uuid::now_v7())),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_list_executions_filters_by_workflow() {
    let router = create_test_router(create_test_engine());

    send(
        &router,
        post_execution(json!({
            "workflow": "delete-store",
            "input": {"repositoryId": "docs"}
        })),
    )
    .await;
    send(
        &router,
        post_execution(json!({
            "workflow": "delete-pipeline",
            "input": {"repositoryId": "docs", "bucket": "b", "key": "k"}
        })),
    )
    .await;

    let (status, body) = send(&router, get("/executions?workflow=delete-store")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["workflow"], "delete-store");

    let (_, body) = send(&router, get("/executions?limit=1")).await;
    assert_eq!(body.as_array().unwrap().len(), 1);

    let (status, _) = send(&router, get("/executions?workflow=nope")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_history_after_completion() {
    let engine = create_test_engine();
    let router = create_test_router(engine.clone());

    let (_, body) = send(
        &router,
        post_execution(json!({
            "workflow": "delete-pipeline",
            "input": {"repositoryId": "docs", "bucket": "b", "key": "docs/k.pdf"}
        })),
    )
    .await;
    let id: Uuid = serde_json::from_value(body["executionId"].clone()).unwrap();
    engine.run_to_completion(id).await.unwrap();

    let (status, body) = send(&router, get(&format!("/executions/{}", id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "succeeded");
    assert_eq!(body["output"]["documentsRemoved"], 0);

    let (status, body) = send(&router, get(&format!("/executions/{}/history", id))).await;
    assert_eq!(status, StatusCode::OK);
    let history = body.as_array().unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0]["fromState"], "NormalizeEvent");
    assert_eq!(history[1]["task"], "DeleteDocuments");
}

#[tokio::test]
async fn test_get_repository() {
    let engine = create_test_engine();
    engine
        .store()
        .put_repository(&Repository::new(
            "docs",
            RepositoryKind::Pgvector,
            RepositoryConfig::default(),
        ))
        .await
        .unwrap();
    let router = create_test_router(engine);

    let (status, body) = send(&router, get("/repositories/docs")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["repositoryId"], "docs");
    assert_eq!(body["type"], "pgvector");
    assert_eq!(body["status"], "CREATE_IN_PROGRESS");

    let (status, _) = send(&router, get("/repositories/missing")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let router = create_test_router(create_test_engine());
    send(
        &router,
        post_execution(json!({
            "workflow": "delete-store",
            "input": {"repositoryId": "docs"}
        })),
    )
    .await;

    let response = router.clone().oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/plain"));

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("kbflow_executions_started_total 1"));
}
