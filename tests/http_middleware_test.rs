//! Integration tests for the axum scope middleware.

mod common;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode},
    response::IntoResponse,
    routing::get,
};
use common::{MockBackend, Recorder, wait_until};
use db_request_scope::config::PoolOptions;
use db_request_scope::db::SqliteBackend;
use db_request_scope::error::ScopeError;
use db_request_scope::scope::{DatabaseConfig, ResourceCache};
use db_request_scope::transport::http::{ensure_schema, router};
use db_request_scope::transport::{RequestScope, ScopeState, scope_layer};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tower::ServiceExt;

async fn notes_app(mode: &str) -> (NamedTempFile, Router) {
    let temp_file = NamedTempFile::new().unwrap();
    let url = format!("sqlite:{}", temp_file.path().display());
    let backend = SqliteBackend::new(&url, true, PoolOptions::default()).unwrap();
    let config = DatabaseConfig::builder(backend)
        .commit_mode_name(mode)
        .build()
        .unwrap();

    let app = ResourceCache::new();
    config.lifespan().start(&app).await.unwrap();
    ensure_schema(&config, &app).await.unwrap();

    let router = router(ScopeState::new(Arc::new(config), app));
    (temp_file, router)
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn post_note(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/notes")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

// =========================================================================
// Notes API
// =========================================================================

#[tokio::test]
async fn test_health_does_not_touch_database() {
    let (_file, router) = notes_app("autocommit").await;
    let (status, body) = send(&router, get_request("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "status": "ok" }));
}

#[tokio::test]
async fn test_created_note_is_committed() {
    let (_file, router) = notes_app("autocommit").await;

    let (status, created) = send(&router, post_note(json!({ "body": "buy milk" }))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["body"], json!("buy milk"));

    let (status, notes) = send(&router, get_request("/notes")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(notes.as_array().unwrap().len(), 1);

    let id = created["id"].as_i64().unwrap();
    let (status, note) = send(&router, get_request(&format!("/notes/{}", id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(note["body"], json!("buy milk"));
}

#[tokio::test]
async fn test_error_status_rolls_back_note() {
    let (_file, router) = notes_app("autocommit").await;

    let (status, _) = send(
        &router,
        post_note(json!({ "body": "doomed", "respond_with": 500 })),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

    let (_, notes) = send(&router, get_request("/notes")).await;
    assert!(notes.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_redirect_depends_on_commit_mode() {
    let (_file, router) = notes_app("autocommit").await;
    send(&router, post_note(json!({ "body": "r", "respond_with": 303 }))).await;
    let (_, notes) = send(&router, get_request("/notes")).await;
    assert!(notes.as_array().unwrap().is_empty());

    let (_file, router) = notes_app("autocommit_include_redirect").await;
    send(&router, post_note(json!({ "body": "r", "respond_with": 303 }))).await;
    let (_, notes) = send(&router, get_request("/notes")).await;
    assert_eq!(notes.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_manual_mode_discards_handler_writes() {
    let (_file, router) = notes_app("manual").await;
    let (status, _) = send(&router, post_note(json!({ "body": "lost" }))).await;
    assert_eq!(status, StatusCode::CREATED);

    let (_, notes) = send(&router, get_request("/notes")).await;
    assert!(notes.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_and_missing_note() {
    let (_file, router) = notes_app("autocommit").await;
    let (_, created) = send(&router, post_note(json!({ "body": "temp" }))).await;
    let uri = format!("/notes/{}", created["id"]);

    let delete = Request::builder()
        .method("DELETE")
        .uri(&uri)
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&router, delete).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = send(&router, get_request(&uri)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("not found"));
}

#[tokio::test]
async fn test_extractor_without_layer_is_rejected() {
    let router = Router::new().route(
        "/orphan",
        get(|_db: RequestScope<SqliteBackend>| async { StatusCode::OK }),
    );
    let (status, body) = send(&router, get_request("/orphan")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["retryable"], json!(false));
}

// =========================================================================
// Middleware with a recording backend
// =========================================================================

fn mock_router(mode: &str) -> (Router, Arc<Recorder>) {
    let (backend, recorder) = MockBackend::new(true);
    let config = DatabaseConfig::builder(backend)
        .commit_mode_name(mode)
        .build()
        .unwrap();
    let state = ScopeState::new(Arc::new(config), ResourceCache::new());

    let router = Router::new()
        .route(
            "/touch",
            get(|db: RequestScope<MockBackend>| async move {
                match db.connection().await {
                    Ok(_) => StatusCode::OK.into_response(),
                    Err(e) => e.into_response(),
                }
            }),
        )
        .route(
            "/slow",
            get(|db: RequestScope<MockBackend>| async move {
                let _session = db.session().await;
                tokio::time::sleep(Duration::from_secs(60)).await;
                StatusCode::OK
            }),
        )
        .route("/idle", get(|| async { StatusCode::OK }))
        .route_layer(axum::middleware::from_fn_with_state(
            state,
            scope_layer::<MockBackend>,
        ));
    (router, recorder)
}

#[tokio::test]
async fn test_middleware_commits_once_per_request() {
    let (router, recorder) = mock_router("autocommit");
    for _ in 0..3 {
        let (status, _) = send(&router, get_request("/touch")).await;
        assert_eq!(status, StatusCode::OK);
    }
    assert_eq!(recorder.count("create_pool"), 1);
    assert_eq!(recorder.count("acquire"), 3);
    assert_eq!(recorder.count("commit"), 3);
    assert_eq!(recorder.count("release"), 3);
}

#[tokio::test]
async fn test_request_without_connection_skips_backend() {
    let (router, recorder) = mock_router("autocommit");
    let (status, _) = send(&router, get_request("/idle")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(recorder.events().is_empty());
}

#[tokio::test]
async fn test_commit_failure_replaces_response() {
    let (router, recorder) = mock_router("autocommit");
    Recorder::fail(&recorder.fail_commit);

    let (status, body) = send(&router, get_request("/touch")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].as_str().unwrap().contains("Commit failed"));
    assert_eq!(recorder.count("release"), 1);
}

#[tokio::test]
async fn test_acquisition_failure_is_service_unavailable() {
    let (router, recorder) = mock_router("autocommit");
    Recorder::fail(&recorder.fail_acquire);

    let (status, body) = send(&router, get_request("/touch")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["retryable"], json!(true));
    assert_eq!(recorder.count("release"), 0);
}

#[tokio::test]
async fn test_cancelled_request_releases_connection() {
    let (router, recorder) = mock_router("autocommit");

    let request = router.clone().oneshot(get_request("/slow"));
    let cancelled = tokio::time::timeout(Duration::from_millis(100), request).await;
    assert!(cancelled.is_err());

    assert!(wait_until(|| recorder.count("release") == 1).await);
    assert_eq!(recorder.count("commit"), 0);
    assert_eq!(recorder.count("rollback"), 0);
}

#[test]
fn test_scope_error_response_status() {
    let response = ScopeError::commit("disk full").into_response();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}
