//! Integration tests for the axum HTTP channel.
//!
//! Run with:
//!   cargo test --features channel-axum --test test_http

use std::fs;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Method, Request, StatusCode};
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::ServiceExt;

use lite_tutor::config::Config;
use lite_tutor::subsystems::comms::axum_channel::{AxumState, build_router};
use lite_tutor::subsystems::knowledge::{KnowledgeBase, NO_CONTEXT_SENTINEL};
use lite_tutor::subsystems::tutor::{InMemorySessionStore, TutorFsm};

// ── helpers ──────────────────────────────────────────────────────────────────

fn app() -> (TempDir, Router) {
    let tmp = TempDir::new().expect("tempdir");
    let cfg = Config::offline(tmp.path());
    let kb = Arc::new(KnowledgeBase::open(&cfg.knowledge, &cfg.embedding).expect("open"));
    let store = Arc::new(InMemorySessionStore::new(NonZeroUsize::new(8).unwrap(), Duration::from_secs(60)));
    let tutor = Arc::new(TutorFsm::new(store, kb.clone()));
    let state = AxumState::new(kb, tutor).with_defaults(500, 2);
    (tmp, build_router(state))
}

async fn call(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(v) => builder
            .header("content-type", "application/json")
            .body(Body::from(v.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
    (status, value)
}

// ── endpoints ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn health_reports_strategy_and_counts() {
    let (_tmp, router) = app();
    let (status, body) = call(&router, Method::GET, "/api/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["embedding_strategy"], "hash");
    assert_eq!(body["chunks"], 0);
    assert_eq!(body["sessions"], 0);
}

#[tokio::test]
async fn search_on_empty_collection_returns_sentinel() {
    let (_tmp, router) = app();
    let (status, body) = call(&router, Method::POST, "/api/search", Some(json!({ "query": "kmp" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["mode"], "hybrid");
    assert_eq!(body["context"], NO_CONTEXT_SENTINEL);
}

#[tokio::test]
async fn ingest_then_search_finds_the_chunk() {
    let (tmp, router) = app();
    let path = tmp.path().join("dfs.txt");
    fs::write(&path, "DFS uses a stack").unwrap();

    let (status, body) = call(
        &router,
        Method::POST,
        "/api/ingest",
        Some(json!({ "file_path": path.display().to_string() })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["chunks"], 1);

    let (status, body) = call(
        &router,
        Method::POST,
        "/api/search",
        Some(json!({ "query": "DFS stack", "mode": "vector", "n_results": 1 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["context"], "DFS uses a stack");
}

#[tokio::test]
async fn ingest_missing_file_is_404() {
    let (tmp, router) = app();
    let missing = tmp.path().join("missing.txt").display().to_string();
    let (status, body) = call(&router, Method::POST, "/api/ingest", Some(json!({ "file_path": missing }))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn ingest_zero_chunk_size_is_400() {
    let (tmp, router) = app();
    let path = tmp.path().join("a.txt");
    fs::write(&path, "abc").unwrap();
    let (status, body) = call(
        &router,
        Method::POST,
        "/api/ingest",
        Some(json!({ "file_path": path.display().to_string(), "chunk_size": 0 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_argument");
}

#[tokio::test]
async fn unknown_search_mode_is_400() {
    let (_tmp, router) = app();
    let (status, body) = call(
        &router,
        Method::POST,
        "/api/search",
        Some(json!({ "query": "dfs", "mode": "fuzzy" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_argument");
}

#[tokio::test]
async fn tutor_session_advances_across_requests() {
    let (_tmp, router) = app();
    let (status, first) = call(&router, Method::POST, "/api/tutor", Some(json!({ "message": "what is dfs" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["stage"], "diagnose");
    let id = first["session_id"].as_str().unwrap().to_string();

    let (_, second) = call(
        &router,
        Method::POST,
        "/api/tutor",
        Some(json!({ "session_id": id, "message": "continue" })),
    )
    .await;
    assert_eq!(second["session_id"], id.as_str());
    assert_eq!(second["stage"], "explain");
    assert!(second["response"].as_str().unwrap().contains(NO_CONTEXT_SENTINEL));
}

#[tokio::test]
async fn favicon_is_no_content() {
    let (_tmp, router) = app();
    let (status, body) = call(&router, Method::GET, "/favicon.ico", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(body, Value::Null);
}
