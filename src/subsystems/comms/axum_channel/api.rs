//! Axum handlers for `/api/*` routes.
//!
//! The knowledge base and the tutor are synchronous (SQLite, blocking HTTP
//! for remote embeddings), so every handler hops onto Tokio's blocking pool.

use std::path::PathBuf;

use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::error::AppError;
use crate::subsystems::knowledge::SearchMode;

use super::AxumState;

// ── Request types ─────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(super) struct SearchRequest {
    query: String,
    mode: Option<String>,
    n_results: Option<usize>,
}

#[derive(Deserialize)]
pub(super) struct IngestRequest {
    file_path: String,
    chunk_size: Option<usize>,
}

#[derive(Deserialize)]
pub(super) struct TutorRequest {
    message: String,
    session_id: Option<String>,
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Build a JSON error response body.
fn json_error(code: &str, msg: impl std::fmt::Display) -> Json<serde_json::Value> {
    Json(json!({ "error": code, "message": format!("{msg}") }))
}

fn error_response(channel_id: &str, e: AppError) -> Response {
    let (status, code) = match &e {
        AppError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        AppError::InvalidArgument(_) => (StatusCode::BAD_REQUEST, "invalid_argument"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    };
    if status.is_server_error() {
        warn!(%channel_id, "request failed: {e}");
    }
    (status, json_error(code, e)).into_response()
}

async fn run_blocking<T, F>(f: F) -> Result<T, AppError>
where
    F: FnOnce() -> Result<T, AppError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AppError::Comms(format!("blocking task failed: {e}")))?
}

// ── Handlers ──────────────────────────────────────────────────────────────────

/// GET /api/health
pub(super) async fn health(State(state): State<AxumState>) -> Response {
    let knowledge = state.knowledge.clone();
    let tutor = state.tutor.clone();
    let result = run_blocking(move || {
        Ok(json!({
            "status": "ok",
            "collection": knowledge.collection().name(),
            "chunks": knowledge.collection().count()?,
            "embedding_strategy": knowledge.strategy(),
            "sessions": tutor.store().len()?,
        }))
    })
    .await;

    match result {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(e) => error_response(&state.channel_id, e),
    }
}

/// POST /api/search
pub(super) async fn search(
    State(state): State<AxumState>,
    Json(req): Json<SearchRequest>,
) -> Response {
    let mode = match req.mode.as_deref().map(str::parse::<SearchMode>) {
        None => SearchMode::default(),
        Some(Ok(mode)) => mode,
        Some(Err(e)) => return (StatusCode::BAD_REQUEST, json_error("invalid_argument", e)).into_response(),
    };
    let n_results = req.n_results.unwrap_or(state.default_n_results);
    if n_results == 0 {
        return (StatusCode::BAD_REQUEST, json_error("invalid_argument", "n_results must be > 0"))
            .into_response();
    }

    let knowledge = state.knowledge.clone();
    let query = req.query.clone();
    match run_blocking(move || knowledge.search(&query, mode, n_results)).await {
        Ok(context) => (
            StatusCode::OK,
            Json(json!({ "query": req.query, "mode": mode, "context": context })),
        )
            .into_response(),
        Err(e) => error_response(&state.channel_id, e),
    }
}

/// POST /api/ingest
pub(super) async fn ingest(
    State(state): State<AxumState>,
    Json(req): Json<IngestRequest>,
) -> Response {
    let chunk_size = req.chunk_size.unwrap_or(state.default_chunk_size);
    let knowledge = state.knowledge.clone();
    let path = PathBuf::from(req.file_path);
    match run_blocking(move || knowledge.ingest(&path, chunk_size)).await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => error_response(&state.channel_id, e),
    }
}

/// POST /api/tutor
pub(super) async fn tutor(
    State(state): State<AxumState>,
    Json(req): Json<TutorRequest>,
) -> Response {
    let tutor = state.tutor.clone();
    let result = run_blocking(move || tutor.advance(req.session_id.as_deref(), &req.message)).await;
    match result {
        Ok(reply) => (StatusCode::OK, Json(reply)).into_response(),
        Err(e) => error_response(&state.channel_id, e),
    }
}
