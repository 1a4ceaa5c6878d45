//! Axum-based HTTP channel. Serves the JSON API under `/api/`.
//!
//! `run()` drives the axum event loop; the [`CancellationToken`] is wired to
//! axum's graceful shutdown.
//!
//! ## URL layout
//!
//! ```text
//! GET  /api/health
//! POST /api/search   {query, mode?, n_results?}
//! POST /api/ingest   {file_path, chunk_size?}
//! POST /api/tutor    {session_id?, message}
//! GET  /favicon.ico  → 204
//! ```

mod api;

use std::sync::Arc;

use axum::{
    Router,
    http::StatusCode,
    routing::{get, post},
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::AppError;
use crate::subsystems::knowledge::KnowledgeBase;
use crate::subsystems::tutor::TutorFsm;

// ── Shared request state ──────────────────────────────────────────────────────

/// Axum router state injected into every handler via [`axum::extract::State`].
///
/// Cheap to clone; all fields are reference-counted or `Copy`.
#[derive(Clone)]
pub struct AxumState {
    /// Channel identifier used in log fields.
    pub channel_id: Arc<str>,
    pub knowledge: Arc<KnowledgeBase>,
    pub tutor: Arc<TutorFsm>,
    /// Used when an ingest request carries no `chunk_size`.
    pub default_chunk_size: usize,
    /// Used when a search request carries no `n_results`.
    pub default_n_results: usize,
}

impl AxumState {
    pub fn new(knowledge: Arc<KnowledgeBase>, tutor: Arc<TutorFsm>) -> Self {
        Self {
            channel_id: Arc::from("http0"),
            knowledge,
            tutor,
            default_chunk_size: 500,
            default_n_results: 2,
        }
    }

    pub fn with_defaults(mut self, chunk_size: usize, n_results: usize) -> Self {
        self.default_chunk_size = chunk_size;
        self.default_n_results = n_results;
        self
    }
}

// ── AxumChannel ───────────────────────────────────────────────────────────────

pub struct AxumChannel {
    bind_addr: String,
    state: AxumState,
}

impl AxumChannel {
    pub fn new(bind_addr: impl Into<String>, state: AxumState) -> Self {
        Self { bind_addr: bind_addr.into(), state }
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<(), AppError> {
        let channel_id = self.state.channel_id.clone();
        let bind_addr = self.bind_addr;
        let router = build_router(self.state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| AppError::Comms(format!("axum bind failed on {bind_addr}: {e}")))?;

        info!(%channel_id, %bind_addr, "axum channel listening");

        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| AppError::Comms(format!("axum server error: {e}")))?;

        info!(%channel_id, "axum channel shut down");
        Ok(())
    }
}

// ── Router ────────────────────────────────────────────────────────────────────

pub fn build_router(state: AxumState) -> Router {
    Router::new()
        .route("/api/health", get(api::health))
        .route("/api/search", post(api::search))
        .route("/api/ingest", post(api::ingest))
        .route("/api/tutor",  post(api::tutor))
        .route("/favicon.ico", get(|| async { StatusCode::NO_CONTENT }))
        .with_state(state)
}
