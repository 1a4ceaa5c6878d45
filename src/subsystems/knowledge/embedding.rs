//! Embedding strategies and the once-per-collection strategy selection.
//!
//! Two interchangeable [`EmbeddingFunction`]s:
//! - [`RemoteEmbedding`]: an OpenAI-compatible `/embeddings` endpoint serving
//!   a sentence-embedding model.
//! - [`HashEmbedding`]: deterministic token-bucket vectors, no network.
//!
//! Selection is split in two so it can be tested without a network:
//! [`probe_embedding_backend`] does the I/O, [`select_strategy`] is pure.
//! [`Embedder`] wraps the result and degrades to the hash strategy for the
//! rest of its life the first time the remote strategy fails.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::EmbeddingConfig;
use crate::error::AppError;

use super::tokenize::tokenize;

/// Bucket count of the hash strategy.
pub const HASH_DIMENSION: usize = 64;

// ── Configuration state ───────────────────────────────────────────────────────

/// Tri-state embedding mode, read once when a collection is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingMode {
    /// Probe the model host, use the remote strategy when it answers.
    Auto,
    /// Skip the probe and try the remote strategy directly.
    Online,
    /// Never touch the network.
    Offline,
}

impl FromStr for EmbeddingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "online" => Ok(Self::Online),
            "offline" => Ok(Self::Offline),
            other => Err(format!("unknown embedding mode '{other}' (expected auto, online or offline)")),
        }
    }
}

impl fmt::Display for EmbeddingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Auto => "auto",
            Self::Online => "online",
            Self::Offline => "offline",
        })
    }
}

/// Outcome of [`probe_embedding_backend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    Available,
    Unavailable,
}

/// Which strategy an [`Embedder`] runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Remote,
    Hash,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Remote => "remote",
            Self::Hash => "hash",
        })
    }
}

/// Reachability probe for the model host.
///
/// Sends a HEAD request. Any HTTP response (including 4xx) means the host is
/// reachable; only a transport failure (refused, DNS, timeout) is
/// `Unavailable`. Must not be called from inside an async context.
pub fn probe_embedding_backend(url: &str, timeout: Duration) -> ProbeResult {
    let client = match Client::builder().timeout(timeout).build() {
        Ok(client) => client,
        Err(e) => {
            debug!(error = %e, "embedding probe: cannot build HTTP client");
            return ProbeResult::Unavailable;
        }
    };
    match client.head(url).send() {
        Ok(resp) => {
            debug!(%url, status = %resp.status(), "embedding probe: host reachable");
            ProbeResult::Available
        }
        Err(e) => {
            debug!(%url, error = %e, "embedding probe: host unreachable");
            ProbeResult::Unavailable
        }
    }
}

/// Pure strategy decision. `probe` is `None` when no probe was run.
pub fn select_strategy(mode: EmbeddingMode, probe: Option<ProbeResult>) -> StrategyKind {
    match (mode, probe) {
        (EmbeddingMode::Offline, _) => StrategyKind::Hash,
        (EmbeddingMode::Online, _) => StrategyKind::Remote,
        (EmbeddingMode::Auto, Some(ProbeResult::Available)) => StrategyKind::Remote,
        (EmbeddingMode::Auto, _) => StrategyKind::Hash,
    }
}

// ── Strategies ────────────────────────────────────────────────────────────────

/// One fixed-length vector per input string.
pub trait EmbeddingFunction: Send + Sync {
    fn name(&self) -> &str;

    /// Vector length produced by every call on this instance.
    fn dimension(&self) -> usize;

    fn embed(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>, AppError>;
}

/// Deterministic fallback: token counts hashed into [`HASH_DIMENSION`]
/// buckets, L2-normalised.
#[derive(Debug, Clone, Default)]
pub struct HashEmbedding;

impl HashEmbedding {
    pub fn new() -> Self {
        Self
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; HASH_DIMENSION];
        for token in tokenize(text) {
            let bucket = (stable_hash(&token) % HASH_DIMENSION as u64) as usize;
            vector[bucket] += 1.0;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        let norm = if norm == 0.0 { 1.0 } else { norm };
        for v in &mut vector {
            *v /= norm;
        }
        vector
    }
}

impl EmbeddingFunction for HashEmbedding {
    fn name(&self) -> &str {
        "hash"
    }

    fn dimension(&self) -> usize {
        HASH_DIMENSION
    }

    fn embed(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>, AppError> {
        Ok(inputs.iter().map(|text| self.embed_one(text)).collect())
    }
}

/// First 8 bytes of SHA-256, big-endian. Stable across processes and platforms.
fn stable_hash(token: &str) -> u64 {
    let digest = Sha256::digest(token.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

/// Client for an OpenAI-compatible `/embeddings` endpoint.
///
/// Built with [`RemoteEmbedding::connect`], which embeds one probe string to
/// learn the model's dimension. Any failure there means the strategy is
/// unusable.
#[derive(Debug, Clone)]
pub struct RemoteEmbedding {
    client: Client,
    endpoint: String,
    model: String,
    batch_size: usize,
    api_key: Option<String>,
    dimension: usize,
}

impl RemoteEmbedding {
    pub fn connect(cfg: &EmbeddingConfig) -> Result<Self, AppError> {
        if cfg.model.trim().is_empty() {
            return Err(AppError::Embedding("embedding model name is empty".into()));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .build()
            .map_err(|e| AppError::Embedding(format!("failed to build HTTP client: {e}")))?;

        let mut remote = Self {
            client,
            endpoint: format!("{}/embeddings", cfg.api_base_url.trim_end_matches('/')),
            model: cfg.model.clone(),
            batch_size: cfg.batch_size.max(1),
            api_key: cfg.api_key.clone(),
            dimension: 0,
        };

        let warmup = remote.request(&["dimension probe"])?;
        let dimension = warmup.first().map(Vec::len).unwrap_or(0);
        if dimension == 0 {
            return Err(AppError::Embedding("endpoint returned an empty embedding".into()));
        }
        remote.dimension = dimension;
        info!(endpoint = %remote.endpoint, model = %remote.model, dimension, "remote embedding ready");
        Ok(remote)
    }

    fn request(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>, AppError> {
        let payload = EmbeddingRequest { model: &self.model, input: inputs };
        let mut req = self.client.post(&self.endpoint).json(&payload);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req
            .send()
            .map_err(|e| AppError::Embedding(format!("request to {} failed: {e}", self.endpoint)))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(AppError::Embedding(format!("endpoint returned {status}: {body}")));
        }
        let mut parsed: EmbeddingResponse = resp
            .json()
            .map_err(|e| AppError::Embedding(format!("failed to parse response body: {e}")))?;
        if parsed.data.len() != inputs.len() {
            return Err(AppError::Embedding(format!(
                "endpoint returned {} embeddings for {} inputs",
                parsed.data.len(),
                inputs.len()
            )));
        }
        parsed.data.sort_by_key(|entry| entry.index);
        Ok(parsed.data.into_iter().map(|entry| entry.embedding).collect())
    }
}

impl EmbeddingFunction for RemoteEmbedding {
    fn name(&self) -> &str {
        "remote"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>, AppError> {
        let mut out = Vec::with_capacity(inputs.len());
        for batch in inputs.chunks(self.batch_size) {
            let vectors = self.request(batch)?;
            if let Some(bad) = vectors.iter().find(|v| v.len() != self.dimension) {
                return Err(AppError::Embedding(format!(
                    "dimension changed from {} to {}",
                    self.dimension,
                    bad.len()
                )));
            }
            out.extend(vectors);
        }
        Ok(out)
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}

// ── Embedder ──────────────────────────────────────────────────────────────────

/// The strategy chosen for one collection instance.
///
/// `embed` never fails: a remote error is logged once, the instance switches
/// to the hash strategy, and stays there.
pub struct Embedder {
    remote: Option<Box<dyn EmbeddingFunction>>,
    hash: HashEmbedding,
    degraded: AtomicBool,
}

impl Embedder {
    /// Run the selection policy for `cfg`: probe (auto mode only), decide,
    /// and connect the remote strategy when chosen. Every failure lands on
    /// the hash strategy.
    pub fn from_config(cfg: &EmbeddingConfig) -> Self {
        let probe = match cfg.mode {
            EmbeddingMode::Auto => Some(probe_embedding_backend(
                &cfg.probe_url,
                Duration::from_secs(cfg.probe_timeout_seconds),
            )),
            EmbeddingMode::Online | EmbeddingMode::Offline => None,
        };
        let kind = select_strategy(cfg.mode, probe);
        info!(mode = %cfg.mode, probe = ?probe, strategy = %kind, "embedding strategy selected");

        match kind {
            StrategyKind::Hash => Self::hash_only(),
            StrategyKind::Remote => match RemoteEmbedding::connect(cfg) {
                Ok(remote) => Self::with_remote(Box::new(remote)),
                Err(e) => {
                    warn!(error = %e, "remote embedding unavailable, using hash embedding");
                    Self::hash_only()
                }
            },
        }
    }

    pub fn hash_only() -> Self {
        Self {
            remote: None,
            hash: HashEmbedding::new(),
            degraded: AtomicBool::new(false),
        }
    }

    /// Use `remote` until its first failure.
    pub fn with_remote(remote: Box<dyn EmbeddingFunction>) -> Self {
        Self {
            remote: Some(remote),
            hash: HashEmbedding::new(),
            degraded: AtomicBool::new(false),
        }
    }

    fn active_remote(&self) -> Option<&dyn EmbeddingFunction> {
        if self.degraded.load(Ordering::Acquire) {
            return None;
        }
        self.remote.as_deref()
    }

    pub fn strategy(&self) -> StrategyKind {
        match self.active_remote() {
            Some(_) => StrategyKind::Remote,
            None => StrategyKind::Hash,
        }
    }

    pub fn dimension(&self) -> usize {
        match self.active_remote() {
            Some(remote) => remote.dimension(),
            None => self.hash.dimension(),
        }
    }

    pub fn embed(&self, inputs: &[&str]) -> Vec<Vec<f32>> {
        if let Some(remote) = self.active_remote() {
            match remote.embed(inputs) {
                Ok(vectors) => return vectors,
                Err(e) => {
                    if !self.degraded.swap(true, Ordering::AcqRel) {
                        warn!(error = %e, strategy = remote.name(), "embedding failed, switching to hash embedding");
                    }
                }
            }
        }
        inputs.iter().map(|text| self.hash.embed_one(text)).collect()
    }
}

impl fmt::Debug for Embedder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Embedder")
            .field("strategy", &self.strategy())
            .field("dimension", &self.dimension())
            .finish()
    }
}
