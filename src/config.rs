//! Configuration loading with env-var overrides.
//!
//! Reads `config/default.toml` (or the path given with `-f`), then applies
//! `TUTOR_WORK_DIR`, `TUTOR_LOG_LEVEL` and `TUTOR_EMBEDDING_MODE` overrides.
//! `EMBEDDING_API_KEY` is only ever read from the environment.

use std::{
    env, fs,
    path::{Path, PathBuf},
};

use serde::Deserialize;

use crate::error::AppError;
use crate::logger;
use crate::subsystems::knowledge::embedding::EmbeddingMode;

const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Knowledge collection settings (`[knowledge]`).
#[derive(Debug, Clone)]
pub struct KnowledgeConfig {
    /// Directory holding `knowledge.db` (already resolved against `work_dir`).
    pub db_dir: PathBuf,
    /// Collection name; several collections can share one database file.
    pub collection: String,
    /// Default chunk length in characters for `ingest`.
    pub chunk_size: usize,
    /// Default number of passages returned by `search`.
    pub n_results: usize,
}

/// Embedding strategy settings (`[embedding]`).
#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub mode: EmbeddingMode,
    /// Base URL of an OpenAI-compatible API; `/embeddings` is appended.
    pub api_base_url: String,
    pub model: String,
    /// URL probed (HEAD) under `auto` mode before the remote strategy is tried.
    /// Defaults to `api_base_url`.
    pub probe_url: String,
    pub probe_timeout_seconds: u64,
    /// Per-request timeout for embedding calls.
    pub timeout_seconds: u64,
    /// Max inputs per embedding request.
    pub batch_size: usize,
    /// From `EMBEDDING_API_KEY`; `None` for keyless local servers.
    pub api_key: Option<String>,
}

/// Tutor session store settings (`[sessions]`).
#[derive(Debug, Clone)]
pub struct SessionsConfig {
    /// Idle time after which a session is forgotten.
    pub ttl_seconds: u64,
    /// Maximum live sessions; the least recently used one is evicted first.
    pub capacity: usize,
}

/// HTTP channel configuration (`[comms.http]`).
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub enabled: bool,
    pub bind: String,
}

/// Fully-resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub name: String,
    /// Working directory for all persistent data (already expanded, no `~`).
    pub work_dir: PathBuf,
    pub log_level: String,
    pub knowledge: KnowledgeConfig,
    pub embedding: EmbeddingConfig,
    pub sessions: SessionsConfig,
    pub http: HttpConfig,
}

impl Config {
    /// Offline configuration rooted at `work_dir`, with every other field at
    /// its default. No file is read and no network is touched.
    pub fn offline(work_dir: &Path) -> Self {
        Self {
            name: "lite-tutor".into(),
            work_dir: work_dir.to_path_buf(),
            log_level: "info".into(),
            knowledge: KnowledgeConfig {
                db_dir: work_dir.join(default_db_dir()),
                collection: default_collection(),
                chunk_size: default_chunk_size(),
                n_results: default_n_results(),
            },
            embedding: EmbeddingConfig {
                mode: EmbeddingMode::Offline,
                api_base_url: default_embedding_api_base_url(),
                model: default_embedding_model(),
                probe_url: default_embedding_api_base_url(),
                probe_timeout_seconds: default_probe_timeout_seconds(),
                timeout_seconds: default_embedding_timeout_seconds(),
                batch_size: default_batch_size(),
                api_key: None,
            },
            sessions: SessionsConfig {
                ttl_seconds: default_session_ttl_seconds(),
                capacity: default_session_capacity(),
            },
            http: HttpConfig {
                enabled: false,
                bind: default_http_bind(),
            },
        }
    }
}

/// Env-var overrides applied on top of the TOML values.
/// Tests build this directly instead of mutating the process environment.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub work_dir: Option<String>,
    pub log_level: Option<String>,
    pub embedding_mode: Option<String>,
    pub embedding_api_key: Option<String>,
}

impl Overrides {
    pub fn from_env() -> Self {
        Self {
            work_dir: env::var("TUTOR_WORK_DIR").ok(),
            log_level: env::var("TUTOR_LOG_LEVEL").ok(),
            embedding_mode: env::var("TUTOR_EMBEDDING_MODE").ok(),
            embedding_api_key: env::var("EMBEDDING_API_KEY").ok(),
        }
    }
}

// ── Raw TOML shape ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RawConfig {
    tutor: RawTutor,
    #[serde(default)]
    knowledge: RawKnowledge,
    #[serde(default)]
    embedding: RawEmbedding,
    #[serde(default)]
    sessions: RawSessions,
    #[serde(default)]
    comms: RawComms,
}

#[derive(Deserialize)]
struct RawTutor {
    name: String,
    work_dir: String,
    log_level: String,
}

#[derive(Deserialize)]
struct RawKnowledge {
    /// Relative paths are resolved against `work_dir`.
    #[serde(default = "default_db_dir")]
    db_dir: String,
    #[serde(default = "default_collection")]
    collection: String,
    #[serde(default = "default_chunk_size")]
    chunk_size: usize,
    #[serde(default = "default_n_results")]
    n_results: usize,
}

impl Default for RawKnowledge {
    fn default() -> Self {
        Self {
            db_dir: default_db_dir(),
            collection: default_collection(),
            chunk_size: default_chunk_size(),
            n_results: default_n_results(),
        }
    }
}

#[derive(Deserialize)]
struct RawEmbedding {
    /// `"auto"`, `"online"` or `"offline"`.
    #[serde(default = "default_embedding_mode")]
    mode: String,
    #[serde(default = "default_embedding_api_base_url")]
    api_base_url: String,
    #[serde(default = "default_embedding_model")]
    model: String,
    /// Reachability check target for `auto`; falls back to `api_base_url`.
    #[serde(default)]
    probe_url: Option<String>,
    #[serde(default = "default_probe_timeout_seconds")]
    probe_timeout_seconds: u64,
    #[serde(default = "default_embedding_timeout_seconds")]
    timeout_seconds: u64,
    #[serde(default = "default_batch_size")]
    batch_size: usize,
}

impl Default for RawEmbedding {
    fn default() -> Self {
        Self {
            mode: default_embedding_mode(),
            api_base_url: default_embedding_api_base_url(),
            model: default_embedding_model(),
            probe_url: None,
            probe_timeout_seconds: default_probe_timeout_seconds(),
            timeout_seconds: default_embedding_timeout_seconds(),
            batch_size: default_batch_size(),
        }
    }
}

#[derive(Deserialize)]
struct RawSessions {
    #[serde(default = "default_session_ttl_seconds")]
    ttl_seconds: u64,
    #[serde(default = "default_session_capacity")]
    capacity: usize,
}

impl Default for RawSessions {
    fn default() -> Self {
        Self {
            ttl_seconds: default_session_ttl_seconds(),
            capacity: default_session_capacity(),
        }
    }
}

#[derive(Deserialize, Default)]
struct RawComms {
    #[serde(default)]
    http: RawHttp,
}

#[derive(Deserialize)]
struct RawHttp {
    /// Defaults to `true`: `serve` without an HTTP channel has nothing to do.
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default = "default_http_bind")]
    bind: String,
}

impl Default for RawHttp {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_http_bind(),
        }
    }
}

fn default_db_dir() -> String { "knowledge".to_string() }
fn default_collection() -> String { "lite_tutor_kb".to_string() }
fn default_chunk_size() -> usize { 500 }
fn default_n_results() -> usize { 2 }
fn default_embedding_mode() -> String { "auto".to_string() }
fn default_embedding_api_base_url() -> String { "http://127.0.0.1:11434/v1".to_string() }
fn default_embedding_model() -> String { "all-MiniLM-L6-v2".to_string() }
fn default_probe_timeout_seconds() -> u64 { 3 }
fn default_embedding_timeout_seconds() -> u64 { 30 }
fn default_batch_size() -> usize { 32 }
fn default_session_ttl_seconds() -> u64 { 60 * 60 }
fn default_session_capacity() -> usize { 1024 }
fn default_http_bind() -> String { "127.0.0.1:8000".to_string() }
fn default_true() -> bool { true }

/// Load config from `path` (or `config/default.toml`), then apply env overrides.
pub fn load(path: Option<&str>) -> Result<Config, AppError> {
    let path = Path::new(path.unwrap_or(DEFAULT_CONFIG_PATH));
    load_from(path, &Overrides::from_env())
}

/// Internal loader: accepts an explicit path and overrides.
pub fn load_from(path: &Path, overrides: &Overrides) -> Result<Config, AppError> {
    let raw = fs::read_to_string(path)
        .map_err(|e| AppError::Config(format!("cannot read {}: {e}", path.display())))?;

    let parsed: RawConfig = toml::from_str(&raw)
        .map_err(|e| AppError::Config(format!("parse error in {}: {e}", path.display())))?;

    let t = parsed.tutor;
    let work_dir = expand_home(overrides.work_dir.as_deref().unwrap_or(&t.work_dir));
    let log_level = overrides.log_level.clone().unwrap_or(t.log_level);
    logger::check_level(&log_level).map_err(|e| AppError::Config(format!("[tutor] log_level: {e}")))?;

    let mode_str = overrides
        .embedding_mode
        .as_deref()
        .unwrap_or(&parsed.embedding.mode);
    let mode = mode_str
        .parse::<EmbeddingMode>()
        .map_err(|e| AppError::Config(format!("[embedding] mode: {e}")))?;

    let k = parsed.knowledge;
    if k.chunk_size == 0 {
        return Err(AppError::Config("[knowledge] chunk_size must be > 0".into()));
    }
    if k.n_results == 0 {
        return Err(AppError::Config("[knowledge] n_results must be > 0".into()));
    }
    if parsed.embedding.batch_size == 0 {
        return Err(AppError::Config("[embedding] batch_size must be > 0".into()));
    }
    if parsed.sessions.capacity == 0 {
        return Err(AppError::Config("[sessions] capacity must be > 0".into()));
    }
    if parsed.sessions.ttl_seconds == 0 {
        return Err(AppError::Config("[sessions] ttl_seconds must be > 0".into()));
    }

    let db_dir = {
        let p = expand_home(&k.db_dir);
        if p.is_absolute() { p } else { work_dir.join(p) }
    };

    let e = parsed.embedding;
    let probe_url = e.probe_url.unwrap_or_else(|| e.api_base_url.clone());

    Ok(Config {
        name: t.name,
        work_dir,
        log_level,
        knowledge: KnowledgeConfig {
            db_dir,
            collection: k.collection,
            chunk_size: k.chunk_size,
            n_results: k.n_results,
        },
        embedding: EmbeddingConfig {
            mode,
            api_base_url: e.api_base_url,
            model: e.model,
            probe_url,
            probe_timeout_seconds: e.probe_timeout_seconds,
            timeout_seconds: e.timeout_seconds,
            batch_size: e.batch_size,
            api_key: overrides.embedding_api_key.clone(),
        },
        sessions: SessionsConfig {
            ttl_seconds: parsed.sessions.ttl_seconds,
            capacity: parsed.sessions.capacity,
        },
        http: HttpConfig {
            enabled: parsed.comms.http.enabled,
            bind: parsed.comms.http.bind,
        },
    })
}

/// Expand a leading `~` to the user's home directory.
/// Absolute or relative paths without `~` are returned unchanged.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}
