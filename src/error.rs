//! Application-wide error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),

    #[error("logger error: {0}")]
    Logger(String),

    /// The knowledge collection cannot be opened, migrated, or written.
    /// Fatal for the component that owns the collection.
    #[error("storage error: {0}")]
    Storage(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Only raised while the network-backed strategy is being built; callers
    /// fall back to the hash strategy instead of propagating it.
    #[error("embedding error: {0}")]
    Embedding(String),

    #[error("session error: {0}")]
    Session(String),

    #[error("comms error: {0}")]
    Comms(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
