//! Error types shared by the trail store, snapshot provider and transport layers.
//!
//! The streaming protocol code uses `anyhow` with context; these typed errors
//! cover the collaborators whose failures callers need to tell apart.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ReplError>;

#[derive(Debug, Error)]
pub enum ReplError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid config file {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("replica trail {0} not found")]
    TrailNotFound(u64),

    #[error("trail store error: {0}")]
    Trail(String),

    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("transfer {0} is already running")]
    DuplicateTransfer(String),

    #[error("{0} channel closed")]
    ChannelClosed(&'static str),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}
