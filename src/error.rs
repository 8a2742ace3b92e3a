//! Error types for the panel simulation

use std::path::PathBuf;

use thiserror::Error;

use crate::message::AppState;

pub type Result<T> = std::result::Result<T, SimError>;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("failed to read config {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("malformed message: {0}")]
    MalformedMessage(#[from] serde_json::Error),

    #[error("no tokio runtime available: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: AppState, to: AppState },

    #[error("subsystem {name} failed: {reason}")]
    Subsystem { name: &'static str, reason: String },
}
