//! Engine error types.

use std::fmt::Display;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("No compute backends available")]
    BackendUnavailable,

    #[error("Backend index {index} out of range ({count} backends)")]
    BackendIndex { index: usize, count: usize },

    #[error("Backend '{backend}' failed: {reason}")]
    BackendRuntime { backend: String, reason: String },

    #[error("Failed to allocate {len} cells for host copy-back")]
    Allocation { len: usize },

    #[error("Invalid grid: {0}")]
    InvalidGrid(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    pub(crate) fn runtime(backend: &str, reason: impl Display) -> Self {
        EngineError::BackendRuntime {
            backend: backend.to_string(),
            reason: reason.to_string(),
        }
    }
}
