use std::path::PathBuf;

use thiserror::Error;

use promptkd_core::CoreError;

#[derive(Debug, Error)]
pub enum DistillError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {field}: {reason}")]
    Config { field: String, reason: String },

    #[error("Model not found at {}", path.display())]
    ModelNotFound { path: PathBuf },

    #[error("Dataset file not found: {}", .0.display())]
    DataNotFound(PathBuf),

    #[error("Invalid batch: {0}")]
    InvalidBatch(String),

    #[error("Unknown model '{0}' in registry")]
    UnknownModel(String),
}

impl DistillError {
    pub(crate) fn config(field: &str, reason: impl Into<String>) -> Self {
        Self::Config { field: field.to_string(), reason: reason.into() }
    }
}

pub type DistillResult<T> = Result<T, DistillError>;
