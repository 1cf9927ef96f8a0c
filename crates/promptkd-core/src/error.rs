use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Backbone config error: {field}: {reason}")]
    Config { field: String, reason: String },

    #[error("Unsupported backbone: {0}. Valid values: ViT-B/16, ViT-B/32, ViT-L/14")]
    UnsupportedBackbone(String),

    #[error("Input resolution mismatch: backbone expects {expected}px, got {got}px")]
    ResolutionMismatch { expected: usize, got: usize },

    #[error("Prompt too long: {got} tokens, context length is {max}")]
    SequenceTooLong { got: usize, max: usize },

    #[error("Weights file not found: {0}")]
    WeightsNotFound(PathBuf),

    #[error("Parameter store lock poisoned")]
    LockPoisoned,

    #[error("Device not available: {0}")]
    DeviceUnavailable(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
