//! Checkpoint files.
//!
//! A checkpoint is a safetensors state dict with a JSON sidecar
//! (`<file>.meta.json`) carrying the epoch and, when known, the validation
//! result it was saved at.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{DistillError, DistillResult};

/// Prompt-learner buffers rebuilt from the class list on every construction.
/// They are dropped from any loaded state so a checkpoint made for another
/// class ordering or count cannot overwrite them.
pub const FIXED_BUFFER_KEYS: [&str; 4] = [
    "prompt_learner.token_prefix",
    "prompt_learner.token_prefix2",
    "prompt_learner.token_suffix",
    "prompt_learner.token_suffix2",
];

pub const BEST_MODEL_FILE: &str = "model-best.safetensors";

#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub state_dict: HashMap<String, Tensor>,
    pub epoch: usize,
    pub val_result: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CheckpointMeta {
    epoch: usize,
    #[serde(default)]
    val_result: Option<f64>,
}

/// `model-best.safetensors`, or `model-ep<epoch>.safetensors` for a given epoch.
pub fn model_file(epoch: Option<usize>) -> String {
    match epoch {
        Some(e) => format!("model-ep{e}.safetensors"),
        None => BEST_MODEL_FILE.to_string(),
    }
}

pub fn meta_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".meta.json");
    PathBuf::from(name)
}

pub fn save_checkpoint(
    path: &Path,
    state_dict: &HashMap<String, Tensor>,
    epoch: usize,
    val_result: Option<f64>,
) -> DistillResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    candle_core::safetensors::save(state_dict, path)?;
    let meta = CheckpointMeta { epoch, val_result };
    std::fs::write(meta_path(path), serde_json::to_string_pretty(&meta)?)?;
    info!(path = %path.display(), epoch, tensors = state_dict.len(), "Checkpoint saved");
    Ok(())
}

/// Read a checkpoint; a missing file is [`DistillError::ModelNotFound`].
///
/// Without a sidecar the epoch is 0.
pub fn load_checkpoint(path: &Path, device: &Device) -> DistillResult<Checkpoint> {
    if !path.exists() {
        return Err(DistillError::ModelNotFound { path: path.to_path_buf() });
    }
    let state_dict = candle_core::safetensors::load(path, device)?;
    let meta = match std::fs::read_to_string(meta_path(path)) {
        Ok(text) => serde_json::from_str(&text)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => CheckpointMeta { epoch: 0, val_result: None },
        Err(e) => return Err(e.into()),
    };
    Ok(Checkpoint { state_dict, epoch: meta.epoch, val_result: meta.val_result })
}

/// Remove [`FIXED_BUFFER_KEYS`] from `state_dict`, returning the keys removed.
pub fn strip_fixed_buffers(state_dict: &mut HashMap<String, Tensor>) -> Vec<String> {
    let removed: Vec<String> =
        FIXED_BUFFER_KEYS.iter().filter_map(|k| state_dict.remove(*k).map(|_| k.to_string())).collect();
    if !removed.is_empty() {
        debug!(?removed, "Dropped fixed prompt buffers from checkpoint");
    }
    removed
}
