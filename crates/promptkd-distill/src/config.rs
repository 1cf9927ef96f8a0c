//! Run configuration.
//!
//! Enums deserialize from lowercase strings, so an unknown precision or
//! modal is rejected while the configuration is read, before any model is
//! built.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};

use promptkd_core::mixed_precision_dtype;

use crate::error::{DistillError, DistillResult};

// ── Precision ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// Frozen backbone weights in F16.
    Fp16,
    Fp32,
    /// Frozen weights in the device's mixed-precision dtype, with loss scaling.
    Amp,
}

impl Precision {
    /// Dtype the frozen backbone weights are held in.
    ///
    /// Trainable parameters and losses are F32 in every mode.
    pub fn frozen_dtype(self, device: &Device) -> DType {
        match self {
            Precision::Fp32 => DType::F32,
            Precision::Fp16 => DType::F16,
            Precision::Amp => mixed_precision_dtype(device),
        }
    }

    pub fn uses_grad_scaler(self) -> bool {
        self == Precision::Amp
    }
}

impl FromStr for Precision {
    type Err = DistillError;

    fn from_str(s: &str) -> DistillResult<Self> {
        match s {
            "fp16" => Ok(Precision::Fp16),
            "fp32" => Ok(Precision::Fp32),
            "amp" => Ok(Precision::Amp),
            other => Err(DistillError::config("precision", format!("'{other}' is not one of fp16, fp32, amp"))),
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Precision::Fp16 => "fp16",
            Precision::Fp32 => "fp32",
            Precision::Amp => "amp",
        })
    }
}

// ── TrainModal ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrainModal {
    /// Classes split into a base half and a novel half.
    Base2Novel,
    /// One class set shared by teacher and student.
    Cross,
}

impl FromStr for TrainModal {
    type Err = DistillError;

    fn from_str(s: &str) -> DistillResult<Self> {
        match s {
            "base2novel" => Ok(TrainModal::Base2Novel),
            "cross" => Ok(TrainModal::Cross),
            other => Err(DistillError::config("train_modal", format!("'{other}' is not one of base2novel, cross"))),
        }
    }
}

impl fmt::Display for TrainModal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TrainModal::Base2Novel => "base2novel",
            TrainModal::Cross => "cross",
        })
    }
}

// ── PromptConfig ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    pub n_ctx_text: usize,
    pub n_ctx_vision: usize,
    pub prompt_depth_text: usize,
    pub prompt_depth_vision: usize,
    /// Seeds the text context when it has at most four tokens.
    pub ctx_init: Option<String>,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            n_ctx_text: 4,
            n_ctx_vision: 4,
            prompt_depth_text: 9,
            prompt_depth_vision: 9,
            ctx_init: Some("a photo of a".to_string()),
        }
    }
}

// ── DistillConfig ─────────────────────────────────────────────────────────────

/// Hyper-parameters of a PromptKD run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistillConfig {
    pub teacher_backbone: String,
    pub student_backbone: String,
    pub precision: Precision,
    pub prompt: PromptConfig,
    pub train_modal: TrainModal,
    pub kd_weight: f64,
    /// Fixed temperature, also the fallback when the adaptive module is off.
    pub temperature: f64,
    pub adaptive_temperature: bool,
    pub logit_standardization: bool,
    /// Must equal the backbone resolution.
    pub image_size: usize,
    /// Explicit teacher checkpoint; derived from `teacher_root` when unset.
    pub teacher_checkpoint: Option<PathBuf>,
    pub teacher_root: PathBuf,
    /// Dataset name used to locate the base2novel teacher.
    pub dataset_name: String,
    /// Student weights to start from (a saved student state dict).
    pub init_weights: Option<PathBuf>,
}

impl Default for DistillConfig {
    fn default() -> Self {
        Self {
            teacher_backbone: "ViT-L/14".to_string(),
            student_backbone: "ViT-B/16".to_string(),
            precision: Precision::Fp16,
            prompt: PromptConfig::default(),
            train_modal: TrainModal::Base2Novel,
            kd_weight: 1.0,
            temperature: 1.0,
            adaptive_temperature: false,
            logit_standardization: false,
            image_size: 224,
            teacher_checkpoint: None,
            teacher_root: PathBuf::from("teacher_model"),
            dataset_name: "ImageNet".to_string(),
            init_weights: None,
        }
    }
}

impl DistillConfig {
    /// Reject settings that can never produce a valid run.
    pub fn check(&self) -> DistillResult<()> {
        if self.prompt.prompt_depth_text < 1 {
            return Err(DistillError::config(
                "prompt.prompt_depth_text",
                "language prompt depth must be >= 1; use a vision-only trainer to learn only the vision branch",
            ));
        }
        if self.prompt.n_ctx_text == 0 {
            return Err(DistillError::config("prompt.n_ctx_text", "at least one context token is required"));
        }
        if !(self.temperature.is_finite() && self.temperature > 0.0) {
            return Err(DistillError::config("temperature", format!("{} is not a positive number", self.temperature)));
        }
        if !(self.kd_weight.is_finite() && self.kd_weight >= 0.0) {
            return Err(DistillError::config("kd_weight", format!("{} must be finite and >= 0", self.kd_weight)));
        }
        Ok(())
    }

    /// Teacher checkpoint to load.
    ///
    /// base2novel uses `<root>/<dataset>/VLPromptLearner/model-best.safetensors`;
    /// cross uses the ImageNet cross-dataset teacher after 20 epochs.
    pub fn teacher_checkpoint_path(&self) -> PathBuf {
        if let Some(p) = &self.teacher_checkpoint {
            return p.clone();
        }
        match self.train_modal {
            TrainModal::Base2Novel => {
                self.teacher_root.join(&self.dataset_name).join("VLPromptLearner").join("model-best.safetensors")
            }
            TrainModal::Cross => {
                self.teacher_root.join("ImageNet-xd").join("VLPromptLearner_large").join("model-ep20.safetensors")
            }
        }
    }
}

// ── OptimConfig ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerName {
    Sgd,
    Adamw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerName {
    Cosine,
    Constant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimConfig {
    pub name: OptimizerName,
    pub lr: f64,
    pub weight_decay: f64,
    pub momentum: f64,
    pub max_epoch: usize,
    pub lr_scheduler: SchedulerName,
    pub warmup_epoch: usize,
    pub warmup_cons_lr: f64,
}

impl Default for OptimConfig {
    fn default() -> Self {
        Self {
            name: OptimizerName::Sgd,
            lr: 0.005,
            weight_decay: 5e-4,
            momentum: 0.9,
            max_epoch: 20,
            lr_scheduler: SchedulerName::Cosine,
            warmup_epoch: 1,
            warmup_cons_lr: 1e-5,
        }
    }
}

// ── DataConfig ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub batch_size: usize,
    pub test_batch_size: usize,
    /// Reshuffle the training examples every epoch.
    pub shuffle: bool,
    /// Fixed shuffling seed; drawn from the OS when unset.
    pub seed: Option<u64>,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self { batch_size: 8, test_batch_size: 100, shuffle: true, seed: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precision_parsing() {
        assert_eq!("amp".parse::<Precision>().unwrap(), Precision::Amp);
        let err = "bf16".parse::<Precision>().unwrap_err();
        assert!(matches!(err, DistillError::Config { ref field, .. } if field == "precision"));
    }

    #[test]
    fn test_invalid_precision_fails_on_deserialize() {
        let res: Result<DistillConfig, _> = serde_json::from_str(r#"{"precision": "int8"}"#);
        assert!(res.is_err());
        let ok: DistillConfig = serde_json::from_str(r#"{"precision": "fp32", "train_modal": "cross"}"#).unwrap();
        assert_eq!(ok.precision, Precision::Fp32);
        assert_eq!(ok.train_modal, TrainModal::Cross);
        assert_eq!(ok.prompt.n_ctx_text, 4, "missing sections take defaults");
    }

    #[test]
    fn test_frozen_dtype_per_precision() {
        let cpu = Device::Cpu;
        assert_eq!(Precision::Fp32.frozen_dtype(&cpu), DType::F32);
        assert_eq!(Precision::Fp16.frozen_dtype(&cpu), DType::F16);
        assert_eq!(Precision::Amp.frozen_dtype(&cpu), DType::F32);
        assert!(Precision::Amp.uses_grad_scaler());
    }

    #[test]
    fn test_check_rejects_zero_text_depth() {
        let mut cfg = DistillConfig::default();
        cfg.prompt.prompt_depth_text = 0;
        assert!(matches!(cfg.check(), Err(DistillError::Config { ref field, .. }) if field == "prompt.prompt_depth_text"));
    }

    #[test]
    fn test_teacher_checkpoint_path_per_modal() {
        let mut cfg = DistillConfig { dataset_name: "Caltech101".into(), ..Default::default() };
        assert_eq!(
            cfg.teacher_checkpoint_path(),
            PathBuf::from("teacher_model/Caltech101/VLPromptLearner/model-best.safetensors")
        );
        cfg.train_modal = TrainModal::Cross;
        assert!(cfg.teacher_checkpoint_path().ends_with("VLPromptLearner_large/model-ep20.safetensors"));
        cfg.teacher_checkpoint = Some(PathBuf::from("/tmp/t.safetensors"));
        assert_eq!(cfg.teacher_checkpoint_path(), PathBuf::from("/tmp/t.safetensors"));
    }
}
