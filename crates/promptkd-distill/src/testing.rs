//! Tiny fixtures shared by the unit and scenario tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};

use promptkd_core::testing::tiny_teacher_spec;
use promptkd_core::{BackboneSpec, ClipBackbone, ParamGroup, ParamRole, PromptDesign};

use crate::checkpoint::{save_checkpoint, FIXED_BUFFER_KEYS};
use crate::config::{DistillConfig, Precision, PromptConfig, TrainModal};
use crate::dataset::TensorDataset;

pub fn classnames(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

/// Randomly initialised F32 backbone; deep prompts, if any, share its group.
pub fn tiny_backbone(spec: &BackboneSpec, design: PromptDesign, device: &Device) -> (ClipBackbone, ParamGroup) {
    let group = ParamGroup::new("clip", ParamRole::Frozen, DType::F32, device);
    let prompt_vb = (design.vision_prompt_layers() + design.text_prompt_layers() > 0).then(|| group.var_builder());
    let clip = ClipBackbone::new(group.var_builder(), prompt_vb, spec, design).unwrap();
    (clip, group)
}

/// F32 run on the 32×32 tiny backbones with two prompted vision layers.
pub fn tiny_config(modal: TrainModal) -> DistillConfig {
    DistillConfig {
        teacher_backbone: "tiny-teacher".into(),
        student_backbone: "tiny-student".into(),
        precision: Precision::Fp32,
        prompt: PromptConfig {
            n_ctx_text: 4,
            n_ctx_vision: 2,
            prompt_depth_text: 1,
            prompt_depth_vision: 2,
            ctx_init: Some("a photo of a".into()),
        },
        train_modal: modal,
        image_size: 32,
        ..Default::default()
    }
}

/// A teacher checkpoint holding a context tensor and stale prompt buffers.
pub fn write_teacher_checkpoint(dir: &Path) -> PathBuf {
    let width = tiny_teacher_spec().text_width;
    let mut sd = HashMap::new();
    sd.insert("prompt_learner.ctx".to_string(), Tensor::randn(0f32, 0.02, (4, width), &Device::Cpu).unwrap());
    for k in FIXED_BUFFER_KEYS {
        sd.insert(k.to_string(), Tensor::zeros((9, 1, width), DType::F32, &Device::Cpu).unwrap());
    }
    let path = dir.join("VLPromptLearner").join("model-best.safetensors");
    save_checkpoint(&path, &sd, 20, None).unwrap();
    path
}

/// `n` random 32×32 images labelled `i % n_labels`.
pub fn tiny_dataset(n: usize, n_labels: u32) -> TensorDataset {
    let images = Tensor::randn(0f32, 1.0, (n, 3, 32, 32), &Device::Cpu).unwrap();
    let labels: Vec<u32> = (0..n as u32).map(|i| i % n_labels).collect();
    TensorDataset::new(images, Tensor::new(labels.as_slice(), &Device::Cpu).unwrap()).unwrap()
}
