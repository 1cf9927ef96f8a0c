//! Frozen teacher: CLIP with a pretrained prompt learner.
//!
//! Every parameter is frozen. Outputs are detached, so no gradient ever
//! reaches the teacher graph, and the text features are computed once per
//! weight state rather than once per batch.

use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use tracing::{info, warn};

use promptkd_core::{
    l2_normalize, BackboneSpec, ClipBackbone, LoadReport, ParamGroup, ParamRole, ParamStore, PromptDesign,
    Tokenize,
};

use crate::checkpoint::{load_checkpoint, strip_fixed_buffers};
use crate::config::DistillConfig;
use crate::error::DistillResult;
use crate::partition::ClassPartition;
use crate::prompt_learner::{PromptAssembly, PromptLearner};
use crate::text_encoder::TextEncoder;

/// Detached, F32 teacher outputs for one batch.
#[derive(Debug, Clone)]
pub struct TeacherOutput {
    /// `(b, embed_dim)` unit-norm image features.
    pub image_features: Tensor,
    /// `(n_cls, embed_dim)` unit-norm text features, all classes in order.
    pub text_features: Tensor,
    /// `(b, n_cls)` `exp(logit_scale) · image · textᵀ`.
    pub logits: Tensor,
}

pub struct TeacherModel {
    clip: ClipBackbone,
    prompt_learner: PromptLearner,
    params: ParamStore,
    text_features: Tensor,
}

impl TeacherModel {
    /// Build the teacher with the standard (prompt-free) backbone design.
    ///
    /// `backbone_weights` are loaded before the prompt learner embeds its
    /// class prompts, so the frozen prefix and suffix come from the real
    /// token table.
    pub fn new(
        spec: &BackboneSpec,
        tokenizer: &dyn Tokenize,
        classnames: &[String],
        cfg: &DistillConfig,
        partition: &ClassPartition,
        backbone_weights: &[PathBuf],
        device: &Device,
    ) -> DistillResult<Self> {
        let clip_group = ParamGroup::new("clip", ParamRole::Frozen, cfg.precision.frozen_dtype(device), device);
        let clip = ClipBackbone::new(clip_group.var_builder(), None, spec, PromptDesign::standard())?;
        if !backbone_weights.is_empty() {
            let report = clip_group.load_pretrained(backbone_weights)?;
            log_report("teacher backbone", &report);
        }

        let prompt_group = ParamGroup::new("prompt_learner", ParamRole::Frozen, DType::F32, device);
        let prompt_learner =
            PromptLearner::new(&clip, tokenizer, classnames, &cfg.prompt, cfg.image_size, partition, &prompt_group)?;

        let mut params = ParamStore::new();
        params.add(clip_group)?;
        params.add(prompt_group)?;

        let text_features = encode_text(&clip, &prompt_learner)?;
        info!(
            backbone = %spec.name,
            classes = classnames.len(),
            frozen_params = params.num_params(ParamRole::Frozen),
            "Teacher built"
        );
        Ok(Self { clip, prompt_learner, params, text_features })
    }

    /// Load a teacher checkpoint non-strictly after dropping the prompt buffers.
    pub fn load_checkpoint(&mut self, path: &Path) -> DistillResult<LoadReport> {
        let device = self.prompt_learner.ctx().device().clone();
        let mut ckpt = load_checkpoint(path, &device)?;
        strip_fixed_buffers(&mut ckpt.state_dict);
        let report = self.params.load_state_dict(&ckpt.state_dict)?;
        info!(path = %path.display(), epoch = ckpt.epoch, loaded = report.loaded.len(), "Teacher checkpoint loaded");
        log_report("teacher checkpoint", &report);
        self.text_features = encode_text(&self.clip, &self.prompt_learner)?;
        Ok(report)
    }

    pub fn params(&self) -> &ParamStore {
        &self.params
    }

    pub fn prompt_learner(&self) -> &PromptLearner {
        &self.prompt_learner
    }

    pub fn embed_dim(&self) -> usize {
        self.clip.embed_dim()
    }

    /// `(n_cls, embed_dim)` unit-norm text features.
    pub fn text_features(&self) -> &Tensor {
        &self.text_features
    }

    pub fn forward(&self, images: &Tensor) -> DistillResult<TeacherOutput> {
        let image_features = l2_normalize(&self.clip.encode_image(images)?)?.detach();
        let scale = self.clip.logit_scale()?.exp()?.detach();
        let logits = image_features.matmul(&self.text_features.t()?)?.broadcast_mul(&scale)?;
        Ok(TeacherOutput { image_features, text_features: self.text_features.clone(), logits })
    }
}

fn encode_text(clip: &ClipBackbone, learner: &PromptLearner) -> DistillResult<Tensor> {
    let prompts = learner.forward(PromptAssembly::AllPartitions)?;
    Ok(TextEncoder::new(clip).encode(&prompts)?.detach())
}

pub(crate) fn log_report(what: &str, report: &LoadReport) {
    if !report.missing.is_empty() {
        warn!(source = what, missing = ?report.missing, "Keys not found in loaded state");
    }
    if !report.unexpected.is_empty() {
        warn!(source = what, unexpected = ?report.unexpected, "Keys in loaded state with no parameter");
    }
    for m in &report.mismatched {
        warn!(source = what, key = %m.name, expected = ?m.expected, got = ?m.got, "Shape mismatch, skipped");
    }
}
