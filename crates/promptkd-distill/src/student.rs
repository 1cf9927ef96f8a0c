//! Trainable student.
//!
//! The student keeps only the image side of its CLIP: the frozen vision
//! tower with deep visual prompts, followed by a [`FeatureTranslator`] into
//! the teacher's embedding space. It scores images against the teacher's
//! text features and has no text path of its own.
//!
//! Parameter groups:
//!
//! | group         | role      | contents                                |
//! |---------------|-----------|-----------------------------------------|
//! | `clip`        | frozen    | backbone weights and `logit_scale`      |
//! | `vpt`         | trainable | deep visual prompt tokens               |
//! | `translator`  | trainable | feature translator incl. BN statistics  |
//! | `temperature` | trainable | adaptive temperature (when enabled)     |

use std::path::{Path, PathBuf};

use candle_core::{DType, Device, ModuleT, Tensor};
use tracing::info;

use promptkd_core::{l2_normalize, BackboneSpec, ClipBackbone, LoadReport, ParamGroup, ParamRole, ParamStore, PromptDesign};

use crate::checkpoint::{load_checkpoint, strip_fixed_buffers};
use crate::config::DistillConfig;
use crate::error::{DistillError, DistillResult};
use crate::teacher::log_report;
use crate::temperature::AdaptiveTemperature;
use crate::translator::FeatureTranslator;

#[derive(Debug, Clone)]
pub struct StudentOutput {
    /// `(b, teacher_embed_dim)` unit-norm translated image features.
    pub image_features: Tensor,
    /// `exp(logit_scale)` as an F32 scalar.
    pub logit_scale: Tensor,
}

pub struct StudentModel {
    clip: ClipBackbone,
    translator: FeatureTranslator,
    temperature: Option<AdaptiveTemperature>,
    params: ParamStore,
    device: Device,
}

impl StudentModel {
    /// Build the student and load its frozen backbone from `backbone_weights`.
    ///
    /// `teacher_embed_dim` sets the translator's output width.
    pub fn new(
        spec: &BackboneSpec,
        teacher_embed_dim: usize,
        cfg: &DistillConfig,
        backbone_weights: &[PathBuf],
        device: &Device,
    ) -> DistillResult<Self> {
        if cfg.image_size != spec.image_resolution {
            return Err(DistillError::config(
                "image_size",
                format!("input size {} must equal the student resolution {}", cfg.image_size, spec.image_resolution),
            ));
        }

        let clip_group = ParamGroup::new("clip", ParamRole::Frozen, cfg.precision.frozen_dtype(device), device);
        let vpt_group = ParamGroup::new("vpt", ParamRole::Trainable, DType::F32, device);
        let design = PromptDesign::independent(cfg.prompt.prompt_depth_vision, 0, cfg.prompt.n_ctx_vision, 0);
        let clip = ClipBackbone::new(clip_group.var_builder(), Some(vpt_group.var_builder()), spec, design)?;
        if !backbone_weights.is_empty() {
            let report = clip_group.load_pretrained(backbone_weights)?;
            log_report("student backbone", &report);
        }

        let translator_group = ParamGroup::new("translator", ParamRole::Trainable, DType::F32, device);
        let translator = FeatureTranslator::new(translator_group.var_builder(), spec.embed_dim, teacher_embed_dim)?;

        let mut params = ParamStore::new();
        params.add(clip_group)?;
        params.add(vpt_group)?;
        params.add(translator_group)?;

        let temperature = if cfg.adaptive_temperature {
            let group = ParamGroup::new("temperature", ParamRole::Trainable, DType::F32, device);
            let module = AdaptiveTemperature::new(group.var_builder())?;
            params.add(group)?;
            Some(module)
        } else {
            None
        };

        info!(
            backbone = %spec.name,
            vision_prompt_layers = design.vision_prompt_layers(),
            translator = %format!("{} -> {}", spec.embed_dim, teacher_embed_dim),
            adaptive_temperature = temperature.is_some(),
            "Student built"
        );
        Ok(Self { clip, translator, temperature, params, device: device.clone() })
    }

    /// Load saved student weights (trainable groups) non-strictly.
    pub fn load_weights(&self, path: &Path) -> DistillResult<LoadReport> {
        let mut ckpt = load_checkpoint(path, &self.device)?;
        strip_fixed_buffers(&mut ckpt.state_dict);
        let report = self.params.load_state_dict(&ckpt.state_dict)?;
        info!(path = %path.display(), epoch = ckpt.epoch, loaded = report.loaded.len(), "Student weights loaded");
        log_report("student weights", &report);
        Ok(report)
    }

    pub fn params(&self) -> &ParamStore {
        &self.params
    }

    pub fn temperature(&self) -> Option<&AdaptiveTemperature> {
        self.temperature.as_ref()
    }

    pub fn translator(&self) -> &FeatureTranslator {
        &self.translator
    }

    /// `train` switches the translator's batch norm to batch statistics.
    pub fn forward(&self, images: &Tensor, train: bool) -> DistillResult<StudentOutput> {
        let feats = self.clip.encode_image(images)?;
        let image_features = l2_normalize(&self.translator.forward_t(&feats, train)?)?;
        let logit_scale = self.clip.logit_scale()?.exp()?;
        Ok(StudentOutput { image_features, logit_scale })
    }
}
