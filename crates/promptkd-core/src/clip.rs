use candle_core::{DType, Module, Tensor};
use candle_nn::{linear_no_bias, Init, Linear, VarBuilder};
use tracing::debug;

use crate::backbone::{BackboneSpec, PromptDesign};
use crate::error::{CoreError, CoreResult};
use crate::text::TextTransformer;
use crate::vision::VisionTransformer;

/// Initial `logit_scale` of a freshly built CLIP, `ln(1 / 0.07)`.
const LOGIT_SCALE_INIT: f64 = 2.6592;

/// A CLIP model: both towers, their projections and the learned logit scale.
///
/// Frozen weights are read through `vb` in its dtype; deep prompt tokens are
/// registered through `prompt_vb` and cast to the weight dtype on use.
/// Every public output is F32.
#[derive(Debug, Clone)]
pub struct ClipBackbone {
    spec: BackboneSpec,
    design: PromptDesign,
    vision: VisionTransformer,
    text: TextTransformer,
    text_projection: Linear,
    logit_scale: Tensor,
    dtype: DType,
}

impl ClipBackbone {
    pub fn new(
        vb: VarBuilder,
        prompt_vb: Option<VarBuilder>,
        spec: &BackboneSpec,
        design: PromptDesign,
    ) -> CoreResult<Self> {
        spec.validate()?;
        let vision_layers = design.vision_prompt_layers();
        let text_layers = design.text_prompt_layers();

        if (vision_layers > 0 || text_layers > 0) && prompt_vb.is_none() {
            return Err(CoreError::Config {
                field: "prompt_design".into(),
                reason: "deep prompts need a trainable parameter group".into(),
            });
        }
        if vision_layers > spec.vision_layers {
            return Err(CoreError::Config {
                field: "vision_depth".into(),
                reason: format!("{} exceeds the {} vision layers", vision_layers, spec.vision_layers),
            });
        }
        if text_layers > 0 && text_layers >= spec.text_layers {
            return Err(CoreError::Config {
                field: "language_depth".into(),
                reason: format!("{} exceeds the {} text layers", text_layers + 1, spec.text_layers),
            });
        }

        let dtype = vb.dtype();
        let vision =
            VisionTransformer::new(vb.clone(), prompt_vb.clone(), spec, vision_layers, design.vision_ctx)?;
        let text = TextTransformer::new(vb.pp("text_model"), prompt_vb, spec, text_layers, design.language_ctx)?;
        let text_projection = linear_no_bias(spec.text_width, spec.embed_dim, vb.pp("text_projection"))?;
        let logit_scale = vb.get_with_hints((), "logit_scale", Init::Const(LOGIT_SCALE_INIT))?;

        debug!(
            backbone = %spec.name,
            ?dtype,
            vision_prompt_layers = vision_layers,
            text_prompt_layers = text_layers,
            "CLIP backbone built"
        );

        Ok(Self {
            spec: spec.clone(),
            design,
            vision,
            text,
            text_projection,
            logit_scale,
            dtype,
        })
    }

    pub fn spec(&self) -> &BackboneSpec {
        &self.spec
    }

    pub fn design(&self) -> PromptDesign {
        self.design
    }

    /// Dtype of the frozen weights.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn input_resolution(&self) -> usize {
        self.spec.image_resolution
    }

    pub fn embed_dim(&self) -> usize {
        self.spec.embed_dim
    }

    pub fn text_width(&self) -> usize {
        self.spec.text_width
    }

    /// `(b, 3, R, R)` images → `(b, embed_dim)` unnormalised features.
    pub fn encode_image(&self, images: &Tensor) -> CoreResult<Tensor> {
        let (_, _, h, w) = images.dims4()?;
        let expected = self.spec.image_resolution;
        if h != expected || w != expected {
            return Err(CoreError::ResolutionMismatch { expected, got: if h != expected { h } else { w } });
        }
        let feats = self.vision.forward(&images.to_dtype(self.dtype)?)?;
        Ok(feats.to_dtype(DType::F32)?)
    }

    /// Token ids → F32 token embeddings.
    pub fn embed_tokens(&self, ids: &Tensor) -> CoreResult<Tensor> {
        Ok(self.text.embed_tokens(ids)?.to_dtype(DType::F32)?)
    }

    /// Prompt embeddings → final-layer-normed hidden states, in the weight dtype.
    pub fn text_hidden_states(&self, prompts: &Tensor) -> CoreResult<Tensor> {
        Ok(self.text.hidden_states(prompts)?)
    }

    /// Project pooled text states into the shared space (F32).
    pub fn project_text(&self, pooled: &Tensor) -> CoreResult<Tensor> {
        let out = self.text_projection.forward(&pooled.to_dtype(self.dtype)?)?;
        Ok(out.to_dtype(DType::F32)?)
    }

    /// The stored (log-space) logit scale as an F32 scalar tensor.
    pub fn logit_scale(&self) -> CoreResult<Tensor> {
        Ok(self.logit_scale.to_dtype(DType::F32)?)
    }
}
