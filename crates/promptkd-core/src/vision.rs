//! CLIP vision tower with optional deep visual prompts.
//!
//! With `n` prompt tokens and depth `d`, the first set of learnable tokens is
//! appended after the patch sequence ahead of the pre-encoder layer norm, and
//! layers `1..d` have the trailing `n` tokens replaced by that layer's own
//! learnable tokens. The class token at
//! position 0 is pooled after the last layer.

use candle_core::{IndexOp, Module, Result, Tensor};
use candle_nn::{
    conv2d_no_bias, embedding, layer_norm, linear_no_bias, Conv2d, Conv2dConfig, Embedding, Init, LayerNorm,
    Linear, VarBuilder,
};

use crate::backbone::BackboneSpec;
use crate::transformer::Encoder;

pub(crate) const PROMPT_INIT_STD: f64 = 0.02;

#[derive(Debug, Clone)]
pub struct VisionTransformer {
    patch_embedding: Conv2d,
    class_embedding: Tensor,
    position_embedding: Embedding,
    pre_layrnorm: LayerNorm,
    encoder: Encoder,
    post_layernorm: LayerNorm,
    visual_projection: Linear,
    /// One `(n_ctx, width)` tensor per prompted layer.
    prompts: Vec<Tensor>,
    num_positions: usize,
}

impl VisionTransformer {
    /// `vb` is rooted at the checkpoint top level; `prompt_vb` registers the
    /// learnable tokens as `vpt.<layer>`.
    pub fn new(
        vb: VarBuilder,
        prompt_vb: Option<VarBuilder>,
        spec: &BackboneSpec,
        prompt_layers: usize,
        n_ctx: usize,
    ) -> Result<Self> {
        let width = spec.vision_width;
        let num_positions = spec.vision_positions();
        let vm = vb.pp("vision_model");
        let emb = vm.pp("embeddings");

        let conv_cfg = Conv2dConfig { stride: spec.patch_size, ..Default::default() };
        let patch_embedding = conv2d_no_bias(3, width, spec.patch_size, conv_cfg, emb.pp("patch_embedding"))?;
        let class_embedding = emb.get_with_hints(width, "class_embedding", Init::Randn { mean: 0.0, stdev: 1.0 })?;
        let position_embedding = embedding(num_positions, width, emb.pp("position_embedding"))?;

        let prompts = match prompt_vb {
            Some(pvb) if prompt_layers > 0 && n_ctx > 0 => (0..prompt_layers)
                .map(|i| {
                    pvb.get_with_hints(
                        (n_ctx, width),
                        &format!("vpt.{i}"),
                        Init::Randn { mean: 0.0, stdev: PROMPT_INIT_STD },
                    )
                })
                .collect::<Result<Vec<_>>>()?,
            _ => Vec::new(),
        };

        Ok(Self {
            patch_embedding,
            class_embedding,
            position_embedding,
            pre_layrnorm: layer_norm(width, 1e-5, vm.pp("pre_layrnorm"))?,
            encoder: Encoder::new(vm.pp("encoder"), width, spec.vision_layers, spec.vision_heads)?,
            post_layernorm: layer_norm(width, 1e-5, vm.pp("post_layernorm"))?,
            visual_projection: linear_no_bias(width, spec.embed_dim, vb.pp("visual_projection"))?,
            prompts,
            num_positions,
        })
    }

    pub fn num_prompt_layers(&self) -> usize {
        self.prompts.len()
    }

    /// `(b, 3, H, W)` pixels in the weight dtype → `(b, embed_dim)` projected features.
    pub fn forward(&self, pixels: &Tensor) -> Result<Tensor> {
        let b = pixels.dim(0)?;
        let dtype = pixels.dtype();

        let patches = self.patch_embedding.forward(pixels)?.flatten_from(2)?.transpose(1, 2)?;
        let width = patches.dim(2)?;
        let cls = self.class_embedding.reshape((1, 1, width))?.broadcast_as((b, 1, width))?;
        let x = Tensor::cat(&[&cls, &patches], 1)?;
        let mut x = x.broadcast_add(&self.position_embedding.embeddings().i(0..self.num_positions)?)?;
        let batched = |prompt: &Tensor| -> Result<Tensor> {
            let n = prompt.dim(0)?;
            prompt.to_dtype(dtype)?.unsqueeze(0)?.broadcast_as((b, n, width))
        };

        // Prompt tokens carry no position embedding.
        if let Some(first) = self.prompts.first() {
            x = Tensor::cat(&[&x, &batched(first)?], 1)?;
        }
        let mut x = self.pre_layrnorm.forward(&x)?;

        for (i, layer) in self.encoder.layers().iter().enumerate() {
            if i > 0 {
                if let Some(prompt) = self.prompts.get(i) {
                    let keep = x.dim(1)? - prompt.dim(0)?;
                    x = Tensor::cat(&[&x.narrow(1, 0, keep)?, &batched(prompt)?], 1)?;
                }
            }
            x = layer.forward(&x, None)?;
        }

        let pooled = self.post_layernorm.forward(&x.i((.., 0, ..))?)?;
        self.visual_projection.forward(&pooled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::tiny_spec;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_forward_shape_with_and_without_prompts() {
        let spec = tiny_spec();
        let frozen = VarMap::new();
        let prompts = VarMap::new();
        let vb = VarBuilder::from_varmap(&frozen, DType::F32, &Device::Cpu);
        let pvb = VarBuilder::from_varmap(&prompts, DType::F32, &Device::Cpu);

        let plain = VisionTransformer::new(vb.clone(), None, &spec, 0, 0).unwrap();
        let prompted = VisionTransformer::new(vb, Some(pvb), &spec, 2, 3).unwrap();
        assert_eq!(prompted.num_prompt_layers(), 2);
        assert_eq!(prompts.all_vars().len(), 2);

        let px = Tensor::randn(0f32, 1.0, (2, 3, spec.image_resolution, spec.image_resolution), &Device::Cpu).unwrap();
        assert_eq!(plain.forward(&px).unwrap().dims(), &[2, spec.embed_dim]);
        assert_eq!(prompted.forward(&px).unwrap().dims(), &[2, spec.embed_dim]);
    }

    #[test]
    fn test_prompts_change_the_output() {
        let spec = tiny_spec();
        let frozen = VarMap::new();
        let vb = VarBuilder::from_varmap(&frozen, DType::F32, &Device::Cpu);
        let plain = VisionTransformer::new(vb.clone(), None, &spec, 0, 0).unwrap();
        let prompts = VarMap::new();
        let pvb = VarBuilder::from_varmap(&prompts, DType::F32, &Device::Cpu);
        let prompted = VisionTransformer::new(vb, Some(pvb), &spec, 1, 2).unwrap();

        let px = Tensor::ones((1, 3, spec.image_resolution, spec.image_resolution), DType::F32, &Device::Cpu).unwrap();
        let a = plain.forward(&px).unwrap();
        let b = prompted.forward(&px).unwrap();
        let diff = (a - b).unwrap().abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(diff > 0.0, "prompt tokens attend into the class token");
    }

    #[test]
    fn test_first_prompt_passes_through_pre_layer_norm() {
        let spec = tiny_spec();
        let frozen = VarMap::new();
        let prompts = VarMap::new();
        let vb = VarBuilder::from_varmap(&frozen, DType::F32, &Device::Cpu);
        let pvb = VarBuilder::from_varmap(&prompts, DType::F32, &Device::Cpu);
        let prompted = VisionTransformer::new(vb, Some(pvb), &spec, 1, 2).unwrap();

        let px = Tensor::randn(0f32, 1.0, (1, 3, spec.image_resolution, spec.image_resolution), &Device::Cpu).unwrap();
        let p = Tensor::randn(0f32, 1.0, (2, spec.vision_width), &Device::Cpu).unwrap();
        let var = prompts.data().lock().unwrap().get("vpt.0").cloned().unwrap();

        var.set(&p).unwrap();
        let a = prompted.forward(&px).unwrap();
        var.set(&(&p * 10.0).unwrap()).unwrap();
        let b = prompted.forward(&px).unwrap();

        // The per-token layer norm cancels a uniform rescale of the prompt.
        let diff = (a - b).unwrap().abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(diff < 1e-3, "diff = {diff}");
    }
}
