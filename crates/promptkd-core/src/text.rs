//! CLIP text tower operating on pre-built token embeddings.
//!
//! Prompt learners assemble `(n, context_length, width)` embeddings
//! themselves, so the tower exposes the token table separately
//! ([`TextTransformer::embed_tokens`]) from the transformer pass
//! ([`TextTransformer::hidden_states`]).

use candle_core::{Module, Result, Tensor};
use candle_nn::{embedding, layer_norm, Embedding, Init, LayerNorm, VarBuilder};

use crate::backbone::BackboneSpec;
use crate::transformer::{causal_mask, Encoder};
use crate::vision::PROMPT_INIT_STD;

#[derive(Debug, Clone)]
pub struct TextTransformer {
    token_embedding: Embedding,
    position_embedding: Embedding,
    encoder: Encoder,
    final_layer_norm: LayerNorm,
    /// Learnable context for layers `1..=prompts.len()`, each `(n_ctx, width)`.
    prompts: Vec<Tensor>,
    context_length: usize,
}

impl TextTransformer {
    /// `vb` is rooted at `text_model`; `prompt_vb` registers deep prompts as
    /// `text_prompt.<layer>` starting at layer 1.
    pub fn new(vb: VarBuilder, prompt_vb: Option<VarBuilder>, spec: &BackboneSpec, prompt_layers: usize, n_ctx: usize) -> Result<Self> {
        let width = spec.text_width;
        let emb = vb.pp("embeddings");

        let prompts = match prompt_vb {
            Some(pvb) if prompt_layers > 0 && n_ctx > 0 => (1..=prompt_layers)
                .map(|i| {
                    pvb.get_with_hints(
                        (n_ctx, width),
                        &format!("text_prompt.{i}"),
                        Init::Randn { mean: 0.0, stdev: PROMPT_INIT_STD },
                    )
                })
                .collect::<Result<Vec<_>>>()?,
            _ => Vec::new(),
        };

        Ok(Self {
            token_embedding: embedding(spec.vocab_size, width, emb.pp("token_embedding"))?,
            position_embedding: embedding(spec.context_length, width, emb.pp("position_embedding"))?,
            encoder: Encoder::new(vb.pp("encoder"), width, spec.text_layers, spec.text_heads)?,
            final_layer_norm: layer_norm(width, 1e-5, vb.pp("final_layer_norm"))?,
            prompts,
            context_length: spec.context_length,
        })
    }

    /// `(n, context_length)` u32 ids → `(n, context_length, width)` embeddings.
    pub fn embed_tokens(&self, ids: &Tensor) -> Result<Tensor> {
        self.token_embedding.forward(ids)
    }

    /// Run the causal transformer over prompt embeddings and apply the final
    /// layer norm. Output keeps the input shape.
    pub fn hidden_states(&self, prompts: &Tensor) -> Result<Tensor> {
        let (n, seq, width) = prompts.dims3()?;
        let dtype = self.position_embedding.embeddings().dtype();
        let positions = self.position_embedding.embeddings().narrow(0, 0, seq.min(self.context_length))?;
        let mut x = prompts.to_dtype(dtype)?.broadcast_add(&positions)?;
        let mask = causal_mask(seq, dtype, x.device())?;

        for (i, layer) in self.encoder.layers().iter().enumerate() {
            if let Some(prompt) = i.checked_sub(1).and_then(|j| self.prompts.get(j)) {
                let n_ctx = prompt.dim(0)?;
                let ctx = prompt.to_dtype(dtype)?.unsqueeze(0)?.broadcast_as((n, n_ctx, width))?;
                let prefix = x.narrow(1, 0, 1)?;
                let suffix = x.narrow(1, 1 + n_ctx, seq - 1 - n_ctx)?;
                x = Tensor::cat(&[&prefix, &ctx, &suffix], 1)?;
            }
            x = layer.forward(&x, Some(&mask))?;
        }
        self.final_layer_norm.forward(&x)
    }

    pub fn num_prompt_layers(&self) -> usize {
        self.prompts.len()
    }
}
