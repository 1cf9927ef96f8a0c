//! Learnable text prompts.
//!
//! Every class prompt reads `"<ctx_1> .. <ctx_n> <classname>."` where the
//! `n_ctx` context vectors are one shared trainable tensor. The start token
//! (prefix) and the class-name plus end tokens (suffix) are embedded once at
//! construction through the frozen token table and kept as constant segments,
//! one per [`ClassPartition`] range.

use std::ops::Range;

use candle_core::{DType, Tensor, Var};
use tracing::info;

use promptkd_core::tokenizer::{tokenize_batch, Tokenize};
use promptkd_core::{ClipBackbone, ParamGroup};

use crate::config::PromptConfig;
use crate::error::{DistillError, DistillResult};
use crate::partition::ClassPartition;

/// Context longer than this is randomly initialised even when an init phrase is given.
const MAX_INIT_CTX: usize = 4;
const CTX_INIT_STD: f32 = 0.02;

/// Frozen prefix and suffix embeddings for one class range.
#[derive(Debug, Clone)]
pub struct PromptSegment {
    pub range: Range<usize>,
    /// `(k, 1, ctx_dim)` start-token embeddings.
    pub prefix: Tensor,
    /// `(k, seq - 1 - n_ctx, ctx_dim)` class-name, end and padding embeddings.
    pub suffix: Tensor,
}

/// Which segments a forward pass assembles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptAssembly {
    /// Concatenate every partition in class order (the distillation trainer).
    AllPartitions,
    /// Only the first partition.
    FirstPartition,
}

/// Assembled prompts and where each row's end token sits.
#[derive(Debug, Clone)]
pub struct Prompts {
    /// `(n, seq, ctx_dim)` F32 embeddings.
    pub embeddings: Tensor,
    pub eot_positions: Vec<usize>,
}

#[derive(Debug)]
pub struct PromptLearner {
    ctx: Var,
    segments: Vec<PromptSegment>,
    eot_positions: Vec<usize>,
    n_ctx: usize,
    n_cls: usize,
    prompt_prefix: String,
}

impl PromptLearner {
    /// Build prompts for `classnames` against `clip`'s frozen token table.
    ///
    /// The context tensor is registered as `ctx` in `group`.
    pub fn new(
        clip: &ClipBackbone,
        tokenizer: &dyn Tokenize,
        classnames: &[String],
        cfg: &PromptConfig,
        image_size: usize,
        partition: &ClassPartition,
        group: &ParamGroup,
    ) -> DistillResult<Self> {
        if cfg.prompt_depth_text < 1 {
            return Err(DistillError::config(
                "prompt.prompt_depth_text",
                "in independent V-L prompting the language prompt depth must be >= 1",
            ));
        }
        if image_size != clip.input_resolution() {
            return Err(DistillError::config(
                "image_size",
                format!("input size {} must equal the backbone resolution {}", image_size, clip.input_resolution()),
            ));
        }
        if partition.n_cls() != classnames.len() {
            return Err(DistillError::config(
                "classnames",
                format!("partition covers {} classes, got {} names", partition.n_cls(), classnames.len()),
            ));
        }

        let device = group.device().clone();
        let n_ctx = cfg.n_ctx_text;
        let ctx_dim = clip.text_width();
        let seq = tokenizer.context_length();
        if 1 + n_ctx >= seq {
            return Err(DistillError::config(
                "prompt.n_ctx_text",
                format!("{n_ctx} context tokens leave no room in a {seq}-token sequence"),
            ));
        }

        let (ctx_vectors, prompt_prefix) = match cfg.ctx_init.as_deref() {
            Some(init) if !init.is_empty() && n_ctx <= MAX_INIT_CTX => {
                let init = init.replace('_', " ");
                let ids = tokenize_batch(tokenizer, &[init.clone()], &device)?;
                let embedding = clip.embed_tokens(&ids.ids)?;
                let ctx = embedding.get(0)?.narrow(0, 1, n_ctx)?.detach();
                (ctx, init)
            }
            _ => {
                let ctx = Tensor::randn(0f32, CTX_INIT_STD, (n_ctx, ctx_dim), &device)?;
                (ctx, vec!["X"; n_ctx].join(" "))
            }
        };
        let ctx = group.register("ctx", &ctx_vectors.to_dtype(DType::F32)?)?;

        let prompts: Vec<String> =
            classnames.iter().map(|name| format!("{} {}.", prompt_prefix, name.replace('_', " "))).collect();
        let tokenized = tokenize_batch(tokenizer, &prompts, &device)?;
        let embedding = clip.embed_tokens(&tokenized.ids)?.detach();

        let segments = partition
            .ranges()
            .iter()
            .map(|r| {
                let rows = embedding.narrow(0, r.start, r.len())?;
                Ok(PromptSegment {
                    range: r.clone(),
                    prefix: rows.narrow(1, 0, 1)?,
                    suffix: rows.narrow(1, 1 + n_ctx, seq - 1 - n_ctx)?,
                })
            })
            .collect::<DistillResult<Vec<_>>>()?;

        info!(
            initial_context = %prompt_prefix,
            n_ctx_text = n_ctx,
            n_ctx_vision = cfg.n_ctx_vision,
            classes = classnames.len(),
            segments = ?partition.sizes(),
            "Independent V-L design"
        );

        Ok(Self {
            ctx,
            segments,
            eot_positions: tokenized.eot_positions,
            n_ctx,
            n_cls: classnames.len(),
            prompt_prefix,
        })
    }

    pub fn ctx(&self) -> &Var {
        &self.ctx
    }

    pub fn n_ctx(&self) -> usize {
        self.n_ctx
    }

    pub fn n_cls(&self) -> usize {
        self.n_cls
    }

    pub fn segments(&self) -> &[PromptSegment] {
        &self.segments
    }

    /// The human-readable initial context, e.g. `"a photo of a"` or `"X X X X"`.
    pub fn prompt_prefix(&self) -> &str {
        &self.prompt_prefix
    }

    /// `[prefix, ctx, suffix]` per class.
    pub fn forward(&self, assembly: PromptAssembly) -> DistillResult<Prompts> {
        let segments = match assembly {
            PromptAssembly::AllPartitions => &self.segments[..],
            PromptAssembly::FirstPartition => &self.segments[..self.segments.len().min(1)],
        };
        if segments.is_empty() {
            return Err(DistillError::config("classnames", "no classes to build prompts for"));
        }

        let prefixes: Vec<&Tensor> = segments.iter().map(|s| &s.prefix).collect();
        let suffixes: Vec<&Tensor> = segments.iter().map(|s| &s.suffix).collect();
        let prefix = Tensor::cat(&prefixes, 0)?;
        let suffix = Tensor::cat(&suffixes, 0)?;

        let (k, _, dim) = prefix.dims3()?;
        let ctx = self.ctx.as_tensor().unsqueeze(0)?.broadcast_as((k, self.n_ctx, dim))?;
        let embeddings = Tensor::cat(&[&prefix, &ctx, &suffix], 1)?;

        let eot_positions = segments.iter().flat_map(|s| self.eot_positions[s.range.clone()].iter().copied()).collect();
        Ok(Prompts { embeddings, eot_positions })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrainModal;
    use crate::testing::{classnames, tiny_backbone};
    use candle_core::Device;
    use promptkd_core::testing::{tiny_spec, tiny_tokenizer};
    use promptkd_core::{PromptDesign, ParamRole};

    fn build(cfg: &PromptConfig, names: &[String], modal: TrainModal) -> DistillResult<(PromptLearner, ClipBackbone)> {
        let (clip, _) = tiny_backbone(&tiny_spec(), PromptDesign::standard(), &Device::Cpu);
        let tok = tiny_tokenizer(&names.iter().map(|s| s.as_str()).collect::<Vec<_>>());
        let group = ParamGroup::new("prompt_learner", ParamRole::Trainable, DType::F32, &Device::Cpu);
        let partition = ClassPartition::for_modal(modal, names.len());
        let learner = PromptLearner::new(&clip, &tok, names, cfg, tiny_spec().image_resolution, &partition, &group)?;
        Ok((learner, clip))
    }

    #[test]
    fn test_base2novel_three_classes() {
        let names = classnames(&["cat", "dog", "sea_lion"]);
        let cfg = PromptConfig { n_ctx_text: 4, ctx_init: Some("a photo of a".into()), ..Default::default() };
        let (learner, _) = build(&cfg, &names, TrainModal::Base2Novel).unwrap();

        let sizes: Vec<usize> = learner.segments().iter().map(|s| s.prefix.dim(0).unwrap()).collect();
        assert_eq!(sizes, vec![2, 1]);
        assert_eq!(learner.segments()[1].suffix.dim(0).unwrap(), 1);

        let prompts = learner.forward(PromptAssembly::AllPartitions).unwrap();
        let spec = tiny_spec();
        assert_eq!(prompts.embeddings.dims(), &[3, spec.context_length, spec.text_width]);
        assert_eq!(prompts.eot_positions.len(), 3);
        // "a photo of a sea lion." → sot + 4 ctx + 2 name tokens, then eot.
        assert_eq!(prompts.eot_positions[2], 7);

        let first = learner.forward(PromptAssembly::FirstPartition).unwrap();
        assert_eq!(first.embeddings.dim(0).unwrap(), 2);
    }

    #[test]
    fn test_ctx_seeded_from_init_phrase() {
        let names = classnames(&["cat"]);
        let cfg = PromptConfig { n_ctx_text: 4, ctx_init: Some("a photo of a".into()), ..Default::default() };
        let (learner, clip) = build(&cfg, &names, TrainModal::Cross).unwrap();
        assert_eq!(learner.prompt_prefix(), "a photo of a");

        let tok = tiny_tokenizer(&["cat"]);
        let ids = tokenize_batch(&tok, &["a photo of a".to_string()], &Device::Cpu).unwrap();
        let expected = clip.embed_tokens(&ids.ids).unwrap().get(0).unwrap().narrow(0, 1, 4).unwrap();
        let diff = (learner.ctx().as_tensor() - expected).unwrap().abs().unwrap().max_all().unwrap();
        assert_eq!(diff.to_scalar::<f32>().unwrap(), 0.0);

        // the assembled context slice is the live parameter
        let prompts = learner.forward(PromptAssembly::AllPartitions).unwrap();
        let slice = prompts.embeddings.get(0).unwrap().narrow(0, 1, 4).unwrap();
        let diff = (slice - learner.ctx().as_tensor()).unwrap().abs().unwrap().max_all().unwrap();
        assert_eq!(diff.to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn test_long_context_is_random() {
        let names = classnames(&["cat", "dog"]);
        let cfg = PromptConfig { n_ctx_text: 6, ctx_init: Some("a photo of a".into()), ..Default::default() };
        let (learner, _) = build(&cfg, &names, TrainModal::Cross).unwrap();
        assert_eq!(learner.prompt_prefix(), "X X X X X X");
        assert_eq!(learner.ctx().dims(), &[6, tiny_spec().text_width]);
        assert_eq!(learner.segments().len(), 1);
    }

    #[test]
    fn test_resolution_mismatch_fails() {
        let (clip, _) = tiny_backbone(&tiny_spec(), PromptDesign::standard(), &Device::Cpu);
        let names = classnames(&["cat"]);
        let tok = tiny_tokenizer(&["cat"]);
        let group = ParamGroup::new("prompt_learner", ParamRole::Trainable, DType::F32, &Device::Cpu);
        let err = PromptLearner::new(
            &clip,
            &tok,
            &names,
            &PromptConfig::default(),
            224,
            &ClassPartition::cross(1),
            &group,
        )
        .unwrap_err();
        assert!(matches!(err, DistillError::Config { ref field, .. } if field == "image_size"));
    }

    #[test]
    fn test_zero_text_depth_fails() {
        let names = classnames(&["cat"]);
        let cfg = PromptConfig { prompt_depth_text: 0, ..Default::default() };
        let err = build(&cfg, &names, TrainModal::Cross).unwrap_err();
        assert!(matches!(err, DistillError::Config { ref field, .. } if field == "prompt.prompt_depth_text"));
    }
}
