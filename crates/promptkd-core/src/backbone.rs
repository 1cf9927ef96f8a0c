//! CLIP backbone variants and prompt designs.
//!
//! Shapes follow the published OpenAI CLIP checkpoints:
//!
//! | Name       | Image | Patch | Vision width × layers | Text width × layers | Embed |
//! |------------|-------|-------|-----------------------|---------------------|-------|
//! | `ViT-B/16` | 224   | 16    | 768 × 12              | 512 × 12            | 512   |
//! | `ViT-B/32` | 224   | 32    | 768 × 12              | 512 × 12            | 512   |
//! | `ViT-L/14` | 224   | 14    | 1024 × 24             | 768 × 12            | 768   |

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Architecture description of a CLIP backbone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackboneSpec {
    /// Canonical name, e.g. `ViT-B/16`.
    pub name: String,
    /// Hugging Face repository holding the safetensors weights.
    pub hf_repo: String,
    /// Square input resolution the vision tower was trained at.
    pub image_resolution: usize,
    pub patch_size: usize,
    pub vision_width: usize,
    pub vision_layers: usize,
    pub vision_heads: usize,
    /// Token context length of the text tower (77 for every OpenAI CLIP).
    pub context_length: usize,
    pub vocab_size: usize,
    pub text_width: usize,
    pub text_layers: usize,
    pub text_heads: usize,
    /// Dimension of the shared image/text similarity space.
    pub embed_dim: usize,
}

impl BackboneSpec {
    /// Look up a known backbone by name (`ViT-B/16`, `ViT-B/32`, `ViT-L/14`).
    pub fn from_name(name: &str) -> CoreResult<Self> {
        let (hf_repo, patch_size, vision_width, vision_layers, vision_heads, text_width, text_heads, embed_dim) =
            match name {
                "ViT-B/16" => ("openai/clip-vit-base-patch16", 16, 768, 12, 12, 512, 8, 512),
                "ViT-B/32" => ("openai/clip-vit-base-patch32", 32, 768, 12, 12, 512, 8, 512),
                "ViT-L/14" => ("openai/clip-vit-large-patch14", 14, 1024, 24, 16, 768, 12, 768),
                other => return Err(CoreError::UnsupportedBackbone(other.to_string())),
            };
        Ok(Self {
            name: name.to_string(),
            hf_repo: hf_repo.to_string(),
            image_resolution: 224,
            patch_size,
            vision_width,
            vision_layers,
            vision_heads,
            context_length: 77,
            vocab_size: 49_408,
            text_width,
            text_layers: 12,
            text_heads,
            embed_dim,
        })
    }

    /// Number of patch tokens per image side.
    pub fn grid_size(&self) -> usize {
        self.image_resolution / self.patch_size
    }

    /// Sequence length of the vision tower before prompts (patches + class token).
    pub fn vision_positions(&self) -> usize {
        self.grid_size() * self.grid_size() + 1
    }

    /// Filesystem-safe slug, e.g. `ViT-B/16` → `vit-b-16`.
    pub fn slug(&self) -> String {
        slug(&self.name)
    }

    /// Reject shapes the attention blocks cannot be built with.
    pub fn validate(&self) -> CoreResult<()> {
        let checks = [
            ("patch_size", self.patch_size > 0 && self.image_resolution % self.patch_size == 0,
             "image_resolution must be a multiple of patch_size"),
            ("vision_heads", self.vision_heads > 0 && self.vision_width % self.vision_heads == 0,
             "vision_width must be divisible by vision_heads"),
            ("text_heads", self.text_heads > 0 && self.text_width % self.text_heads == 0,
             "text_width must be divisible by text_heads"),
            ("context_length", self.context_length >= 2, "context must hold start and end tokens"),
        ];
        for (field, ok, reason) in checks {
            if !ok {
                return Err(CoreError::Config { field: field.to_string(), reason: reason.to_string() });
            }
        }
        Ok(())
    }
}

/// Filesystem-safe slug for a backbone name.
pub fn slug(name: &str) -> String {
    name.to_lowercase().replace(['/', ' '], "-")
}

/// Which attention blocks a backbone is built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesignKind {
    /// Plain residual attention blocks, no learnable deep prompts.
    Standard,
    /// Independent vision-language prompting: learnable tokens injected in
    /// the first `depth` layers of each tower.
    Independent,
}

/// Deep-prompt layout for a backbone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptDesign {
    pub kind: DesignKind,
    pub vision_depth: usize,
    pub language_depth: usize,
    pub vision_ctx: usize,
    pub language_ctx: usize,
}

impl PromptDesign {
    /// Standard attention everywhere.
    pub fn standard() -> Self {
        Self { kind: DesignKind::Standard, vision_depth: 0, language_depth: 0, vision_ctx: 0, language_ctx: 0 }
    }

    pub fn independent(vision_depth: usize, language_depth: usize, vision_ctx: usize, language_ctx: usize) -> Self {
        Self { kind: DesignKind::Independent, vision_depth, language_depth, vision_ctx, language_ctx }
    }

    /// Layers of the vision tower that receive fresh learnable tokens.
    pub fn vision_prompt_layers(&self) -> usize {
        match self.kind {
            DesignKind::Independent if self.vision_ctx > 0 => self.vision_depth,
            _ => 0,
        }
    }

    /// Layers `1..language_depth` of the text tower that replace the context
    /// tokens. Layer 0 takes its context from the prompt learner.
    pub fn text_prompt_layers(&self) -> usize {
        match self.kind {
            DesignKind::Independent if self.language_ctx > 0 => self.language_depth.saturating_sub(1),
            _ => 0,
        }
    }
}
