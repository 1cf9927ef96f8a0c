//! # promptkd-core
//!
//! Frozen CLIP backbones with deep-prompt injection, tokenization, tagged
//! parameter groups and device selection for PromptKD.
//!
//! ## Supported Backbones
//!
//! | Name | Embed dim | Hugging Face repo |
//! |------|-----------|-------------------|
//! | `ViT-B/16` | 512 | `openai/clip-vit-base-patch16` |
//! | `ViT-B/32` | 512 | `openai/clip-vit-base-patch32` |
//! | `ViT-L/14` | 768 | `openai/clip-vit-large-patch14` |
//!
//! ## Feature Flags
//!
//! | Flag | Effect |
//! |---|---|
//! | `cuda` | Enable CUDA GPU acceleration |
//! | `metal` | Enable Apple Metal GPU acceleration |
//! | `testing` | Export tiny backbones and a word tokenizer for offline tests |

pub mod backbone;
pub mod clip;
pub mod device;
pub mod error;
pub mod params;
pub mod text;
pub mod tokenizer;
pub mod transformer;
pub mod vision;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use backbone::{BackboneSpec, DesignKind, PromptDesign};
pub use clip::ClipBackbone;
pub use device::{device_name, mixed_precision_dtype, select_device};
pub use error::{CoreError, CoreResult};
pub use params::{LoadReport, ParamGroup, ParamRole, ParamStore};
pub use tokenizer::{ClipTokenizer, Tokenize};
pub use transformer::l2_normalize;
