//! # promptkd-distill
//!
//! Prompt-based knowledge distillation: a frozen CLIP teacher with a
//! pretrained text prompt learner teaches a smaller student whose image
//! features are translated into the teacher's text space.
//!
//! 1. The teacher encodes every class prompt once and scores each batch.
//! 2. The student encodes the same images through its prompted vision tower
//!    and a [`FeatureTranslator`], and is scored against the teacher's text
//!    features.
//! 3. The student is trained on cross-entropy plus a temperature-softened
//!    KL term towards the teacher logits.
//!
//! ## Usage
//!
//! ```text
//! promptkd train \
//!   --dataset ./data/caltech101 \
//!   --output  ./output/caltech101 \
//!   --modal   base2novel
//! ```

pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod distiller;
pub mod error;
pub mod evaluator;
pub mod loss;
pub mod optim;
pub mod partition;
pub mod prompt_learner;
pub mod scaler;
pub mod student;
pub mod teacher;
pub mod temperature;
pub mod text_encoder;
pub mod translator;

#[cfg(test)]
mod testing;
#[cfg(test)]
mod tests;

pub use config::{DataConfig, DistillConfig, OptimConfig, Precision, PromptConfig, TrainModal};
pub use dataset::{Batch, DatasetDir, TensorDataset};
pub use distiller::{Backbones, Distiller, LossSummary, Split, TrainingStats};
pub use error::{DistillError, DistillResult};
pub use evaluator::{ClassificationEvaluator, Evaluator};
pub use partition::ClassPartition;
pub use prompt_learner::PromptLearner;
pub use student::StudentModel;
pub use teacher::TeacherModel;
pub use temperature::AdaptiveTemperature;
pub use translator::FeatureTranslator;
