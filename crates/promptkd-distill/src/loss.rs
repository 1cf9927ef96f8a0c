//! Classification and distillation losses.

use candle_core::{Result, Tensor, D};
use candle_nn::ops::{log_softmax, softmax_last_dim};

/// Denominator guard of [`standardize`].
pub const STANDARDIZE_EPS: f64 = 1e-7;

/// Unbiased standard deviation of each row along the last axis.
///
/// A single-column row divides by 1 rather than 0.
pub fn row_std(x: &Tensor) -> Result<Tensor> {
    let n = x.dim(D::Minus1)?;
    let centered = x.broadcast_sub(&x.mean_keepdim(D::Minus1)?)?;
    let var = (centered.sqr()?.sum(D::Minus1)? / (n.saturating_sub(1).max(1)) as f64)?;
    var.sqrt()
}

/// Z-score each row: `(x - mean) / (std + 1e-7)`.
pub fn standardize(x: &Tensor) -> Result<Tensor> {
    let mean = x.mean_keepdim(D::Minus1)?;
    let std = row_std(x)?.unsqueeze(D::Minus1)?;
    x.broadcast_sub(&mean)?.broadcast_div(&(std + STANDARDIZE_EPS)?)
}

/// Number of leading classes the base2novel student is scored against:
/// `min(max_label + 1, n_cls)`.
pub fn class_window(max_label: u32, n_cls: usize) -> usize {
    (max_label as usize + 1).min(n_cls)
}

/// Softening temperature for one step.
#[derive(Debug, Clone)]
pub enum Temperature {
    Fixed(f64),
    /// Scalar tensor produced by the adaptive module; gradients flow through it.
    Adaptive(Tensor),
}

impl Temperature {
    pub fn value(&self) -> Result<f64> {
        match self {
            Temperature::Fixed(t) => Ok(*t),
            Temperature::Adaptive(t) => Ok(t.to_dtype(candle_core::DType::F64)?.to_scalar::<f64>()?),
        }
    }

    fn soften(&self, logits: &Tensor) -> Result<Tensor> {
        match self {
            Temperature::Fixed(t) => logits / *t,
            Temperature::Adaptive(t) => logits.broadcast_div(t),
        }
    }

    fn scale_squared(&self, loss: &Tensor) -> Result<Tensor> {
        match self {
            Temperature::Fixed(t) => loss * (t * t),
            Temperature::Adaptive(t) => loss.broadcast_mul(&t.sqr()?),
        }
    }
}

/// `KL(softmax(t/T) ‖ softmax(s/T))`, summed over classes, averaged over
/// the batch, then multiplied by `T²`.
pub fn kd_loss(student_logits: &Tensor, teacher_logits: &Tensor, temperature: &Temperature) -> Result<Tensor> {
    let batch = student_logits.dim(0)?.max(1);
    let s = temperature.soften(student_logits)?;
    let t = temperature.soften(teacher_logits)?;
    let log_p_s = log_softmax(&s, D::Minus1)?;
    let log_p_t = log_softmax(&t, D::Minus1)?;
    let p_t = softmax_last_dim(&t)?;
    let kl = (p_t * (log_p_t - log_p_s)?)?.sum_all()?;
    temperature.scale_squared(&(kl / batch as f64)?)
}

/// Mean cross-entropy of `(b, c)` logits against u32 labels.
pub fn cross_entropy(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    candle_nn::loss::cross_entropy(logits, labels)
}
