//! Adaptive distillation temperature.
//!
//! A small regression network maps the mean per-row standard deviation of
//! the teacher and student logits to a temperature in `[0.1, 10.0]`.

use candle_core::{DType, Module, Result, Tensor};
use candle_nn::{linear, Linear, VarBuilder};

use crate::loss::row_std;

pub const MIN_TEMPERATURE: f64 = 0.1;
pub const MAX_TEMPERATURE: f64 = 10.0;
const HIDDEN: usize = 128;

#[derive(Debug, Clone)]
pub struct AdaptiveTemperature {
    fc1: Linear,
    fc2: Linear,
}

impl AdaptiveTemperature {
    /// Layers are registered as `mlp.0` and `mlp.2`.
    pub fn new(vb: VarBuilder) -> Result<Self> {
        let vb = vb.pp("mlp");
        Ok(Self { fc1: linear(2, HIDDEN, vb.pp("0"))?, fc2: linear(HIDDEN, 1, vb.pp("2"))? })
    }

    /// Scalar temperature for one batch of `(b, classes)` logits.
    pub fn forward(&self, teacher_logits: &Tensor, student_logits: &Tensor) -> Result<Tensor> {
        let std_t = row_std(teacher_logits)?.mean_all()?;
        let std_s = row_std(student_logits)?.mean_all()?;
        let input = Tensor::stack(&[&std_t, &std_s], 0)?.to_dtype(DType::F32)?;
        self.from_dispersion(&input)
    }

    /// `(2,)` dispersion pair → scalar in `[MIN_TEMPERATURE, MAX_TEMPERATURE]`.
    pub fn from_dispersion(&self, pair: &Tensor) -> Result<Tensor> {
        let h = self.fc1.forward(&pair.unsqueeze(0)?)?.relu()?;
        let t = candle_nn::ops::sigmoid(&self.fc2.forward(&h)?)?;
        let span = MAX_TEMPERATURE - MIN_TEMPERATURE;
        (t * span)?.affine(1.0, MIN_TEMPERATURE)?.reshape(())
    }
}
