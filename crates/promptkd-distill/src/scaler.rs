use candle_core::backprop::GradStore;
use candle_core::{DType, Result, Tensor, Var};
use tracing::warn;

/// Dynamic loss scaling for reduced-precision training.
///
/// The loss is multiplied by `scale` before backward, gradients are divided
/// back before the optimizer sees them, and a step whose gradients are not
/// finite is skipped while the scale backs off.
#[derive(Debug, Clone)]
pub struct GradScaler {
    scale: f64,
    growth_factor: f64,
    backoff_factor: f64,
    growth_interval: usize,
    clean_steps: usize,
}

impl Default for GradScaler {
    fn default() -> Self {
        Self { scale: 65_536.0, growth_factor: 2.0, backoff_factor: 0.5, growth_interval: 2000, clean_steps: 0 }
    }
}

impl GradScaler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_growth_interval(mut self, steps: usize) -> Self {
        self.growth_interval = steps.max(1);
        self
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Backward through `loss × scale`, unscale, and call `apply` when every
    /// gradient is finite. Returns whether the step was applied.
    pub fn step<F>(&mut self, loss: &Tensor, vars: &[Var], apply: F) -> Result<bool>
    where
        F: FnOnce(&GradStore) -> Result<()>,
    {
        let mut grads = (loss * self.scale)?.backward()?;
        let finite = self.unscale(&mut grads, vars)?;
        if finite {
            apply(&grads)?;
        } else {
            warn!(scale = self.scale, "Non-finite gradients, skipping optimizer step");
        }
        self.update(finite);
        Ok(finite)
    }

    /// Divide the gradients of `vars` by the current scale in place.
    pub fn unscale(&self, grads: &mut GradStore, vars: &[Var]) -> Result<bool> {
        let inv = 1.0 / self.scale;
        let mut finite = true;
        for var in vars {
            let Some(g) = grads.get(var.as_tensor()).cloned() else { continue };
            let g = (g * inv)?;
            let total = g.to_dtype(DType::F32)?.sum_all()?.to_scalar::<f32>()?;
            finite &= total.is_finite();
            grads.insert(var.as_tensor(), g);
        }
        Ok(finite)
    }

    /// Grow after `growth_interval` clean steps, back off on overflow.
    pub fn update(&mut self, found_finite: bool) {
        if found_finite {
            self.clean_steps += 1;
            if self.clean_steps >= self.growth_interval {
                self.scale *= self.growth_factor;
                self.clean_steps = 0;
            }
        } else {
            self.scale *= self.backoff_factor;
            self.clean_steps = 0;
        }
    }
}
