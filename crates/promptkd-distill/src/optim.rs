//! Optimizers, learning-rate schedules and the model registry.

use std::f64::consts::PI;

use candle_core::backprop::GradStore;
use candle_core::{Result, Tensor, Var};
use candle_nn::optim::{AdamW, Optimizer, ParamsAdamW};
use tracing::info;

use promptkd_core::ParamStore;

use crate::config::{OptimConfig, OptimizerName, SchedulerName};
use crate::error::{DistillError, DistillResult};

/// The one model group a distillation run registers.
pub const MODEL_NAME: &str = "VLPromptLearner";

// ── SGD with momentum ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamsSgd {
    pub lr: f64,
    pub momentum: f64,
    pub weight_decay: f64,
}

impl Default for ParamsSgd {
    fn default() -> Self {
        Self { lr: 0.005, momentum: 0.9, weight_decay: 5e-4 }
    }
}

/// SGD with L2 weight decay and heavy-ball momentum:
/// `d = g + wd·p`, `v = μ·v + d`, `p ← p − lr·v`.
#[derive(Debug)]
pub struct MomentumSgd {
    vars: Vec<(Var, Option<Tensor>)>,
    params: ParamsSgd,
}

impl Optimizer for MomentumSgd {
    type Config = ParamsSgd;

    fn new(vars: Vec<Var>, params: ParamsSgd) -> Result<Self> {
        let vars = vars.into_iter().filter(|v| v.dtype().is_float()).map(|v| (v, None)).collect();
        Ok(Self { vars, params })
    }

    fn step(&mut self, grads: &GradStore) -> Result<()> {
        let ParamsSgd { lr, momentum, weight_decay } = self.params;
        for (var, velocity) in self.vars.iter_mut() {
            let Some(grad) = grads.get(var.as_tensor()) else { continue };
            let mut d = grad.clone();
            if weight_decay != 0.0 {
                d = (d + (var.as_tensor() * weight_decay)?)?;
            }
            if momentum != 0.0 {
                d = match velocity.take() {
                    Some(v) => ((v * momentum)? + d)?,
                    None => d,
                };
                *velocity = Some(d.clone());
            }
            var.set(&var.as_tensor().sub(&(d * lr)?)?)?;
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }
}

// ── StudentOptimizer ──────────────────────────────────────────────────────────

pub enum StudentOptimizer {
    Sgd(MomentumSgd),
    AdamW(AdamW),
}

impl StudentOptimizer {
    pub fn build(cfg: &OptimConfig, vars: Vec<Var>) -> DistillResult<Self> {
        if vars.is_empty() {
            return Err(DistillError::config("optim", "no trainable parameters to optimize"));
        }
        Ok(match cfg.name {
            OptimizerName::Sgd => StudentOptimizer::Sgd(MomentumSgd::new(
                vars,
                ParamsSgd { lr: cfg.lr, momentum: cfg.momentum, weight_decay: cfg.weight_decay },
            )?),
            OptimizerName::Adamw => StudentOptimizer::AdamW(AdamW::new(
                vars,
                ParamsAdamW { lr: cfg.lr, weight_decay: cfg.weight_decay, ..Default::default() },
            )?),
        })
    }

    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        match self {
            StudentOptimizer::Sgd(o) => o.step(grads),
            StudentOptimizer::AdamW(o) => o.step(grads),
        }
    }

    pub fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
        let grads = loss.backward()?;
        self.step(&grads)
    }

    pub fn learning_rate(&self) -> f64 {
        match self {
            StudentOptimizer::Sgd(o) => o.learning_rate(),
            StudentOptimizer::AdamW(o) => o.learning_rate(),
        }
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        match self {
            StudentOptimizer::Sgd(o) => o.set_learning_rate(lr),
            StudentOptimizer::AdamW(o) => o.set_learning_rate(lr),
        }
    }
}

// ── LrScheduler ───────────────────────────────────────────────────────────────

/// Per-epoch learning rate: `warmup_cons_lr` for the first `warmup_epoch`
/// epochs, then the base rate, cosine-annealed to zero at `max_epoch`
/// unless the schedule is constant.
#[derive(Debug, Clone)]
pub struct LrScheduler {
    kind: SchedulerName,
    base_lr: f64,
    max_epoch: usize,
    warmup_epoch: usize,
    warmup_cons_lr: f64,
    epoch: usize,
}

impl LrScheduler {
    pub fn new(cfg: &OptimConfig) -> Self {
        Self {
            kind: cfg.lr_scheduler,
            base_lr: cfg.lr,
            max_epoch: cfg.max_epoch.max(1),
            warmup_epoch: cfg.warmup_epoch,
            warmup_cons_lr: cfg.warmup_cons_lr,
            epoch: 0,
        }
    }

    pub fn lr_at(&self, epoch: usize) -> f64 {
        if epoch < self.warmup_epoch {
            return self.warmup_cons_lr;
        }
        match self.kind {
            SchedulerName::Constant => self.base_lr,
            SchedulerName::Cosine => {
                let t = epoch.min(self.max_epoch) as f64 / self.max_epoch as f64;
                0.5 * self.base_lr * (1.0 + (PI * t).cos())
            }
        }
    }

    pub fn current_lr(&self) -> f64 {
        self.lr_at(self.epoch)
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Advance one epoch and return the new rate.
    pub fn step(&mut self) -> f64 {
        self.epoch += 1;
        self.current_lr()
    }
}

// ── ModelRegistry ─────────────────────────────────────────────────────────────

pub struct RegisteredModel {
    pub name: String,
    pub params: ParamStore,
    pub optimizer: StudentOptimizer,
    pub scheduler: LrScheduler,
}

impl RegisteredModel {
    /// Set the optimizer to the scheduler's current rate.
    pub fn sync_learning_rate(&mut self) {
        self.optimizer.set_learning_rate(self.scheduler.current_lr());
    }

    /// End-of-epoch scheduler step.
    pub fn step_scheduler(&mut self) -> f64 {
        let lr = self.scheduler.step();
        self.optimizer.set_learning_rate(lr);
        lr
    }
}

/// Named bundles of parameters, optimizer and scheduler, in registration order.
#[derive(Default)]
pub struct ModelRegistry {
    models: Vec<RegisteredModel>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_model(
        &mut self,
        name: &str,
        params: ParamStore,
        optimizer: StudentOptimizer,
        scheduler: LrScheduler,
    ) -> DistillResult<()> {
        if self.get(name).is_some() {
            return Err(DistillError::config("model_registry", format!("'{name}' registered twice")));
        }
        let mut model = RegisteredModel { name: name.to_string(), params, optimizer, scheduler };
        model.sync_learning_rate();
        info!(
            model = name,
            trainable = model.params.trainable_vars().len(),
            lr = model.optimizer.learning_rate(),
            "Model registered"
        );
        self.models.push(model);
        Ok(())
    }

    pub fn get_model_names(&self) -> Vec<&str> {
        self.models.iter().map(|m| m.name.as_str()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredModel> {
        self.models.iter().find(|m| m.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> DistillResult<&mut RegisteredModel> {
        self.models
            .iter_mut()
            .find(|m| m.name == name)
            .ok_or_else(|| DistillError::UnknownModel(name.to_string()))
    }

    pub fn models(&self) -> &[RegisteredModel] {
        &self.models
    }
}
