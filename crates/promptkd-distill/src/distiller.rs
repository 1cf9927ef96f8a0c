//! The distillation trainer.
//!
//! One step:
//!
//! 1. teacher forward (detached) → image features, text features, logits;
//! 2. student forward → translated image features and `exp(logit_scale)`;
//! 3. student logits against the teacher text features, restricted in
//!    base2novel to the first `min(max_label + 1, n_cls)` classes, with the
//!    teacher logits cut to the same window;
//! 4. `loss = CE(student, labels) + kd_weight · KD(student, teacher)`;
//! 5. backward and optimizer step on the student's trainable groups only.

use std::fmt;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Instant;

use candle_core::{Device, Tensor};
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};

use promptkd_core::{device_name, BackboneSpec, ParamRole, Tokenize};

use crate::checkpoint::{load_checkpoint, model_file, save_checkpoint, strip_fixed_buffers};
use crate::config::{DataConfig, DistillConfig, OptimConfig, TrainModal};
use crate::dataset::{shuffled_indices, Batch, TensorDataset};
use crate::error::{DistillError, DistillResult};
use crate::evaluator::{ClassificationEvaluator, Evaluator};
use crate::loss::{class_window, cross_entropy, kd_loss, standardize, Temperature};
use crate::optim::{LrScheduler, ModelRegistry, StudentOptimizer, MODEL_NAME};
use crate::partition::ClassPartition;
use crate::scaler::GradScaler;
use crate::student::StudentModel;
use crate::teacher::{log_report, TeacherModel};

/// Steps between debug loss lines.
const PRINT_FREQ: usize = 20;

// ── Inputs and outputs ────────────────────────────────────────────────────────

/// Backbone specs and the pretrained weight shards for each side.
///
/// Empty weight lists leave the backbones randomly initialised.
#[derive(Debug, Clone)]
pub struct Backbones {
    pub teacher: BackboneSpec,
    pub student: BackboneSpec,
    pub teacher_weights: Vec<PathBuf>,
    pub student_weights: Vec<PathBuf>,
}

/// Dataset split selecting which teacher text features score the student.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Val,
    Test,
}

impl FromStr for Split {
    type Err = DistillError;

    fn from_str(s: &str) -> DistillResult<Self> {
        match s {
            "train" => Ok(Split::Train),
            "val" => Ok(Split::Val),
            "test" => Ok(Split::Test),
            other => Err(DistillError::config("split", format!("'{other}' is not one of train, val, test"))),
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Split::Train => "train",
            Split::Val => "val",
            Split::Test => "test",
        })
    }
}

/// Graph-attached losses of one step.
#[derive(Debug, Clone)]
pub struct StepLosses {
    pub total: Tensor,
    pub cls: Tensor,
    pub kd: Tensor,
    pub temperature: Temperature,
    /// `(b, window)` student logits.
    pub student_logits: Tensor,
    /// `(b, window)` teacher logits, sliced like the student's.
    pub teacher_logits: Tensor,
}

/// Scalar view of a step, as logged.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossSummary {
    pub loss: f32,
    pub loss_cls: f32,
    pub loss_kd: f32,
    pub temperature: f64,
    /// False when the gradient scaler skipped the update.
    pub applied: bool,
}

impl StepLosses {
    fn summary(&self, applied: bool) -> DistillResult<LossSummary> {
        Ok(LossSummary {
            loss: self.total.to_scalar::<f32>()?,
            loss_cls: self.cls.to_scalar::<f32>()?,
            loss_kd: self.kd.to_scalar::<f32>()?,
            temperature: self.temperature.value()?,
            applied,
        })
    }
}

/// Summary returned after training completes.
#[derive(Debug, Clone)]
pub struct TrainingStats {
    pub total_steps: usize,
    pub final_loss: f32,
    pub best_val: Option<f64>,
    pub elapsed_secs: f64,
}

// ── Distiller ─────────────────────────────────────────────────────────────────

pub struct Distiller {
    config: DistillConfig,
    optim: OptimConfig,
    data: DataConfig,
    teacher: TeacherModel,
    student: StudentModel,
    registry: ModelRegistry,
    scaler: Option<GradScaler>,
    partition: ClassPartition,
    evaluator: Box<dyn Evaluator>,
    device: Device,
    rng: StdRng,
    epoch: usize,
}

impl Distiller {
    /// Check the configuration, load the teacher and build the student.
    ///
    /// A missing teacher checkpoint fails with [`DistillError::ModelNotFound`]
    /// before either model is constructed.
    pub fn build(
        config: DistillConfig,
        optim: OptimConfig,
        data: DataConfig,
        classnames: &[String],
        tokenizer: &dyn Tokenize,
        backbones: &Backbones,
        device: &Device,
    ) -> DistillResult<Self> {
        config.check()?;
        if classnames.is_empty() {
            return Err(DistillError::config("classnames", "at least one class is required"));
        }
        let teacher_ckpt = config.teacher_checkpoint_path();
        if !teacher_ckpt.exists() {
            return Err(DistillError::ModelNotFound { path: teacher_ckpt });
        }

        let partition = ClassPartition::for_modal(config.train_modal, classnames.len());
        info!(
            modal = %config.train_modal,
            classes = classnames.len(),
            ranges = ?partition.sizes(),
            precision = %config.precision,
            "Building PromptKD"
        );

        let mut teacher = TeacherModel::new(
            &backbones.teacher,
            tokenizer,
            classnames,
            &config,
            &partition,
            &backbones.teacher_weights,
            device,
        )?;
        teacher.load_checkpoint(&teacher_ckpt)?;

        let student = StudentModel::new(
            &backbones.student,
            teacher.embed_dim(),
            &config,
            &backbones.student_weights,
            device,
        )?;
        if let Some(init) = &config.init_weights {
            student.load_weights(init)?;
        }

        let params = student.params().clone();
        let names = params.trainable_names()?;
        info!(
            params = ?names,
            count = names.len(),
            trainable = params.num_params(ParamRole::Trainable),
            frozen = params.num_params(ParamRole::Frozen),
            "Parameters to be updated"
        );

        let optimizer = StudentOptimizer::build(&optim, params.trainable_vars())?;
        let scheduler = LrScheduler::new(&optim);
        let mut registry = ModelRegistry::new();
        registry.register_model(MODEL_NAME, params, optimizer, scheduler)?;

        info!(device = device_name(device), "Training runs on a single device");

        let scaler = config.precision.uses_grad_scaler().then(GradScaler::new);
        let rng = match data.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Ok(Self {
            config,
            optim,
            data,
            teacher,
            student,
            registry,
            scaler,
            partition,
            evaluator: Box::new(ClassificationEvaluator::new()),
            device: device.clone(),
            rng,
            epoch: 0,
        })
    }

    pub fn with_evaluator(mut self, evaluator: Box<dyn Evaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn config(&self) -> &DistillConfig {
        &self.config
    }

    pub fn teacher(&self) -> &TeacherModel {
        &self.teacher
    }

    pub fn student(&self) -> &StudentModel {
        &self.student
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn partition(&self) -> &ClassPartition {
        &self.partition
    }

    /// Completed epochs.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Current loss scale, when training with `amp`.
    pub fn grad_scale(&self) -> Option<f64> {
        self.scaler.as_ref().map(GradScaler::scale)
    }

    /// Example order for the next training epoch over `n` examples.
    ///
    /// A fresh permutation per call when `shuffle` is on, storage order otherwise.
    pub fn epoch_order(&mut self, n: usize) -> Vec<u32> {
        if self.data.shuffle {
            shuffled_indices(n, &mut self.rng)
        } else {
            (0..n as u32).collect()
        }
    }

    // ── One step ──────────────────────────────────────────────────────────────

    /// Forward both models and build the losses for `batch`.
    pub fn compute_loss(&self, batch: &Batch) -> DistillResult<StepLosses> {
        let teacher = self.teacher.forward(&batch.images)?;
        let student = self.student.forward(&batch.images, true)?;

        let n_cls = self.partition.n_cls();
        let max_label = batch.max_label()?;
        let width = match self.config.train_modal {
            TrainModal::Base2Novel => class_window(max_label, n_cls),
            TrainModal::Cross => n_cls,
        };
        if max_label as usize >= width {
            return Err(DistillError::InvalidBatch(format!("label {max_label} outside the {width} scored classes")));
        }

        let text = teacher.text_features.narrow(0, 0, width)?;
        let teacher_logits = teacher.logits.narrow(1, 0, width)?;
        let student_logits = student.image_features.matmul(&text.t()?)?.broadcast_mul(&student.logit_scale)?;

        let cls = cross_entropy(&student_logits, &batch.labels)?;

        let (t, s) = if self.config.logit_standardization {
            (standardize(&teacher_logits)?, standardize(&student_logits)?)
        } else {
            (teacher_logits.clone(), student_logits.clone())
        };
        let temperature = match self.student.temperature() {
            Some(module) => Temperature::Adaptive(module.forward(&t, &s)?),
            None => Temperature::Fixed(self.config.temperature),
        };
        let kd = kd_loss(&s, &t, &temperature)?;
        let total = (&cls + (&kd * self.config.kd_weight)?)?;

        Ok(StepLosses { total, cls, kd, temperature, student_logits, teacher_logits })
    }

    /// One optimisation step.
    pub fn forward_backward(&mut self, batch: &Batch) -> DistillResult<LossSummary> {
        let losses = self.compute_loss(batch)?;
        let model = self.registry.get_mut(MODEL_NAME)?;
        let applied = match self.scaler.as_mut() {
            Some(scaler) => {
                let vars = model.params.trainable_vars();
                let optimizer = &mut model.optimizer;
                scaler.step(&losses.total, &vars, |grads| optimizer.step(grads))?
            }
            None => {
                model.optimizer.backward_step(&losses.total)?;
                true
            }
        };
        losses.summary(applied)
    }

    // ── Evaluation ────────────────────────────────────────────────────────────

    /// Class range whose text features score `split`.
    pub fn text_range(&self, split: Split) -> DistillResult<Range<usize>> {
        match (self.config.train_modal, split) {
            (TrainModal::Cross, _) => Ok(0..self.partition.n_cls()),
            (TrainModal::Base2Novel, Split::Test) => self
                .partition
                .novel()
                .ok_or_else(|| DistillError::config("split", "a single class has no novel half to test on")),
            (TrainModal::Base2Novel, _) => Ok(self.partition.base()),
        }
    }

    /// Evaluate the student on `data` and return the first metric.
    ///
    /// Labels are indices into the split's class range.
    pub fn test(&mut self, data: &TensorDataset, split: Split) -> DistillResult<f64> {
        let range = self.text_range(split)?;
        let text = self.teacher.text_features().narrow(0, range.start, range.len())?;
        self.evaluator.reset();

        for batch in data.batches(self.data.test_batch_size) {
            let batch = batch?;
            let out = self.student.forward(&batch.images, false)?;
            let logits = out.image_features.detach().matmul(&text.t()?)?.broadcast_mul(&out.logit_scale.detach())?;
            self.evaluator.process(&logits, &batch.labels)?;
        }

        let metrics = self.evaluator.evaluate();
        for (name, value) in &metrics {
            info!(tag = %format!("{split}/{name}"), value, epoch = self.epoch, "Eval");
        }
        metrics.first().map(|(_, v)| *v).ok_or_else(|| DistillError::InvalidBatch("evaluator reported no metrics".into()))
    }

    // ── Training loop ─────────────────────────────────────────────────────────

    /// Train for the remaining epochs, validating after each one when `val` is given.
    ///
    /// The best validation checkpoint is written as `model-best`, the last
    /// epoch as `model-ep<max_epoch>`.
    pub fn train(
        &mut self,
        train: &TensorDataset,
        val: Option<&TensorDataset>,
        output_dir: &Path,
    ) -> DistillResult<TrainingStats> {
        std::fs::create_dir_all(output_dir)?;
        let start = Instant::now();
        let max_epoch = self.optim.max_epoch;
        let per_epoch = train.num_batches(self.data.batch_size);

        info!(
            examples = train.len(),
            epochs = max_epoch,
            batch_size = self.data.batch_size,
            steps_per_epoch = per_epoch,
            shuffle = self.data.shuffle,
            "Training student"
        );

        let pb = progress_bar((max_epoch.saturating_sub(self.epoch) * per_epoch) as u64);
        let mut total_steps = 0usize;
        let mut final_loss = 0f32;
        let mut best_val: Option<f64> = None;

        for epoch in self.epoch..max_epoch {
            let mut epoch_loss = 0f64;
            let mut steps = 0usize;
            let order = self.epoch_order(train.len());
            for batch in train.batches_in_order(&order, self.data.batch_size) {
                let summary = self.forward_backward(&batch?)?;
                total_steps += 1;
                steps += 1;
                epoch_loss += summary.loss as f64;
                final_loss = summary.loss;

                pb.inc(1);
                pb.set_message(format!(
                    "epoch {}/{} | loss {:.4} | T {:.2}",
                    epoch + 1,
                    max_epoch,
                    summary.loss,
                    summary.temperature
                ));
                if total_steps % PRINT_FREQ == 0 {
                    debug!(
                        epoch = epoch + 1,
                        step = total_steps,
                        loss = summary.loss,
                        loss_cls = summary.loss_cls,
                        loss_kd = summary.loss_kd,
                        temperature = summary.temperature,
                        applied = summary.applied,
                        "Step"
                    );
                }
            }

            let lr = self.registry.get_mut(MODEL_NAME)?.step_scheduler();
            self.epoch = epoch + 1;
            info!(
                epoch = self.epoch,
                avg_loss = if steps > 0 { epoch_loss / steps as f64 } else { 0.0 },
                lr,
                "Epoch complete"
            );

            if let Some(val) = val {
                let result = self.test(val, Split::Val)?;
                if best_val.map_or(true, |b| result > b) {
                    best_val = Some(result);
                    self.save_model(output_dir, self.epoch, Some(result), true)?;
                }
            }
        }

        self.save_model(output_dir, max_epoch, None, false)?;
        pb.finish_with_message(format!("done | loss {final_loss:.4}"));

        let elapsed_secs = start.elapsed().as_secs_f64();
        info!(total_steps, final_loss, ?best_val, elapsed_secs = %format!("{elapsed_secs:.1}"), "Training complete");
        Ok(TrainingStats { total_steps, final_loss, best_val, elapsed_secs })
    }

    // ── Checkpoints ───────────────────────────────────────────────────────────

    /// Write the trainable groups of every registered model under `<dir>/<name>/`.
    pub fn save_model(&self, dir: &Path, epoch: usize, val_result: Option<f64>, is_best: bool) -> DistillResult<()> {
        for model in self.registry.models() {
            let state = model.params.state_dict(Some(ParamRole::Trainable))?;
            let file = model_file(if is_best { None } else { Some(epoch) });
            save_checkpoint(&dir.join(&model.name).join(file), &state, epoch, val_result)?;
        }
        Ok(())
    }

    /// Load every registered model from `<dir>/<name>/`, the best file unless
    /// `epoch` is given.
    pub fn load_model(&self, dir: &Path, epoch: Option<usize>) -> DistillResult<()> {
        for model in self.registry.models() {
            let path = dir.join(&model.name).join(model_file(epoch));
            let mut ckpt = load_checkpoint(&path, &self.device)?;
            strip_fixed_buffers(&mut ckpt.state_dict);
            let report = model.params.load_state_dict(&ckpt.state_dict)?;
            info!(model = %model.name, path = %path.display(), epoch = ckpt.epoch, "Loading weights");
            log_report(&model.name, &report);
        }
        Ok(())
    }
}

fn progress_bar(total: u64) -> ProgressBar {
    let pb = ProgressBar::new(total);
    let style = ProgressStyle::with_template(
        "{spinner:.cyan} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({percent}%) | {msg}",
    )
    .map(|s| s.progress_chars("█▓░"))
    .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb.set_message("starting...");
    pb
}
