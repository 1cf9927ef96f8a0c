//! Classification metrics over an evaluation pass.

use std::collections::BTreeSet;

use candle_core::{Tensor, D};

use crate::error::{DistillError, DistillResult};

/// Ordered `(metric, value)` pairs; the first entry is the summary metric.
pub type Metrics = Vec<(String, f64)>;

pub trait Evaluator {
    fn reset(&mut self);

    /// Accumulate one batch of `(b, classes)` logits against `(b,)` u32 labels.
    fn process(&mut self, logits: &Tensor, labels: &Tensor) -> DistillResult<()>;

    fn evaluate(&self) -> Metrics;
}

/// Accuracy, error rate and macro F1, all in percent.
#[derive(Debug, Default, Clone)]
pub struct ClassificationEvaluator {
    y_true: Vec<u32>,
    y_pred: Vec<u32>,
}

impl ClassificationEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_samples(&self) -> usize {
        self.y_true.len()
    }

    fn accuracy(&self) -> f64 {
        if self.y_true.is_empty() {
            return 0.0;
        }
        let correct = self.y_true.iter().zip(&self.y_pred).filter(|(t, p)| t == p).count();
        100.0 * correct as f64 / self.y_true.len() as f64
    }

    /// Unweighted mean of per-class F1 over the classes present in the labels.
    fn macro_f1(&self) -> f64 {
        let classes: BTreeSet<u32> = self.y_true.iter().copied().collect();
        if classes.is_empty() {
            return 0.0;
        }
        let total: f64 = classes
            .iter()
            .map(|&c| {
                let (mut tp, mut fp, mut fn_) = (0usize, 0usize, 0usize);
                for (&t, &p) in self.y_true.iter().zip(&self.y_pred) {
                    match (t == c, p == c) {
                        (true, true) => tp += 1,
                        (false, true) => fp += 1,
                        (true, false) => fn_ += 1,
                        (false, false) => {}
                    }
                }
                let denom = 2 * tp + fp + fn_;
                if denom == 0 { 0.0 } else { 2.0 * tp as f64 / denom as f64 }
            })
            .sum();
        100.0 * total / classes.len() as f64
    }
}

impl Evaluator for ClassificationEvaluator {
    fn reset(&mut self) {
        self.y_true.clear();
        self.y_pred.clear();
    }

    fn process(&mut self, logits: &Tensor, labels: &Tensor) -> DistillResult<()> {
        let pred = logits.argmax(D::Minus1)?.to_vec1::<u32>()?;
        let truth = labels.to_dtype(candle_core::DType::U32)?.to_vec1::<u32>()?;
        if pred.len() != truth.len() {
            return Err(DistillError::InvalidBatch(format!(
                "{} predictions for {} labels",
                pred.len(),
                truth.len()
            )));
        }
        self.y_pred.extend(pred);
        self.y_true.extend(truth);
        Ok(())
    }

    fn evaluate(&self) -> Metrics {
        let acc = self.accuracy();
        vec![
            ("accuracy".to_string(), acc),
            ("error_rate".to_string(), 100.0 - acc),
            ("macro_f1".to_string(), self.macro_f1()),
        ]
    }
}
