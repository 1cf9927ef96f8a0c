//! End-to-end trainer scenarios on tiny random backbones.

use std::path::Path;

use candle_core::{Device, Tensor, D};

use promptkd_core::testing::{tiny_spec, tiny_teacher_spec, tiny_tokenizer};
use promptkd_core::ParamRole;

use crate::config::{DataConfig, DistillConfig, OptimConfig, Precision, SchedulerName, TrainModal};
use crate::dataset::Batch;
use crate::distiller::{Backbones, Distiller, Split};
use crate::error::{DistillError, DistillResult};
use crate::optim::MODEL_NAME;
use crate::testing::{classnames, tiny_config, tiny_dataset, write_teacher_checkpoint};

const TEN: [&str; 10] = ["cat", "dog", "owl", "fox", "elk", "bee", "ant", "cod", "eel", "yak"];

fn backbones() -> Backbones {
    Backbones { teacher: tiny_teacher_spec(), student: tiny_spec(), teacher_weights: vec![], student_weights: vec![] }
}

fn optim() -> OptimConfig {
    OptimConfig { lr: 0.05, max_epoch: 2, lr_scheduler: SchedulerName::Constant, warmup_epoch: 0, ..Default::default() }
}

fn data() -> DataConfig {
    DataConfig { batch_size: 4, test_batch_size: 8, seed: Some(0), ..Default::default() }
}

fn build(cfg: DistillConfig, optim: OptimConfig, names: &[&str], dir: &Path) -> DistillResult<Distiller> {
    build_with(cfg, optim, data(), names, dir)
}

fn build_with(
    cfg: DistillConfig,
    optim: OptimConfig,
    data: DataConfig,
    names: &[&str],
    dir: &Path,
) -> DistillResult<Distiller> {
    let cfg = DistillConfig { teacher_checkpoint: Some(write_teacher_checkpoint(dir)), ..cfg };
    let tok = tiny_tokenizer(names);
    Distiller::build(cfg, optim, data, &classnames(names), &tok, &backbones(), &Device::Cpu)
}

fn batch(labels: &[u32]) -> Batch {
    let images = Tensor::randn(0f32, 1.0, (labels.len(), 3, 32, 32), &Device::Cpu).unwrap();
    Batch::new(images, Tensor::new(labels, &Device::Cpu).unwrap()).unwrap()
}

fn scalar(t: &Tensor) -> f32 {
    t.to_scalar::<f32>().unwrap()
}

#[test]
fn test_zero_kd_weight_total_is_classification_loss() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = DistillConfig { kd_weight: 0.0, ..tiny_config(TrainModal::Base2Novel) };
    let d = build(cfg, optim(), &TEN, dir.path()).unwrap();
    let losses = d.compute_loss(&batch(&[0, 1, 2, 3])).unwrap();
    assert!(scalar(&losses.kd) > 0.0);
    assert_eq!(scalar(&losses.total), scalar(&losses.cls));
}

#[test]
fn test_unit_temperature_kd_is_plain_kl() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = DistillConfig { temperature: 1.0, logit_standardization: false, ..tiny_config(TrainModal::Cross) };
    let d = build(cfg, optim(), &TEN, dir.path()).unwrap();
    let losses = d.compute_loss(&batch(&[0, 4, 9])).unwrap();

    let s = losses.student_logits.to_vec2::<f32>().unwrap();
    let t = losses.teacher_logits.to_vec2::<f32>().unwrap();
    let log_softmax = |r: &[f32]| {
        let m = r.iter().cloned().fold(f32::MIN, f32::max);
        let lse = m + r.iter().map(|v| (v - m).exp()).sum::<f32>().ln();
        r.iter().map(|v| v - lse).collect::<Vec<_>>()
    };
    let mut expected = 0.0f32;
    for (sr, tr) in s.iter().zip(&t) {
        let (ls, lt) = (log_softmax(sr), log_softmax(tr));
        expected += lt.iter().zip(&ls).map(|(p, q)| p.exp() * (p - q)).sum::<f32>();
    }
    expected /= s.len() as f32;
    assert!((scalar(&losses.kd) - expected).abs() < 1e-4, "{} vs {expected}", scalar(&losses.kd));
    assert_eq!(losses.temperature.value().unwrap(), 1.0);
}

#[test]
fn test_base2novel_window_follows_labels() {
    let dir = tempfile::tempdir().unwrap();
    let d = build(tiny_config(TrainModal::Base2Novel), optim(), &TEN, dir.path()).unwrap();

    let losses = d.compute_loss(&batch(&[0, 2, 4, 1])).unwrap();
    assert_eq!(losses.student_logits.dims(), &[4, 5]);
    assert_eq!(losses.teacher_logits.dims(), &[4, 5]);

    let losses = d.compute_loss(&batch(&[9, 3])).unwrap();
    assert_eq!(losses.student_logits.dims(), &[2, 10]);
}

#[test]
fn test_cross_uses_every_class() {
    let dir = tempfile::tempdir().unwrap();
    let d = build(tiny_config(TrainModal::Cross), optim(), &TEN, dir.path()).unwrap();
    let losses = d.compute_loss(&batch(&[0, 1])).unwrap();
    assert_eq!(losses.student_logits.dims(), &[2, 10]);
    assert_eq!(d.partition().ranges().len(), 1);
}

#[test]
fn test_label_outside_classes_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let d = build(tiny_config(TrainModal::Base2Novel), optim(), &TEN, dir.path()).unwrap();
    let err = d.compute_loss(&batch(&[11, 0])).unwrap_err();
    assert!(matches!(err, DistillError::InvalidBatch(_)));
}

#[test]
fn test_features_are_unit_norm() {
    let dir = tempfile::tempdir().unwrap();
    let d = build(tiny_config(TrainModal::Cross), optim(), &TEN, dir.path()).unwrap();
    let images = batch(&[0, 1, 2]).images;
    let t = d.teacher().forward(&images).unwrap();
    let s = d.student().forward(&images, false).unwrap();
    for feats in [&t.image_features, &t.text_features, &s.image_features] {
        let norms = feats.sqr().unwrap().sum(D::Minus1).unwrap().sqrt().unwrap().to_vec1::<f32>().unwrap();
        assert!(norms.iter().all(|n| (n - 1.0).abs() < 1e-4), "{norms:?}");
    }
}

#[test]
fn test_missing_teacher_checkpoint_fails_before_building() {
    let cfg = DistillConfig {
        teacher_checkpoint: Some("/nonexistent/teacher/model-best.safetensors".into()),
        ..tiny_config(TrainModal::Base2Novel)
    };
    let tok = tiny_tokenizer(&TEN);
    let err = Distiller::build(cfg, optim(), DataConfig::default(), &classnames(&TEN), &tok, &backbones(), &Device::Cpu)
        .err()
        .unwrap();
    match err {
        DistillError::ModelNotFound { path } => assert!(path.ends_with("model-best.safetensors")),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_adaptive_temperature_is_optimized() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = DistillConfig { adaptive_temperature: true, ..tiny_config(TrainModal::Base2Novel) };
    let d = build(cfg, optim(), &TEN, dir.path()).unwrap();

    let group = d.student().params().group("temperature").unwrap();
    let temp_vars = group.all_vars();
    assert_eq!(temp_vars.len(), 4);
    let model = d.registry().get(MODEL_NAME).unwrap();
    for v in &temp_vars {
        assert!(model.params.is_trainable(v));
    }

    let losses = d.compute_loss(&batch(&[0, 1, 2, 3])).unwrap();
    let t = losses.temperature.value().unwrap();
    assert!((0.1..=10.0).contains(&t));
    let grads = losses.total.backward().unwrap();
    for v in &temp_vars {
        assert!(grads.get(v.as_tensor()).is_some(), "temperature weights receive gradients");
    }
}

fn max_diff(a: &Tensor, b: &Tensor) -> f32 {
    (a - b).unwrap().abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap()
}

#[test]
fn test_step_updates_only_trainable_groups() {
    let dir = tempfile::tempdir().unwrap();
    let mut d = build(tiny_config(TrainModal::Cross), optim(), &TEN, dir.path()).unwrap();
    let params = d.student().params().clone();
    let snapshot = |name: &str| params.group(name).unwrap().state_dict().unwrap();
    let clip_before = snapshot("clip");
    let vpt_before = snapshot("vpt");
    let translator_before = snapshot("translator");

    let summary = d.forward_backward(&batch(&[0, 1, 2, 3])).unwrap();
    assert!(summary.applied);
    assert!(summary.loss.is_finite());

    let clip_after = snapshot("clip");
    for (k, before) in &clip_before {
        assert_eq!(max_diff(before, &clip_after[k]), 0.0, "frozen {k} changed");
    }
    let translator_after = snapshot("translator");
    let w = "conv1.0.weight";
    assert!(max_diff(&translator_before[w], &translator_after[w]) > 0.0, "translator did not train");
    let vpt_after = snapshot("vpt");
    assert!(vpt_before.iter().any(|(k, v)| max_diff(v, &vpt_after[k]) > 0.0), "visual prompts did not train");
}

#[test]
fn test_amp_step_on_cpu() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = DistillConfig { precision: Precision::Amp, ..tiny_config(TrainModal::Cross) };
    let mut d = build(cfg, optim(), &TEN, dir.path()).unwrap();
    let summary = d.forward_backward(&batch(&[0, 1])).unwrap();
    assert!(summary.applied);
    assert_eq!(d.grad_scale(), Some(65_536.0), "one clean step neither grows nor backs off");
}

#[test]
fn test_fp16_step_and_evaluation() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = DistillConfig { precision: Precision::Fp16, ..tiny_config(TrainModal::Base2Novel) };
    let mut d = build(cfg, optim(), &TEN, dir.path()).unwrap();
    assert_eq!(d.grad_scale(), None, "fp16 runs without loss scaling");

    let summary = d.forward_backward(&batch(&[0, 1, 2, 3])).unwrap();
    assert!(summary.applied);
    assert!(summary.loss.is_finite(), "loss = {}", summary.loss);
    assert!(summary.loss_kd.is_finite());

    let acc = d.test(&tiny_dataset(10, 5), Split::Test).unwrap();
    assert!((0.0..=100.0).contains(&acc));
}

#[test]
fn test_epoch_order_is_reshuffled_and_seeded() {
    let dir = tempfile::tempdir().unwrap();
    let mut d = build(tiny_config(TrainModal::Cross), optim(), &TEN, dir.path()).unwrap();
    let first = d.epoch_order(32);
    let second = d.epoch_order(32);
    assert_ne!(first, second, "each epoch draws a new order");
    for order in [&first, &second] {
        let mut sorted = order.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..32).collect::<Vec<u32>>());
    }

    let mut again = build(tiny_config(TrainModal::Cross), optim(), &TEN, dir.path()).unwrap();
    assert_eq!(again.epoch_order(32), first, "same seed, same first epoch");

    let data = DataConfig { shuffle: false, ..data() };
    let mut fixed = build_with(tiny_config(TrainModal::Cross), optim(), data, &TEN, dir.path()).unwrap();
    assert_eq!(fixed.epoch_order(5), vec![0, 1, 2, 3, 4]);
}

#[test]
fn test_split_text_ranges() {
    let dir = tempfile::tempdir().unwrap();
    let d = build(tiny_config(TrainModal::Base2Novel), optim(), &TEN, dir.path()).unwrap();
    assert_eq!(d.text_range(Split::Val).unwrap(), 0..5);
    assert_eq!(d.text_range(Split::Test).unwrap(), 5..10);

    let dir = tempfile::tempdir().unwrap();
    let d = build(tiny_config(TrainModal::Cross), optim(), &TEN, dir.path()).unwrap();
    assert_eq!(d.text_range(Split::Test).unwrap(), 0..10);
}

#[test]
fn test_evaluation_returns_accuracy() {
    let dir = tempfile::tempdir().unwrap();
    let mut d = build(tiny_config(TrainModal::Base2Novel), optim(), &TEN, dir.path()).unwrap();
    let novel = tiny_dataset(10, 5);
    let acc = d.test(&novel, Split::Test).unwrap();
    assert!((0.0..=100.0).contains(&acc));
}

#[test]
fn test_train_saves_best_and_last() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("output");
    let mut d = build(tiny_config(TrainModal::Base2Novel), optim(), &TEN, dir.path()).unwrap();
    let train = tiny_dataset(6, 5);
    let val = tiny_dataset(5, 5);

    let stats = d.train(&train, Some(&val), &out).unwrap();
    assert_eq!(stats.total_steps, 4, "2 epochs of 2 batches");
    assert!(stats.final_loss.is_finite());
    assert!(stats.best_val.is_some());
    assert_eq!(d.epoch(), 2);
    assert!(out.join(MODEL_NAME).join("model-best.safetensors").exists());
    assert!(out.join(MODEL_NAME).join("model-ep2.safetensors").exists());
}

#[test]
fn test_save_and_load_model_restores_weights() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("output");
    let mut d = build(tiny_config(TrainModal::Cross), optim(), &TEN, dir.path()).unwrap();
    d.save_model(&out, 1, None, false).unwrap();

    let params = d.student().params().clone();
    let saved = params.state_dict(Some(ParamRole::Trainable)).unwrap();
    d.forward_backward(&batch(&[0, 1, 2])).unwrap();
    let stepped = params.state_dict(Some(ParamRole::Trainable)).unwrap();
    assert!(saved.iter().any(|(k, v)| max_diff(v, &stepped[k]) > 0.0), "the step changed nothing");

    d.load_model(&out, Some(1)).unwrap();
    let restored = params.state_dict(Some(ParamRole::Trainable)).unwrap();
    assert_eq!(restored.len(), saved.len());
    for (k, v) in &saved {
        assert_eq!(max_diff(v, &restored[k]), 0.0, "{k} not restored");
    }

    let err = d.load_model(&out, Some(7)).unwrap_err();
    assert!(matches!(err, DistillError::ModelNotFound { .. }));
}
