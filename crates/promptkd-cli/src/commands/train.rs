use std::path::PathBuf;

use anyhow::Context;
use tracing::info;

use promptkd_core::select_device;
use promptkd_distill::{DatasetDir, Precision};

use super::{apply_common_overrides, build_distiller};
use crate::config::AppConfig;

#[derive(Debug)]
pub struct TrainArgs {
    pub dataset: PathBuf,
    pub output: PathBuf,
    pub teacher_checkpoint: Option<PathBuf>,
    pub init_weights: Option<PathBuf>,
    pub epochs: Option<usize>,
    pub batch_size: Option<usize>,
    pub learning_rate: Option<f64>,
    pub precision: Option<String>,
    pub modal: Option<String>,
    pub gpu: bool,
}

/// Apply command-line overrides on top of the loaded configuration.
fn apply_overrides(config: &mut AppConfig, args: &TrainArgs, dataset: &DatasetDir) -> anyhow::Result<()> {
    apply_common_overrides(config, dataset, args.modal.as_deref(), args.teacher_checkpoint.clone())?;
    if let Some(p) = &args.precision {
        config.distill.precision = p.parse::<Precision>()?;
    }
    if args.init_weights.is_some() {
        config.distill.init_weights = args.init_weights.clone();
    }
    if let Some(e) = args.epochs {
        config.optim.max_epoch = e;
    }
    if let Some(bs) = args.batch_size {
        config.data.batch_size = bs;
    }
    if let Some(lr) = args.learning_rate {
        config.optim.lr = lr;
    }
    Ok(())
}

/// Train a student on `<dataset>/train.safetensors`, validating on
/// `<dataset>/val.safetensors` when present.
pub async fn run(args: TrainArgs, mut config: AppConfig) -> anyhow::Result<()> {
    let dataset = DatasetDir::new(&args.dataset);
    apply_overrides(&mut config, &args, &dataset)?;

    let device = select_device(args.gpu || config.device.prefer_gpu, config.device.cuda_device_id)?;

    info!(
        dataset = %dataset.name(),
        modal = %config.distill.train_modal,
        precision = %config.distill.precision,
        epochs = config.optim.max_epoch,
        output = %args.output.display(),
        "Starting PromptKD training"
    );

    let train = dataset
        .split("train", &device)?
        .with_context(|| format!("No train split in {}", dataset.root().display()))?;
    let val = dataset.split("val", &device)?;

    let mut distiller = build_distiller(&dataset, &config, &device).await?;
    let stats = distiller.train(&train, val.as_ref(), &args.output)?;

    println!("\nTraining complete in {:.1}s", stats.elapsed_secs);
    println!("  steps:      {}", stats.total_steps);
    println!("  final loss: {:.4}", stats.final_loss);
    if let Some(best) = stats.best_val {
        println!("  best val:   {best:.2}");
    }
    println!("  output:     {}", args.output.display());

    Ok(())
}
