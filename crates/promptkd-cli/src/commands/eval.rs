use std::path::PathBuf;

use anyhow::Context;
use tracing::info;

use promptkd_core::select_device;
use promptkd_distill::{DatasetDir, Split};

use super::{apply_common_overrides, build_distiller};
use crate::config::AppConfig;

#[derive(Debug)]
pub struct EvalArgs {
    pub dataset: PathBuf,
    pub model_dir: PathBuf,
    pub epoch: Option<usize>,
    pub split: String,
    pub teacher_checkpoint: Option<PathBuf>,
    pub modal: Option<String>,
    pub gpu: bool,
}

/// Load a saved student and score it on `<dataset>/<split>.safetensors`.
///
/// In base2novel the test split is scored against the novel classes.
pub async fn run(args: EvalArgs, mut config: AppConfig) -> anyhow::Result<()> {
    let split: Split = args.split.parse()?;
    if split == Split::Train {
        anyhow::bail!("Evaluation runs on the val or test split, not train");
    }

    let dataset = DatasetDir::new(&args.dataset);
    apply_common_overrides(&mut config, &dataset, args.modal.as_deref(), args.teacher_checkpoint.clone())?;
    let device = select_device(args.gpu || config.device.prefer_gpu, config.device.cuda_device_id)?;

    let data = dataset
        .split(&args.split, &device)?
        .with_context(|| format!("No {} split in {}", args.split, dataset.root().display()))?;

    let mut distiller = build_distiller(&dataset, &config, &device).await?;
    distiller
        .load_model(&args.model_dir, args.epoch)
        .with_context(|| format!("Failed to load student from {}", args.model_dir.display()))?;

    info!(dataset = %dataset.name(), %split, examples = data.len(), "Evaluating student");
    let accuracy = distiller.test(&data, split)?;

    println!("\n{} {} accuracy: {:.2}%", dataset.name(), split, accuracy);
    Ok(())
}
