pub mod eval;
pub mod list;
pub mod pull;
pub mod train;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use candle_core::Device;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use promptkd_core::{BackboneSpec, ClipTokenizer};
use promptkd_distill::{Backbones, DatasetDir, Distiller, TrainModal};
use promptkd_hub::{BackboneCache, BackboneDownloader, PullRequest};

use crate::config::{expand_cache_dir, AppConfig};

/// A backbone spec with its cached weights and tokenizer.
pub(crate) struct ResolvedBackbone {
    pub spec: BackboneSpec,
    pub weights: PathBuf,
    pub tokenizer: PathBuf,
}

/// Find `name` in the cache, pulling it first when `cache.auto_pull` is set.
pub(crate) async fn resolve_backbone(name: &str, config: &AppConfig) -> anyhow::Result<ResolvedBackbone> {
    let spec = BackboneSpec::from_name(name)?;
    let slug = spec.slug();
    let cache = BackboneCache::new(expand_cache_dir(&config.cache.cache_dir))?;

    if !cache.is_cached(&slug) {
        if !config.cache.auto_pull {
            bail!("Backbone '{name}' is not cached. Run `promptkd pull {name}` first.");
        }
        info!(backbone = name, repo_id = %spec.hf_repo, "Backbone not cached, downloading");
        let downloader = BackboneDownloader::new(cache.clone())?;
        downloader
            .pull(&PullRequest { backbone: name, slug: &slug, repo_id: &spec.hf_repo, revision: "main" })
            .await?;
    }

    let (weights, tokenizer) = cache.backbone_files(&slug)?;
    Ok(ResolvedBackbone { spec, weights, tokenizer })
}

/// Apply the `--modal` and `--teacher-checkpoint` overrides shared by `train` and `eval`.
pub(crate) fn apply_common_overrides(
    config: &mut AppConfig,
    dataset: &DatasetDir,
    modal: Option<&str>,
    teacher_checkpoint: Option<PathBuf>,
) -> anyhow::Result<()> {
    if let Some(m) = modal {
        config.distill.train_modal = m.parse::<TrainModal>()?;
    }
    if teacher_checkpoint.is_some() {
        config.distill.teacher_checkpoint = teacher_checkpoint;
    }
    // The base2novel teacher lives under the dataset's directory name.
    config.distill.dataset_name = dataset.name();
    Ok(())
}

/// Resolve both backbones, read the class names and build the trainer.
pub(crate) async fn build_distiller(
    dataset: &DatasetDir,
    config: &AppConfig,
    device: &Device,
) -> anyhow::Result<Distiller> {
    let classnames = dataset
        .classnames()
        .with_context(|| format!("Failed to read class names from {}", dataset.root().display()))?;

    let teacher = resolve_backbone(&config.distill.teacher_backbone, config).await?;
    let student = resolve_backbone(&config.distill.student_backbone, config).await?;
    // Both towers share the CLIP BPE vocabulary.
    let tokenizer = ClipTokenizer::from_file(&teacher.tokenizer, teacher.spec.context_length)?;

    let backbones = Backbones {
        teacher: teacher.spec,
        student: student.spec,
        teacher_weights: vec![teacher.weights],
        student_weights: vec![student.weights],
    };

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::with_template("{spinner:.cyan} {msg}").unwrap_or_else(|_| ProgressStyle::default_spinner()));
    spinner.enable_steady_tick(Duration::from_millis(120));
    spinner.set_message(format!(
        "Loading teacher {} and student {} ({} classes)",
        backbones.teacher.name,
        backbones.student.name,
        classnames.len()
    ));

    let distiller = Distiller::build(
        config.distill.clone(),
        config.optim.clone(),
        config.data.clone(),
        &classnames,
        &tokenizer,
        &backbones,
        device,
    );
    spinner.finish_and_clear();
    Ok(distiller?)
}
