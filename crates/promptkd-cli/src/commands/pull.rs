use tracing::info;

use promptkd_core::BackboneSpec;
use promptkd_hub::{BackboneCache, BackboneDownloader, PullRequest};

use crate::config::{expand_cache_dir, AppConfig};

/// Download a CLIP backbone's weights and tokenizer into the local cache.
pub async fn run(backbone: &str, revision: &str, config: &AppConfig) -> anyhow::Result<()> {
    let spec = BackboneSpec::from_name(backbone)?;
    let slug = spec.slug();
    let cache_dir = expand_cache_dir(&config.cache.cache_dir);

    info!(backbone, repo_id = %spec.hf_repo, revision, cache_dir = %cache_dir.display(), "Pulling backbone");

    let cache = BackboneCache::new(&cache_dir)?;
    let downloader = BackboneDownloader::new(cache)?;
    let manifest = downloader
        .pull(&PullRequest { backbone, slug: &slug, repo_id: &spec.hf_repo, revision })
        .await?;

    println!("\nBackbone '{}' cached to {}", backbone, downloader.cache().backbone_dir(&slug).display());
    println!("{} file(s), {:.1} MB:", manifest.files.len(), manifest.total_bytes() as f64 / 1_048_576.0);
    for f in &manifest.files {
        println!("  {:<24} {}", f.filename, f.sha256);
    }

    Ok(())
}
