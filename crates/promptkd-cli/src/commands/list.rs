use promptkd_hub::BackboneCache;

use crate::config::{expand_cache_dir, AppConfig};

/// List all backbones stored in the local cache.
pub fn run(config: &AppConfig) -> anyhow::Result<()> {
    let cache_dir = expand_cache_dir(&config.cache.cache_dir);
    let cache = BackboneCache::new(&cache_dir)?;

    let backbones = cache.list_backbones()?;

    if backbones.is_empty() {
        println!("No backbones cached in {}.", cache_dir.display());
        println!("Use `promptkd pull <backbone>` to download one, e.g. `promptkd pull ViT-B/16`.");
        return Ok(());
    }

    println!("{:<12} {:<36} {:<12} {:>10}", "BACKBONE", "REPO", "REVISION", "SIZE (MB)");
    println!("{}", "-".repeat(74));
    for m in &backbones {
        println!(
            "{:<12} {:<36} {:<12} {:>10.1}",
            m.backbone,
            m.repo_id,
            m.revision,
            m.total_bytes() as f64 / 1_048_576.0
        );
    }
    println!("\n{} backbone(s) cached in {}", backbones.len(), cache_dir.display());

    Ok(())
}
