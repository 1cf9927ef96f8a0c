use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{HubError, HubResult};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const WEIGHTS_FILE: &str = "model.safetensors";
pub const TOKENIZER_FILE: &str = "tokenizer.json";

/// One cached file and its digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub filename: String,
    pub sha256: String,
    pub size_bytes: u64,
}

/// Provenance of a cached backbone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Display name, e.g. `ViT-B/16`.
    pub backbone: String,
    /// Directory name under the cache root.
    pub slug: String,
    pub repo_id: String,
    pub revision: String,
    pub files: Vec<ManifestFile>,
}

impl Manifest {
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size_bytes).sum()
    }

    pub fn has_file(&self, filename: &str) -> bool {
        self.files.iter().any(|f| f.filename == filename)
    }
}

/// On-disk backbone cache.
///
/// Layout: `<root>/<slug>/{model.safetensors, tokenizer.json, config.json, manifest.json}`
#[derive(Debug, Clone)]
pub struct BackboneCache {
    root: PathBuf,
}

impl BackboneCache {
    /// Create a cache rooted at `root`, creating the directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> HubResult<Self> {
        let root = expand_tilde(&root.into());
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// `~/.cache/promptkd`.
    pub fn default_cache() -> HubResult<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| HubError::InvalidCacheDir("Cannot determine home directory".to_string()))?;
        Self::new(home.join(".cache").join("promptkd"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn backbone_dir(&self, slug: &str) -> PathBuf {
        self.root.join(slug)
    }

    pub fn file_path(&self, slug: &str, filename: &str) -> PathBuf {
        self.backbone_dir(slug).join(filename)
    }

    pub fn manifest_path(&self, slug: &str) -> PathBuf {
        self.file_path(slug, MANIFEST_FILE)
    }

    /// True when a manifest exists and every file it lists is present.
    pub fn is_cached(&self, slug: &str) -> bool {
        match self.read_manifest(slug) {
            Ok(m) => m.files.iter().all(|f| self.file_path(slug, &f.filename).exists()),
            Err(_) => false,
        }
    }

    pub fn write_manifest(&self, manifest: &Manifest) -> HubResult<()> {
        let path = self.manifest_path(&manifest.slug);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, serde_json::to_string_pretty(manifest)?)?;
        debug!(path = %path.display(), "Wrote manifest");
        Ok(())
    }

    pub fn read_manifest(&self, slug: &str) -> HubResult<Manifest> {
        let path = self.manifest_path(slug);
        if !path.exists() {
            return Err(HubError::NotCached(slug.to_string()));
        }
        Ok(serde_json::from_str(&std::fs::read_to_string(&path)?)?)
    }

    /// Manifests of every cached backbone, sorted by slug.
    pub fn list_backbones(&self) -> HubResult<Vec<Manifest>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let slug = entry.file_name().to_string_lossy().to_string();
            if let Ok(m) = self.read_manifest(&slug) {
                out.push(m);
            }
        }
        out.sort_by(|a, b| a.slug.cmp(&b.slug));
        Ok(out)
    }

    /// Paths of the cached weights and tokenizer for `slug`.
    pub fn backbone_files(&self, slug: &str) -> HubResult<(PathBuf, PathBuf)> {
        let manifest = self.read_manifest(slug)?;
        let weights = self.file_path(slug, WEIGHTS_FILE);
        let tokenizer = self.file_path(slug, TOKENIZER_FILE);
        for (name, path) in [(WEIGHTS_FILE, &weights), (TOKENIZER_FILE, &tokenizer)] {
            if !manifest.has_file(name) || !path.exists() {
                return Err(HubError::NotCached(format!("{slug}/{name}")));
            }
        }
        Ok((weights, tokenizer))
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
