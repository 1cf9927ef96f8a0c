use hf_hub::api::tokio::{Api, ApiBuilder, ApiRepo};
use hf_hub::{Repo, RepoType};
use tracing::{debug, info, warn};

use crate::cache::{BackboneCache, Manifest, ManifestFile, TOKENIZER_FILE, WEIGHTS_FILE};
use crate::error::{HubError, HubResult};
use crate::integrity::sha256_file;

/// Files without which a backbone cannot be built.
const REQUIRED_FILES: &[&str] = &[WEIGHTS_FILE, TOKENIZER_FILE];
const OPTIONAL_FILES: &[&str] = &["config.json"];

/// What to fetch: a display name, its cache slug and the Hub repository.
#[derive(Debug, Clone)]
pub struct PullRequest<'a> {
    pub backbone: &'a str,
    pub slug: &'a str,
    pub repo_id: &'a str,
    pub revision: &'a str,
}

/// Fetches CLIP backbones from the Hugging Face Hub into a [`BackboneCache`].
pub struct BackboneDownloader {
    cache: BackboneCache,
    api: Api,
}

impl BackboneDownloader {
    /// Reads `HUGGING_FACE_HUB_TOKEN` from the environment if present.
    pub fn new(cache: BackboneCache) -> HubResult<Self> {
        let token = std::env::var("HUGGING_FACE_HUB_TOKEN").ok().filter(|t| !t.is_empty());
        let api = ApiBuilder::new()
            .with_progress(true)
            .with_token(token)
            .build()
            .map_err(|e| HubError::DownloadFailed { file: "<api init>".into(), reason: e.to_string() })?;
        Ok(Self { cache, api })
    }

    pub fn cache(&self) -> &BackboneCache {
        &self.cache
    }

    /// Download the weights, tokenizer and config, copy them into the cache
    /// and write the manifest. An already cached backbone is returned as is.
    pub async fn pull(&self, req: &PullRequest<'_>) -> HubResult<Manifest> {
        if self.cache.is_cached(req.slug) {
            let manifest = self.cache.read_manifest(req.slug)?;
            if manifest.revision == req.revision {
                info!(backbone = req.backbone, "Already cached");
                return Ok(manifest);
            }
        }

        info!(backbone = req.backbone, repo_id = req.repo_id, revision = req.revision, "Pulling backbone");
        let repo = self.api.repo(Repo::with_revision(req.repo_id.to_string(), RepoType::Model, req.revision.to_string()));

        let mut files = Vec::new();
        for &name in REQUIRED_FILES {
            files.push(self.fetch(&repo, req.slug, name).await?);
        }
        for &name in OPTIONAL_FILES {
            match self.fetch(&repo, req.slug, name).await {
                Ok(f) => files.push(f),
                Err(e) => warn!(filename = name, error = %e, "Optional file not available, skipping"),
            }
        }

        let manifest = Manifest {
            backbone: req.backbone.to_string(),
            slug: req.slug.to_string(),
            repo_id: req.repo_id.to_string(),
            revision: req.revision.to_string(),
            files,
        };
        self.cache.write_manifest(&manifest)?;
        info!(backbone = req.backbone, bytes = manifest.total_bytes(), "Backbone cached");
        Ok(manifest)
    }

    async fn fetch(&self, repo: &ApiRepo, slug: &str, filename: &str) -> HubResult<ManifestFile> {
        let src = repo.get(filename).await.map_err(|e| HubError::DownloadFailed {
            file: filename.to_string(),
            reason: format!("{e}{}", auth_hint(&e.to_string())),
        })?;
        let dest = self.cache.file_path(slug, filename);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = dest.with_file_name(format!("{filename}.tmp"));
        std::fs::copy(&src, &tmp)?;
        std::fs::rename(&tmp, &dest)?;

        let sha256 = sha256_file(&dest)?;
        let size_bytes = std::fs::metadata(&dest)?.len();
        debug!(filename, size_bytes, sha256 = %sha256, "Cached file");
        Ok(ManifestFile { filename: filename.to_string(), sha256, size_bytes })
    }
}

fn auth_hint(msg: &str) -> &'static str {
    if msg.contains("401") || msg.contains("403") {
        " (hint: set HUGGING_FACE_HUB_TOKEN for gated repos)"
    } else {
        ""
    }
}
