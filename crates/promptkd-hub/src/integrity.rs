use std::path::Path;

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::cache::{BackboneCache, Manifest};
use crate::error::{HubError, HubResult};

/// SHA-256 hex digest of a file on disk.
pub fn sha256_file(path: &Path) -> HubResult<String> {
    let data = std::fs::read(path)?;
    Ok(hex::encode(Sha256::digest(&data)))
}

/// Compare `path` against an expected hex digest, case-insensitively.
pub fn verify_integrity(path: &Path, expected_sha256: &str) -> HubResult<()> {
    let actual = sha256_file(path)?;
    debug!(path = %path.display(), expected = expected_sha256, actual = %actual, "Verifying file integrity");
    if actual.eq_ignore_ascii_case(expected_sha256) {
        Ok(())
    } else {
        Err(HubError::IntegrityMismatch {
            file: path.to_string_lossy().to_string(),
            expected: expected_sha256.to_string(),
            actual,
        })
    }
}

/// Re-hash every file listed in `manifest`.
///
/// A listed file that is missing from the cache is [`HubError::NotCached`].
pub fn verify_manifest(cache: &BackboneCache, manifest: &Manifest) -> HubResult<()> {
    for entry in &manifest.files {
        let path = cache.file_path(&manifest.slug, &entry.filename);
        if !path.exists() {
            return Err(HubError::NotCached(format!("{}/{}", manifest.slug, entry.filename)));
        }
        verify_integrity(&path, &entry.sha256)?;
    }
    info!(backbone = %manifest.backbone, files = manifest.files.len(), "Cache verified");
    Ok(())
}
