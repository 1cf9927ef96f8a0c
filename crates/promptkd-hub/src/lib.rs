//! # promptkd-hub
//!
//! CLIP backbone downloading and caching for PromptKD.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use promptkd_hub::{BackboneCache, BackboneDownloader, PullRequest};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cache = BackboneCache::default_cache()?;
//!     let downloader = BackboneDownloader::new(cache)?;
//!     let manifest = downloader
//!         .pull(&PullRequest {
//!             backbone: "ViT-B/16",
//!             slug: "vit-b-16",
//!             repo_id: "openai/clip-vit-base-patch16",
//!             revision: "main",
//!         })
//!         .await?;
//!     println!("Cached {} files", manifest.files.len());
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod download;
pub mod error;
pub mod integrity;

pub use cache::{BackboneCache, Manifest, ManifestFile};
pub use download::{BackboneDownloader, PullRequest};
pub use error::{HubError, HubResult};
pub use integrity::{sha256_file, verify_manifest};
