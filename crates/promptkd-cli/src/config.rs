use std::path::PathBuf;

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use promptkd_distill::{DataConfig, DistillConfig, OptimConfig};

/// Full runtime configuration loaded from TOML + env vars.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub distill: DistillConfig,
    pub optim: OptimConfig,
    pub data: DataConfig,
    pub cache: CacheConfig,
    pub device: DeviceConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    pub cache_dir: String,
    /// Download missing backbones before training instead of failing.
    pub auto_pull: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { cache_dir: "~/.cache/promptkd".to_string(), auto_pull: true }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub prefer_gpu: bool,
    pub cuda_device_id: usize,
}

/// Load configuration from:
/// 1. Built-in defaults
/// 2. `config/default.toml` (if present)
/// 3. A custom config file path (if provided)
/// 4. Environment variables such as `PROMPTKD__DISTILL__KD_WEIGHT`
///
/// Enum-valued options are checked here, so a bad precision or modal fails
/// before anything is built.
pub fn load_config(config_file: Option<&PathBuf>) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder()
        .set_default("cache.cache_dir", "~/.cache/promptkd")?
        .set_default("device.prefer_gpu", false)?
        .set_default("device.cuda_device_id", 0_i64)?
        .add_source(File::with_name("config/default").required(false));

    if let Some(path) = config_file {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("PROMPTKD").separator("__").try_parsing(true));

    builder.build()?.try_deserialize()
}

/// Expand a leading `~/` to the home directory.
pub fn expand_cache_dir(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use promptkd_distill::{Precision, TrainModal};

    fn write(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("custom.toml");
        std::fs::write(&file, contents).unwrap();
        (dir, file)
    }

    #[test]
    fn test_defaults() {
        let cfg = load_config(None).unwrap();
        assert_eq!(cfg.distill.train_modal, TrainModal::Base2Novel);
        assert_eq!(cfg.distill.prompt.n_ctx_text, 4);
        assert_eq!(cfg.optim.max_epoch, 20);
        assert!(cfg.cache.cache_dir.contains("promptkd"));
        assert!(!cfg.device.prefer_gpu);
    }

    #[test]
    fn test_custom_file_overrides_defaults() {
        let (_dir, file) = write(
            "[distill]\nprecision = \"amp\"\ntrain_modal = \"cross\"\nkd_weight = 2.0\n\n\
             [distill.prompt]\nn_ctx_vision = 8\n\n[optim]\nname = \"adamw\"\nmax_epoch = 5\n",
        );
        let cfg = load_config(Some(&file)).unwrap();
        assert_eq!(cfg.distill.precision, Precision::Amp);
        assert_eq!(cfg.distill.train_modal, TrainModal::Cross);
        assert_eq!(cfg.distill.kd_weight, 2.0);
        assert_eq!(cfg.distill.prompt.n_ctx_vision, 8);
        assert_eq!(cfg.distill.prompt.n_ctx_text, 4);
        assert_eq!(cfg.optim.max_epoch, 5);
    }

    #[test]
    fn test_invalid_precision_fails_at_load() {
        let (_dir, file) = write("[distill]\nprecision = \"int4\"\n");
        assert!(load_config(Some(&file)).is_err());
    }

    #[test]
    fn test_expand_absolute_path_unchanged() {
        assert_eq!(expand_cache_dir("/absolute/cache"), PathBuf::from("/absolute/cache"));
    }

    #[test]
    fn test_expand_tilde() {
        let path = expand_cache_dir("~/.cache/promptkd");
        assert!(!path.to_string_lossy().starts_with('~'));
        assert!(path.ends_with(".cache/promptkd"));
    }

    #[test]
    fn test_missing_custom_file_is_an_error() {
        let missing = PathBuf::from("/nonexistent/promptkd.toml");
        assert!(load_config(Some(&missing)).is_err());
    }
}
