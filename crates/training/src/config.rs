//! Optional TOML config for `train`; command-line flags take precedence.
//!
//! ```toml
//! data_root = "../data/data_256_subsample_4x/"
//! train = "./train.csv"
//! test = "./test.csv"
//! epochs = 8
//! learning_rate = 0.001
//! batch_size = 16
//! channels = 5
//! height = 256
//! width = 256
//! backend = "ndarray"
//!
//! [adam]
//! beta1 = 0.9
//!
//! [model]
//! base_filters = 8
//! depth = 4
//! ```

use cli_support::BackendKind;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_CONFIG_NAME: &str = "unet-train.toml";
pub const CONFIG_ENV: &str = "UNET_TRAIN_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file {0} does not exist")]
    NotFound(PathBuf),
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainConfigFile {
    pub data_root: Option<String>,
    pub train: Option<PathBuf>,
    pub test: Option<PathBuf>,
    pub epochs: Option<usize>,
    pub learning_rate: Option<f64>,
    pub batch_size: Option<usize>,
    pub channels: Option<usize>,
    pub height: Option<u32>,
    pub width: Option<u32>,
    pub logdir: Option<PathBuf>,
    pub ckdir: Option<PathBuf>,
    pub seed: Option<u64>,
    pub summary_every: Option<usize>,
    pub augment: Option<bool>,
    pub permissive: Option<bool>,
    pub backend: Option<BackendKind>,
    #[serde(default)]
    pub adam: AdamSection,
    #[serde(default)]
    pub model: ModelSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdamSection {
    pub beta1: Option<f32>,
    pub beta2: Option<f32>,
    pub epsilon: Option<f32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelSection {
    pub base_filters: Option<usize>,
    pub depth: Option<usize>,
}

impl TrainConfigFile {
    /// Explicit path, then `$UNET_TRAIN_CONFIG`, then `./unet-train.toml` if present.
    ///
    /// Named files must exist; the implicit default is skipped when absent.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::from_path(path);
        }
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            if !path.trim().is_empty() {
                return Self::from_path(Path::new(&path));
            }
        }
        let default = Path::new(DEFAULT_CONFIG_NAME);
        if default.is_file() {
            return Self::from_path(default);
        }
        Ok(Self::default())
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        if !path.is_file() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&raw).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn from_toml(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sections() {
        let cfg = TrainConfigFile::from_toml(
            "epochs = 2\nheight = 64\n[adam]\nbeta1 = 0.8\n[model]\ndepth = 3\n",
        )
        .unwrap();
        assert_eq!(cfg.epochs, Some(2));
        assert_eq!(cfg.height, Some(64));
        assert_eq!(cfg.adam.beta1, Some(0.8));
        assert_eq!(cfg.model.depth, Some(3));
        assert_eq!(cfg.batch_size, None);
    }

    #[test]
    fn backend_uses_command_line_names() {
        let cfg = TrainConfigFile::from_toml("backend = \"wgpu\"\n").unwrap();
        assert_eq!(cfg.backend, Some(BackendKind::Wgpu));
        let cfg = TrainConfigFile::from_toml("backend = \"ndarray\"\n").unwrap();
        assert_eq!(cfg.backend, Some(BackendKind::NdArray));
        assert!(TrainConfigFile::from_toml("backend = \"cuda\"\n").is_err());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(TrainConfigFile::from_toml("epoch = 2\n").is_err());
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let err = TrainConfigFile::load(Some(Path::new("/no/such/unet.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }
}
