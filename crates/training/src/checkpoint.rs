//! Checkpoint directory layout:
//!
//! ```text
//! <ckdir>/model.bin       U-Net parameters (BinFileRecorder, full precision)
//! <ckdir>/optimizer.bin   Adam moments
//! <ckdir>/state.json      global step, epochs completed, geometry, UNetConfig
//! ```
//!
//! A directory is only considered a checkpoint when both `model.bin` and
//! `state.json` exist; anything else is treated as a fresh start.

use burn::module::Module;
use burn::optim::Optimizer;
use burn::record::{BinFileRecorder, FullPrecisionSettings, Recorder};
use burn::tensor::backend::{AutodiffBackend, Backend};
use models::{UNet, UNetConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

const MODEL_STEM: &str = "model";
const OPTIMIZER_STEM: &str = "optimizer";
const RECORD_EXT: &str = "bin";
const STATE_FILE: &str = "state.json";
/// Suffix of files staged by `save` before they are renamed into place.
const PARTIAL_SUFFIX: &str = "-partial";

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid checkpoint state {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to {action} record {path}: {msg}")]
    Record {
        action: &'static str,
        path: PathBuf,
        msg: String,
    },
    #[error("no checkpoint found in {0}")]
    Missing(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    pub global_step: u64,
    pub epochs_completed: usize,
    pub height: u32,
    pub width: u32,
    pub model: UNetConfig,
}

impl TrainingState {
    pub fn new(model: UNetConfig, height: u32, width: u32) -> Self {
        Self {
            global_step: 0,
            epochs_completed: 0,
            height,
            width,
            model,
        }
    }
}

fn recorder() -> BinFileRecorder<FullPrecisionSettings> {
    BinFileRecorder::<FullPrecisionSettings>::new()
}

#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn model_path(&self) -> PathBuf {
        self.dir.join(MODEL_STEM).with_extension(RECORD_EXT)
    }

    pub fn optimizer_path(&self) -> PathBuf {
        self.dir.join(OPTIMIZER_STEM).with_extension(RECORD_EXT)
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    pub fn exists(&self) -> bool {
        self.model_path().is_file() && self.state_path().is_file()
    }

    /// Returns the saved state when a checkpoint exists; otherwise makes sure the directory exists.
    pub fn prepare(&self) -> Result<Option<TrainingState>, CheckpointError> {
        if self.exists() {
            return self.read_state().map(Some);
        }
        if self.model_path().is_file() {
            tracing::warn!(
                "{} has weights but no {STATE_FILE}; starting fresh",
                self.dir.display()
            );
        }
        fs::create_dir_all(&self.dir).map_err(|e| CheckpointError::Io {
            path: self.dir.clone(),
            source: e,
        })?;
        Ok(None)
    }

    pub fn read_state(&self) -> Result<TrainingState, CheckpointError> {
        let path = self.state_path();
        if !path.is_file() {
            return Err(CheckpointError::Missing(self.dir.clone()));
        }
        let raw = fs::read(&path).map_err(|e| CheckpointError::Io {
            path: path.clone(),
            source: e,
        })?;
        serde_json::from_slice(&raw).map_err(|e| CheckpointError::Json { path, source: e })
    }

    fn write_state_to(&self, path: &Path, state: &TrainingState) -> Result<(), CheckpointError> {
        let json = serde_json::to_vec_pretty(state).map_err(|e| CheckpointError::Json {
            path: path.to_path_buf(),
            source: e,
        })?;
        fs::write(path, json).map_err(|e| CheckpointError::Io {
            path: path.to_path_buf(),
            source: e,
        })
    }

    fn staged(&self, stem: &str) -> PathBuf {
        self.dir.join(format!("{stem}{PARTIAL_SUFFIX}"))
    }

    fn promote(&self, from: PathBuf, to: PathBuf) -> Result<(), CheckpointError> {
        fs::rename(&from, &to).map_err(|e| CheckpointError::Io { path: to, source: e })
    }

    /// Persist model, optimizer and state.
    ///
    /// All three are written under staging names first and only renamed over
    /// the previous checkpoint once every write succeeded; `state.json` goes last.
    pub fn save<B, O>(
        &self,
        model: &UNet<B>,
        optim: &O,
        state: &TrainingState,
    ) -> Result<(), CheckpointError>
    where
        B: AutodiffBackend,
        O: Optimizer<UNet<B>, B>,
    {
        fs::create_dir_all(&self.dir).map_err(|e| CheckpointError::Io {
            path: self.dir.clone(),
            source: e,
        })?;
        let model_stage = self.staged(MODEL_STEM);
        let optim_stage = self.staged(OPTIMIZER_STEM);
        let state_stage = self.staged(STATE_FILE);

        model
            .clone()
            .save_file(&model_stage, &recorder())
            .map_err(|e| CheckpointError::Record {
                action: "save",
                path: self.model_path(),
                msg: e.to_string(),
            })?;
        Recorder::<B>::record(&recorder(), optim.to_record(), optim_stage.clone()).map_err(
            |e| CheckpointError::Record {
                action: "save",
                path: self.optimizer_path(),
                msg: e.to_string(),
            },
        )?;
        self.write_state_to(&state_stage, state)?;

        self.promote(model_stage.with_extension(RECORD_EXT), self.model_path())?;
        self.promote(optim_stage.with_extension(RECORD_EXT), self.optimizer_path())?;
        self.promote(state_stage, self.state_path())
    }

    /// Rebuild a U-Net from `cfg` and load saved parameters into it.
    pub fn load_model<B: Backend>(
        &self,
        cfg: UNetConfig,
        device: &B::Device,
    ) -> Result<UNet<B>, CheckpointError> {
        UNet::<B>::new(cfg, device)
            .load_file(self.dir.join(MODEL_STEM), &recorder(), device)
            .map_err(|e| CheckpointError::Record {
                action: "load",
                path: self.model_path(),
                msg: e.to_string(),
            })
    }

    /// Restore Adam moments; a missing optimizer file keeps `optim` as is.
    pub fn load_optimizer<B, O>(&self, optim: O, device: &B::Device) -> Result<O, CheckpointError>
    where
        B: AutodiffBackend,
        O: Optimizer<UNet<B>, B>,
    {
        if !self.optimizer_path().is_file() {
            tracing::warn!(
                "no optimizer state in {}; Adam moments start from zero",
                self.dir.display()
            );
            return Ok(optim);
        }
        let record = Recorder::<B>::load(&recorder(), self.dir.join(OPTIMIZER_STEM), device)
            .map_err(|e| CheckpointError::Record {
                action: "load",
                path: self.optimizer_path(),
                msg: e.to_string(),
            })?;
        Ok(optim.load_record(record))
    }
}

/// Load model + state for inference from a checkpoint directory.
pub fn load_unet_from_checkpoint<B: Backend>(
    dir: &Path,
    device: &B::Device,
) -> Result<(UNet<B>, TrainingState), CheckpointError> {
    let manager = CheckpointManager::new(dir);
    if !manager.exists() {
        return Err(CheckpointError::Missing(dir.to_path_buf()));
    }
    let state = manager.read_state()?;
    let model = manager.load_model::<B>(state.model, device)?;
    Ok((model, state))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_directory_is_prepared_not_restored() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("nested/models");
        let manager = CheckpointManager::new(&dir);
        assert!(manager.prepare().unwrap().is_none());
        assert!(dir.is_dir());
        assert!(!manager.exists());
    }

    #[test]
    fn state_round_trips_through_json() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(tmp.path());
        let mut state = TrainingState::new(UNetConfig::default().with_classes(5), 64, 32);
        state.global_step = 42;
        state.epochs_completed = 3;
        manager.write_state_to(&manager.state_path(), &state).unwrap();
        assert_eq!(manager.read_state().unwrap(), state);
    }

    #[test]
    fn staged_state_is_renamed_into_place() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(tmp.path());
        let mut state = TrainingState::new(UNetConfig::default(), 16, 16);
        let stage = manager.staged(STATE_FILE);
        manager.write_state_to(&stage, &state).unwrap();
        // A staged file alone is not a checkpoint.
        assert!(manager.read_state().is_err());

        manager.promote(stage.clone(), manager.state_path()).unwrap();
        assert!(!stage.exists());
        assert_eq!(manager.read_state().unwrap(), state);

        state.global_step = 9;
        let stage = manager.staged(STATE_FILE);
        manager.write_state_to(&stage, &state).unwrap();
        manager.promote(stage, manager.state_path()).unwrap();
        assert_eq!(manager.read_state().unwrap().global_step, 9);
    }

    #[test]
    fn weights_without_state_do_not_count() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(tmp.path());
        fs::write(manager.model_path(), b"junk").unwrap();
        assert!(!manager.exists());
        assert!(manager.prepare().unwrap().is_none());
        assert!(matches!(
            load_unet_from_checkpoint::<burn_ndarray::NdArray<f32>>(tmp.path(), &Default::default()),
            Err(CheckpointError::Missing(_))
        ));
    }
}
