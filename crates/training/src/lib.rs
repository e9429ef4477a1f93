#![recursion_limit = "256"]
//! U-Net training against an IOU objective: loss, train/eval loops,
//! checkpoints, run summaries and mask prediction.

pub mod checkpoint;
pub mod config;
pub mod loss;
pub mod predict;
pub mod summary;
pub mod util;

pub use checkpoint::{load_unet_from_checkpoint, CheckpointError, CheckpointManager, TrainingState};
pub use config::TrainConfigFile;
pub use loss::{iou_loss, per_class_iou, soft_iou, sparse_iou};
pub use models::{UNet, UNetConfig};
pub use predict::{predict_mask, prediction_to_masks};
pub use summary::SummaryWriter;
pub use util::{evaluate, run_train, train, train_step, TrainArgs, TrainSettings};

/// Backend alias for training/eval (NdArray by default; WGPU if enabled).
#[cfg(feature = "backend-wgpu")]
pub type TrainBackend = burn_wgpu::Wgpu<f32>;
#[cfg(not(feature = "backend-wgpu"))]
pub type TrainBackend = burn_ndarray::NdArray<f32>;
