//! Image/mask pair loading, augmentation, and Burn-compatible batching.
//!
//! This crate provides utilities for:
//! - Reading `image,mask` CSV listings (header skipped, paths prefixed by a data root)
//! - Decoding RGB images and single-channel masks
//! - Joint image/mask augmentation (flips, brightness, hue)
//! - Shuffled, parallel batch iteration into Burn tensors

pub mod aug;
pub mod pairs;
pub mod types;

#[cfg(feature = "burn-runtime")]
pub mod batch;

pub use aug::{DatasetConfig, TransformPipeline, TransformPipelineBuilder};
pub use pairs::{
    count_records, load_rgb, load_sample, read_pair_csv, rgb_to_chw, summarize_pairs,
};
pub use types::*;

#[cfg(feature = "burn-runtime")]
pub use batch::{build_train_test_iters, BatchIter, BatchStats, SegmentationBatch};
