//! Core types, error definitions, and data structures for seg_dataset.

use std::path::PathBuf;
use thiserror::Error;

pub type DatasetResult<T> = Result<T, DatasetError>;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("csv error in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("malformed row {row} in {path}: {msg}")]
    Row {
        path: PathBuf,
        row: usize,
        msg: String,
    },
    #[error("image decode error at {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("unexpected shape for {path}: expected {expected:?}, got {actual:?}")]
    Shape {
        path: PathBuf,
        expected: (u32, u32),
        actual: (u32, u32),
    },
    #[error("{0}")]
    Other(String),
}

/// One CSV record: where to find an image and its mask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairIndex {
    /// Zero-based record number (header excluded).
    pub row: usize,
    pub image: PathBuf,
    pub mask: PathBuf,
}

/// A decoded (and possibly augmented) image/mask pair.
#[derive(Debug, Clone)]
pub struct SegmentationSample {
    pub row: usize,
    /// Image in CHW layout, raw `0..=255` scale (brightness jitter may leave that range).
    pub image_chw: Vec<f32>,
    /// Single-channel mask, raw pixel values (0/255 for binary, class index otherwise).
    pub mask: Vec<f32>,
    pub width: u32,
    pub height: u32,
}

impl SegmentationSample {
    pub fn pixels(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PairSummary {
    pub total: usize,
    pub ok: usize,
    pub missing_image: usize,
    pub missing_mask: usize,
    pub unreadable: usize,
    pub bad_shape: usize,
}

impl PairSummary {
    pub fn problems(&self) -> usize {
        self.missing_image + self.missing_mask + self.unreadable + self.bad_shape
    }
}
