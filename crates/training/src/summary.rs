//! JSON-lines run summaries: scalars, histograms and image snapshots per step.
//!
//! Each writer owns one run directory (`<logdir>/<train|test>/<stamp>/`) holding
//! `events.jsonl` and an `images/` folder for PNG snapshots.

use image::GrayImage;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

pub const EVENTS_FILE: &str = "events.jsonl";

#[derive(Debug, Error)]
pub enum SummaryError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode summary event: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to write image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// Seconds since the unix epoch; names one training run.
pub fn run_stamp() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
        .to_string()
}

fn wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Histogram {
    pub min: f32,
    pub max: f32,
    pub mean: f32,
    pub std: f32,
    pub count: usize,
    /// Upper edge of each bucket; `counts[i]` values fall at or below `edges[i]`.
    pub edges: Vec<f32>,
    pub counts: Vec<usize>,
}

impl Histogram {
    pub fn from_values(values: &[f32], buckets: usize) -> Self {
        let buckets = buckets.max(1);
        let finite: Vec<f32> = values.iter().copied().filter(|v| v.is_finite()).collect();
        if finite.is_empty() {
            return Self {
                min: 0.0,
                max: 0.0,
                mean: 0.0,
                std: 0.0,
                count: 0,
                edges: Vec::new(),
                counts: Vec::new(),
            };
        }
        let min = finite.iter().copied().fold(f32::INFINITY, f32::min);
        let max = finite.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let n = finite.len() as f64;
        let mean = finite.iter().map(|v| *v as f64).sum::<f64>() / n;
        let var = finite.iter().map(|v| (*v as f64 - mean).powi(2)).sum::<f64>() / n;

        let width = (max - min) / buckets as f32;
        let edges: Vec<f32> = (1..=buckets).map(|i| min + width * i as f32).collect();
        let mut counts = vec![0usize; buckets];
        for v in &finite {
            let idx = if width > 0.0 {
                (((v - min) / width) as usize).min(buckets - 1)
            } else {
                buckets - 1
            };
            counts[idx] += 1;
        }
        Self {
            min,
            max,
            mean: mean as f32,
            std: var.sqrt() as f32,
            count: finite.len(),
            edges,
            counts,
        }
    }
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Event<'a> {
    Scalar {
        wall_time: f64,
        step: u64,
        tag: &'a str,
        value: f32,
    },
    Histogram {
        wall_time: f64,
        step: u64,
        tag: &'a str,
        #[serde(flatten)]
        histogram: &'a Histogram,
    },
    Image {
        wall_time: f64,
        step: u64,
        tag: &'a str,
        path: &'a str,
        width: u32,
        height: u32,
    },
}

pub struct SummaryWriter {
    dir: PathBuf,
    events: BufWriter<File>,
}

impl SummaryWriter {
    pub fn create(dir: impl Into<PathBuf>) -> Result<Self, SummaryError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| SummaryError::Io {
            path: dir.clone(),
            source: e,
        })?;
        let path = dir.join(EVENTS_FILE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| SummaryError::Io { path, source: e })?;
        Ok(Self {
            dir,
            events: BufWriter::new(file),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write_event(&mut self, event: &Event<'_>) -> Result<(), SummaryError> {
        serde_json::to_writer(&mut self.events, event)?;
        writeln!(self.events).map_err(|e| SummaryError::Io {
            path: self.dir.join(EVENTS_FILE),
            source: e,
        })
    }

    pub fn add_scalar(&mut self, tag: &str, value: f32, step: u64) -> Result<(), SummaryError> {
        self.write_event(&Event::Scalar {
            wall_time: wall_time(),
            step,
            tag,
            value,
        })
    }

    pub fn add_histogram(
        &mut self,
        tag: &str,
        values: &[f32],
        step: u64,
    ) -> Result<(), SummaryError> {
        let histogram = Histogram::from_values(values, 30);
        self.write_event(&Event::Histogram {
            wall_time: wall_time(),
            step,
            tag,
            histogram: &histogram,
        })
    }

    /// Save `image` under `images/` and record where it went.
    pub fn add_image(&mut self, tag: &str, image: &GrayImage, step: u64) -> Result<(), SummaryError> {
        let images_dir = self.dir.join("images");
        fs::create_dir_all(&images_dir).map_err(|e| SummaryError::Io {
            path: images_dir.clone(),
            source: e,
        })?;
        let slug: String = tag
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
            .collect();
        let file_name = format!("{slug}_{step:08}.png");
        let path = images_dir.join(&file_name);
        image.save(&path).map_err(|e| SummaryError::Image {
            path: path.clone(),
            source: e,
        })?;
        let relative = format!("images/{file_name}");
        self.write_event(&Event::Image {
            wall_time: wall_time(),
            step,
            tag,
            path: &relative,
            width: image.width(),
            height: image.height(),
        })
    }

    pub fn flush(&mut self) -> Result<(), SummaryError> {
        self.events.flush().map_err(|e| SummaryError::Io {
            path: self.dir.join(EVENTS_FILE),
            source: e,
        })
    }
}

impl Drop for SummaryWriter {
    fn drop(&mut self) {
        let _ = self.events.flush();
    }
}
