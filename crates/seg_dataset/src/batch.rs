//! Batch iteration for training and evaluation.

use crate::aug::{DatasetConfig, TransformPipeline};
use crate::pairs::{load_sample, read_pair_csv};
use crate::types::{DatasetError, DatasetResult, PairIndex};
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use std::path::Path;
use std::time::{Duration, Instant};

/// Build the shuffled/augmented train iterator and the plain test iterator.
pub fn build_train_test_iters(
    train_csv: &Path,
    test_csv: &Path,
    data_root: &str,
    train_cfg: DatasetConfig,
) -> DatasetResult<(BatchIter, BatchIter)> {
    let test_cfg = train_cfg.eval();
    let train_iter = BatchIter::from_indices(read_pair_csv(train_csv, data_root)?, train_cfg)?;
    let test_iter = BatchIter::from_indices(read_pair_csv(test_csv, data_root)?, test_cfg)?;
    Ok((train_iter, test_iter))
}

#[derive(Debug, Clone)]
pub struct SegmentationBatch<B: Backend> {
    /// `[N, 3, H, W]`, raw pixel scale.
    pub images: Tensor<B, 4>,
    /// `[N, 1, H, W]`, raw mask values.
    pub masks: Tensor<B, 4>,
    /// CSV record numbers of the samples, in batch order.
    pub rows: Vec<usize>,
}

impl<B: Backend> SegmentationBatch<B> {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BatchStats {
    pub batches: usize,
    pub samples: usize,
    pub skipped_errors: usize,
    pub load_time: Duration,
}

pub struct BatchIter {
    indices: Vec<PairIndex>,
    cursor: usize,
    epoch: usize,
    cfg: DatasetConfig,
    pipeline: TransformPipeline,
    stats: BatchStats,
    started: Instant,
    last_logged_samples: usize,
}

impl BatchIter {
    pub fn from_csv(csv_path: &Path, data_root: &str, cfg: DatasetConfig) -> DatasetResult<Self> {
        Self::from_indices(read_pair_csv(csv_path, data_root)?, cfg)
    }

    pub fn from_indices(indices: Vec<PairIndex>, cfg: DatasetConfig) -> DatasetResult<Self> {
        let pipeline = cfg.pipeline();
        tracing::debug!(samples = indices.len(), "dataset pipeline: {}", pipeline.describe());
        let mut iter = Self {
            indices,
            cursor: 0,
            epoch: 0,
            cfg,
            pipeline,
            stats: BatchStats::default(),
            started: Instant::now(),
            last_logged_samples: 0,
        };
        iter.reset(0);
        Ok(iter)
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn stats(&self) -> BatchStats {
        self.stats
    }

    pub fn indices(&self) -> &[PairIndex] {
        &self.indices
    }

    /// Batches one epoch will yield for `batch_size`.
    pub fn batches_per_epoch(&self, batch_size: usize) -> usize {
        let batch_size = batch_size.max(1);
        if self.cfg.drop_last {
            self.indices.len() / batch_size
        } else {
            self.indices.len().div_ceil(batch_size)
        }
    }

    /// Rewind for `epoch`, reshuffling when configured.
    pub fn reset(&mut self, epoch: usize) {
        self.cursor = 0;
        self.epoch = epoch;
        if !self.cfg.shuffle {
            return;
        }
        let mut rng = match self.cfg.seed {
            Some(seed) => rand::rngs::StdRng::seed_from_u64(seed.wrapping_add(epoch as u64)),
            None => rand::rngs::StdRng::from_rng(&mut rand::rng()),
        };
        self.indices.shuffle(&mut rng);
    }

    pub fn next_batch<B: Backend>(
        &mut self,
        batch_size: usize,
        device: &B::Device,
    ) -> DatasetResult<Option<SegmentationBatch<B>>> {
        let batch_size = batch_size.max(1);
        loop {
            if self.cursor >= self.indices.len() {
                return Ok(None);
            }
            let end = (self.cursor + batch_size).min(self.indices.len());
            if self.cfg.drop_last && end - self.cursor < batch_size {
                self.cursor = self.indices.len();
                return Ok(None);
            }
            let slice = &self.indices[self.cursor..end];
            self.cursor = end;

            let t_load = Instant::now();
            let salt = self.epoch as u64;
            let pipeline = &self.pipeline;
            let loaded: Vec<_> = slice
                .par_iter()
                .map(|idx| (idx, load_sample(idx, pipeline, salt)))
                .collect();
            self.stats.load_time += t_load.elapsed();

            let mut images_buf = Vec::new();
            let mut masks_buf = Vec::new();
            let mut rows = Vec::with_capacity(loaded.len());
            let mut expected_size: Option<(u32, u32)> = None;

            for (idx, res) in loaded {
                let sample = match res {
                    Ok(s) => s,
                    Err(e) if self.cfg.permissive_errors => {
                        tracing::warn!(row = idx.row, "skipping sample: {e}");
                        self.stats.skipped_errors += 1;
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                let size = (sample.width, sample.height);
                match expected_size {
                    None => {
                        expected_size = Some(size);
                        images_buf.reserve(slice.len() * sample.image_chw.len());
                        masks_buf.reserve(slice.len() * sample.mask.len());
                    }
                    Some(sz) if sz != size => {
                        return Err(DatasetError::Shape {
                            path: idx.image.clone(),
                            expected: sz,
                            actual: size,
                        });
                    }
                    _ => {}
                }
                images_buf.extend_from_slice(&sample.image_chw);
                masks_buf.extend_from_slice(&sample.mask);
                rows.push(sample.row);
            }

            let Some((width, height)) = expected_size else {
                // Every sample in this slice was skipped.
                continue;
            };
            let n = rows.len();
            let (h, w) = (height as usize, width as usize);
            let images =
                Tensor::<B, 4>::from_data(TensorData::new(images_buf, [n, 3, h, w]), device);
            let masks = Tensor::<B, 4>::from_data(TensorData::new(masks_buf, [n, 1, h, w]), device);

            self.stats.batches += 1;
            self.stats.samples += n;
            self.maybe_log_progress();

            return Ok(Some(SegmentationBatch {
                images,
                masks,
                rows,
            }));
        }
    }

    fn maybe_log_progress(&mut self) {
        let Some(threshold) = self.cfg.log_every_samples else {
            return;
        };
        if self.stats.samples.saturating_sub(self.last_logged_samples) < threshold {
            return;
        }
        let secs = self.started.elapsed().as_secs_f32().max(0.001);
        let avg_load_ms = if self.stats.batches > 0 {
            self.stats.load_time.as_secs_f64() * 1000.0 / self.stats.batches as f64
        } else {
            0.0
        };
        tracing::info!(
            batches = self.stats.batches,
            samples = self.stats.samples,
            skipped = self.stats.skipped_errors,
            "[dataset] rate={:.1} img/s avg_load_ms={:.2}",
            self.stats.samples as f32 / secs,
            avg_load_ms
        );
        self.last_logged_samples = self.stats.samples;
    }
}
