//! Image/mask augmentation pipeline.
//!
//! Geometric transforms (flips) move image and mask pixels together; photometric
//! transforms (brightness, hue) touch the image only.

use crate::types::SegmentationSample;
use rand::{Rng, SeedableRng};

#[derive(Debug, Clone)]
pub struct DatasetConfig {
    /// Expected (width, height) of every image and mask. None accepts any shape shared by a batch.
    pub target_size: Option<(u32, u32)>,
    /// Probability of mirroring left <-> right.
    pub flip_horizontal_prob: f32,
    /// Probability of mirroring up <-> down.
    pub flip_vertical_prob: f32,
    /// Brightness delta is drawn from [-max, max] and added in raw pixel scale.
    pub brightness_max_delta: f32,
    /// Hue rotation is drawn from [-max, max] (fraction of a full turn, <= 0.5).
    pub hue_max_delta: f32,
    /// Shuffle samples at the start of every epoch.
    pub shuffle: bool,
    /// Seed for reproducible shuffling and augmentation.
    pub seed: Option<u64>,
    /// Drop the last partial batch instead of yielding a smaller one.
    pub drop_last: bool,
    /// Skip unreadable samples with a warning instead of failing the batch.
    pub permissive_errors: bool,
    /// Emit a progress line every N samples (None disables).
    pub log_every_samples: Option<usize>,
    /// Optional transform pipeline override; if None, built from other fields.
    pub transform: Option<TransformPipeline>,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            target_size: Some((256, 256)),
            flip_horizontal_prob: 0.5,
            flip_vertical_prob: 0.5,
            brightness_max_delta: 0.7,
            hue_max_delta: 0.3,
            shuffle: true,
            seed: None,
            drop_last: false,
            permissive_errors: false,
            log_every_samples: Some(1000),
            transform: None,
        }
    }
}

impl DatasetConfig {
    /// Evaluation variant: same geometry, no augmentation, no shuffling.
    pub fn eval(&self) -> Self {
        Self {
            flip_horizontal_prob: 0.0,
            flip_vertical_prob: 0.0,
            brightness_max_delta: 0.0,
            hue_max_delta: 0.0,
            shuffle: false,
            drop_last: false,
            transform: None,
            ..self.clone()
        }
    }

    pub fn pipeline(&self) -> TransformPipeline {
        self.transform
            .clone()
            .unwrap_or_else(|| TransformPipeline::from_config(self))
    }
}

#[derive(Debug, Clone)]
pub struct TransformPipeline {
    pub target_size: Option<(u32, u32)>,
    pub flip_horizontal_prob: f32,
    pub flip_vertical_prob: f32,
    pub brightness_max_delta: f32,
    pub hue_max_delta: f32,
    pub seed: Option<u64>,
}

impl TransformPipeline {
    pub fn from_config(cfg: &DatasetConfig) -> Self {
        Self {
            target_size: cfg.target_size,
            flip_horizontal_prob: cfg.flip_horizontal_prob,
            flip_vertical_prob: cfg.flip_vertical_prob,
            brightness_max_delta: cfg.brightness_max_delta,
            hue_max_delta: cfg.hue_max_delta,
            seed: cfg.seed,
        }
    }

    pub fn is_identity(&self) -> bool {
        self.flip_horizontal_prob <= 0.0
            && self.flip_vertical_prob <= 0.0
            && self.brightness_max_delta <= 0.0
            && self.hue_max_delta <= 0.0
    }

    pub fn describe(&self) -> String {
        let ts = self
            .target_size
            .map(|(w, h)| format!("{}x{}", w, h))
            .unwrap_or_else(|| "any".to_string());
        format!(
            "target_size={} flip_lr_p={:.2} flip_ud_p={:.2} brightness={:.2} hue={:.2} seed={}",
            ts,
            self.flip_horizontal_prob,
            self.flip_vertical_prob,
            self.brightness_max_delta,
            self.hue_max_delta,
            self.seed
                .map(|s| s.to_string())
                .unwrap_or_else(|| "none".to_string())
        )
    }

    pub fn apply(&self, sample: &mut SegmentationSample, salt: u64) {
        if self.is_identity() {
            return;
        }
        // Seeded: deterministic per (seed, row, salt). Otherwise thread-local.
        let mut rng_local;
        let mut seeded_rng;
        let rng: &mut dyn rand::RngCore = if let Some(seed) = self.seed {
            let mixed = seed ^ (sample.row as u64) ^ salt.rotate_left(32);
            seeded_rng = rand::rngs::StdRng::seed_from_u64(mixed);
            &mut seeded_rng
        } else {
            rng_local = rand::rng();
            &mut rng_local
        };

        let (w, h) = (sample.width as usize, sample.height as usize);
        if coin(rng, self.flip_horizontal_prob) {
            flip_horizontal(&mut sample.image_chw, w, h);
            flip_horizontal(&mut sample.mask, w, h);
        }
        if coin(rng, self.flip_vertical_prob) {
            flip_vertical(&mut sample.image_chw, w, h);
            flip_vertical(&mut sample.mask, w, h);
        }
        if self.brightness_max_delta > 0.0 {
            let max = self.brightness_max_delta;
            adjust_brightness(&mut sample.image_chw, rng.random_range(-max..=max));
        }
        if self.hue_max_delta > 0.0 {
            let max = self.hue_max_delta.min(0.5);
            adjust_hue(&mut sample.image_chw, w * h, rng.random_range(-max..=max));
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransformPipelineBuilder {
    inner: TransformPipeline,
}

impl Default for TransformPipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TransformPipelineBuilder {
    pub fn new() -> Self {
        Self {
            inner: TransformPipeline::from_config(&DatasetConfig::default()),
        }
    }
    /// Start from a pipeline that changes nothing.
    pub fn identity() -> Self {
        Self {
            inner: TransformPipeline::from_config(&DatasetConfig::default().eval()),
        }
    }
    pub fn target_size(mut self, size: Option<(u32, u32)>) -> Self {
        self.inner.target_size = size;
        self
    }
    pub fn flips(mut self, horizontal: f32, vertical: f32) -> Self {
        self.inner.flip_horizontal_prob = horizontal;
        self.inner.flip_vertical_prob = vertical;
        self
    }
    pub fn brightness(mut self, max_delta: f32) -> Self {
        self.inner.brightness_max_delta = max_delta;
        self
    }
    pub fn hue(mut self, max_delta: f32) -> Self {
        self.inner.hue_max_delta = max_delta;
        self
    }
    pub fn seed(mut self, seed: Option<u64>) -> Self {
        self.inner.seed = seed;
        self
    }
    pub fn build(self) -> TransformPipeline {
        self.inner
    }
}

fn coin(rng: &mut dyn rand::RngCore, prob: f32) -> bool {
    prob > 0.0 && rng.random_range(0.0..1.0) < prob
}

/// Mirror every `w x h` plane of a planar buffer left <-> right.
pub fn flip_horizontal(planes: &mut [f32], w: usize, h: usize) {
    if w == 0 || h == 0 {
        return;
    }
    for row in planes.chunks_exact_mut(w) {
        row.reverse();
    }
}

/// Mirror every `w x h` plane of a planar buffer up <-> down.
pub fn flip_vertical(planes: &mut [f32], w: usize, h: usize) {
    if w == 0 || h == 0 {
        return;
    }
    for plane in planes.chunks_exact_mut(w * h) {
        for y in 0..h / 2 {
            let (top, bottom) = plane.split_at_mut((h - 1 - y) * w);
            top[y * w..(y + 1) * w].swap_with_slice(&mut bottom[..w]);
        }
    }
}

/// Add `delta` to every value (no clamping).
pub fn adjust_brightness(image: &mut [f32], delta: f32) {
    for v in image.iter_mut() {
        *v += delta;
    }
}

/// Rotate hue of a CHW RGB buffer by `delta` turns, keeping saturation and value.
pub fn adjust_hue(image_chw: &mut [f32], pixels: usize, delta: f32) {
    if image_chw.len() < pixels * 3 {
        return;
    }
    let (r_plane, rest) = image_chw.split_at_mut(pixels);
    let (g_plane, b_plane) = rest.split_at_mut(pixels);
    for i in 0..pixels {
        let (h, s, v) = rgb_to_hsv(r_plane[i], g_plane[i], b_plane[i]);
        let h = (h + delta).rem_euclid(1.0);
        let (r, g, b) = hsv_to_rgb(h, s, v);
        r_plane[i] = r;
        g_plane[i] = g;
        b_plane[i] = b;
    }
}

/// Hue in [0, 1), saturation in [0, 1], value in the input scale.
pub(crate) fn rgb_to_hsv(r: f32, g: f32, b: f32) -> (f32, f32, f32) {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let range = max - min;
    let s = if max > 0.0 { range / max } else { 0.0 };
    if range <= 0.0 {
        return (0.0, s, max);
    }
    let h = if max == r {
        (g - b) / range
    } else if max == g {
        2.0 + (b - r) / range
    } else {
        4.0 + (r - g) / range
    };
    ((h / 6.0).rem_euclid(1.0), s, max)
}

pub(crate) fn hsv_to_rgb(h: f32, s: f32, v: f32) -> (f32, f32, f32) {
    let h6 = h.rem_euclid(1.0) * 6.0;
    let sector = h6.floor();
    let f = h6 - sector;
    let p = v * (1.0 - s);
    let q = v * (1.0 - s * f);
    let t = v * (1.0 - s * (1.0 - f));
    match sector as u32 {
        0 => (v, t, p),
        1 => (q, v, p),
        2 => (p, v, t),
        3 => (p, q, v),
        4 => (t, p, v),
        _ => (v, p, q),
    }
}
