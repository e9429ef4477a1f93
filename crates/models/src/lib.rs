//! Burn U-Net modules for dense (per-pixel) segmentation.
//!
//! The network follows the classic encoder/decoder layout:
//! - contracting path: `{Conv3x3 -> BatchNorm -> ReLU} x2` followed by 2x2 max-pooling;
//! - bottleneck block without pooling;
//! - expanding path: nearest-neighbour upsampling, skip concatenation, `{Conv -> BN -> ReLU} x2`;
//! - 1x1 head with sigmoid (single class) or channel softmax (multi-class).
//!
//! Shapes use Burn's NCHW layout: input `[N, 3, H, W]` in raw `0..=255` scale,
//! output `[N, classes, H, W]` probabilities. `H` and `W` must be divisible by
//! `2^depth`; see [`UNetConfig::validate_input_size`].

use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{MaxPool2d, MaxPool2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, PaddingConfig2d};
use burn::tensor::activation::{relu, sigmoid, softmax};
use burn::tensor::backend::Backend;
use burn::tensor::module::interpolate;
use burn::tensor::ops::{InterpolateMode, InterpolateOptions};
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};

/// Batch-norm epsilon and running-stat momentum (decay 0.99).
const BN_EPSILON: f64 = 1e-3;
const BN_MOMENTUM: f64 = 0.01;

/// Deepest supported contracting path.
pub const MAX_DEPTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UNetConfig {
    /// Input image channels (RGB).
    pub in_channels: usize,
    /// Output class channels. 1 => sigmoid mask, >1 => softmax over classes.
    pub classes: usize,
    /// Filters of the first contracting level; doubled at each level below.
    pub base_filters: usize,
    /// Number of pooling levels.
    pub depth: usize,
}

impl Default for UNetConfig {
    fn default() -> Self {
        Self {
            in_channels: 3,
            classes: 1,
            base_filters: 8,
            depth: 4,
        }
    }
}

impl UNetConfig {
    pub fn with_classes(mut self, classes: usize) -> Self {
        self.classes = classes;
        self
    }

    /// Filters per contracting level, bottleneck last: `[8, 16, 32, 64, 128]` by default.
    ///
    /// Counts that do not fit a `usize` saturate; [`Self::validate_input_size`] rejects them.
    pub fn level_filters(&self) -> Vec<usize> {
        (0..=self.depth)
            .map(|level| self.filters_at(level).unwrap_or(usize::MAX))
            .collect()
    }

    fn filters_at(&self, level: usize) -> Option<usize> {
        let scale = u32::try_from(level).ok().and_then(|l| 1usize.checked_shl(l))?;
        self.base_filters.checked_mul(scale)
    }

    /// Spatial sizes must survive `depth` halvings and come back on upsampling.
    pub fn validate_input_size(&self, height: usize, width: usize) -> Result<(), String> {
        if self.classes == 0 {
            return Err("classes must be at least 1".to_string());
        }
        if self.base_filters == 0 {
            return Err("base_filters must be at least 1".to_string());
        }
        if self.depth > MAX_DEPTH {
            return Err(format!(
                "depth {} exceeds the maximum of {MAX_DEPTH}",
                self.depth
            ));
        }
        if self.filters_at(self.depth).is_none() {
            return Err(format!(
                "base_filters {} overflows at depth {}",
                self.base_filters, self.depth
            ));
        }
        let factor = 1usize << self.depth;
        if height == 0 || width == 0 || height % factor != 0 || width % factor != 0 {
            return Err(format!(
                "input {height}x{width} is not divisible by {factor} (2^depth, depth={})",
                self.depth
            ));
        }
        Ok(())
    }
}

/// `{Conv3x3(same) -> BatchNorm -> ReLU}` repeated once per filter count.
#[derive(Debug, Module)]
pub struct ConvBlock<B: Backend> {
    convs: Vec<Conv2d<B>>,
    norms: Vec<BatchNorm<B, 2>>,
}

impl<B: Backend> ConvBlock<B> {
    pub fn new(in_channels: usize, filters: &[usize], device: &B::Device) -> Self {
        let mut convs = Vec::with_capacity(filters.len());
        let mut norms = Vec::with_capacity(filters.len());
        let mut channels = in_channels;
        for &f in filters {
            convs.push(
                Conv2dConfig::new([channels, f], [3, 3])
                    .with_padding(PaddingConfig2d::Same)
                    .init(device),
            );
            norms.push(
                BatchNormConfig::new(f)
                    .with_epsilon(BN_EPSILON)
                    .with_momentum(BN_MOMENTUM)
                    .init(device),
            );
            channels = f;
        }
        Self { convs, norms }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = input;
        for (conv, norm) in self.convs.iter().zip(&self.norms) {
            x = relu(norm.forward(conv.forward(x)));
        }
        x
    }
}

/// Contracting level: conv block, then 2x2/2 max-pool.
#[derive(Debug, Module)]
pub struct DownBlock<B: Backend> {
    block: ConvBlock<B>,
    pool: MaxPool2d,
}

impl<B: Backend> DownBlock<B> {
    pub fn new(in_channels: usize, filters: usize, device: &B::Device) -> Self {
        Self {
            block: ConvBlock::new(in_channels, &[filters, filters], device),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
        }
    }

    /// Returns `(features, pooled)`; `features` is the skip connection.
    pub fn forward(&self, input: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let features = self.block.forward(input);
        let pooled = self.pool.forward(features.clone());
        (features, pooled)
    }
}

/// Expanding level: upsample x2, concat with the skip, conv block.
#[derive(Debug, Module)]
pub struct UpBlock<B: Backend> {
    block: ConvBlock<B>,
}

impl<B: Backend> UpBlock<B> {
    pub fn new(in_channels: usize, skip_channels: usize, filters: usize, device: &B::Device) -> Self {
        Self {
            block: ConvBlock::new(in_channels + skip_channels, &[filters, filters], device),
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>, skip: Tensor<B, 4>) -> Tensor<B, 4> {
        let up = upsample_nearest(input, 2);
        self.block.forward(Tensor::cat(vec![up, skip], 1))
    }
}

/// Nearest-neighbour rescale of `[N, C, H, W]` to `[N, C, H*scale, W*scale]`.
pub fn upsample_nearest<B: Backend>(input: Tensor<B, 4>, scale: usize) -> Tensor<B, 4> {
    let [_, _, h, w] = input.dims();
    interpolate(
        input,
        [h * scale, w * scale],
        InterpolateOptions::new(InterpolateMode::Nearest),
    )
}

#[derive(Debug, Module)]
pub struct UNet<B: Backend> {
    color_adjust: Conv2d<B>,
    downs: Vec<DownBlock<B>>,
    bottleneck: ConvBlock<B>,
    ups: Vec<UpBlock<B>>,
    head: Conv2d<B>,
    classes: usize,
}

impl<B: Backend> UNet<B> {
    pub fn new(cfg: UNetConfig, device: &B::Device) -> Self {
        let filters = cfg.level_filters();
        let depth = cfg.depth;
        let classes = cfg.classes.max(1);

        let color_adjust = Conv2dConfig::new([cfg.in_channels, cfg.in_channels], [1, 1]).init(device);

        let mut downs = Vec::with_capacity(depth);
        let mut channels = cfg.in_channels;
        for &f in &filters[..depth] {
            downs.push(DownBlock::new(channels, f, device));
            channels = f;
        }
        let bottleneck = ConvBlock::new(channels, &[filters[depth], filters[depth]], device);

        let mut ups = Vec::with_capacity(depth);
        let mut channels = filters[depth];
        for &f in filters[..depth].iter().rev() {
            ups.push(UpBlock::new(channels, f, f, device));
            channels = f;
        }

        let head = Conv2dConfig::new([channels, classes], [1, 1])
            .with_padding(PaddingConfig2d::Same)
            .init(device);

        Self {
            color_adjust,
            downs,
            bottleneck,
            ups,
            head,
            classes,
        }
    }

    pub fn classes(&self) -> usize {
        self.classes
    }

    /// Pre-activation class scores `[N, classes, H, W]`.
    pub fn forward_logits(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = input.div_scalar(127.5).sub_scalar(1.0);
        let mut x = self.color_adjust.forward(x);

        let mut skips = Vec::with_capacity(self.downs.len());
        for down in &self.downs {
            let (features, pooled) = down.forward(x);
            skips.push(features);
            x = pooled;
        }
        x = self.bottleneck.forward(x);
        for up in &self.ups {
            // One skip per level; the vectors are built with equal length.
            let skip = match skips.pop() {
                Some(skip) => skip,
                None => break,
            };
            x = up.forward(x, skip);
        }
        self.head.forward(x)
    }

    /// Per-pixel class probabilities `[N, classes, H, W]`.
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let logits = self.forward_logits(input);
        if self.classes > 1 {
            softmax(logits, 1)
        } else {
            sigmoid(logits)
        }
    }
}

pub mod prelude {
    pub use super::{upsample_nearest, ConvBlock, DownBlock, UNet, UNetConfig, UpBlock};
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type B = NdArray<f32>;

    #[test]
    fn default_filters_match_classic_layout() {
        assert_eq!(UNetConfig::default().level_filters(), vec![8, 16, 32, 64, 128]);
    }

    #[test]
    fn rejects_sizes_not_divisible_by_pool_factor() {
        let cfg = UNetConfig::default();
        assert!(cfg.validate_input_size(256, 256).is_ok());
        assert!(cfg.validate_input_size(32, 48).is_ok());
        assert!(cfg.validate_input_size(250, 256).is_err());
        assert!(cfg.validate_input_size(0, 16).is_err());
        assert!(cfg.with_classes(0).validate_input_size(16, 16).is_err());
    }

    #[test]
    fn absurd_depths_are_errors_not_panics() {
        let deep = UNetConfig {
            depth: 64,
            ..Default::default()
        };
        assert!(deep.validate_input_size(256, 256).unwrap_err().contains("depth"));

        let wide = UNetConfig {
            base_filters: usize::MAX / 2,
            depth: 4,
            ..Default::default()
        };
        assert!(wide.validate_input_size(256, 256).unwrap_err().contains("overflows"));
        assert_eq!(*wide.level_filters().last().unwrap(), usize::MAX);
    }

    #[test]
    fn upsample_repeats_pixels() {
        let device = Default::default();
        let x = Tensor::<B, 4>::from_floats([[[[1.0, 2.0], [3.0, 4.0]]]], &device);
        let up = upsample_nearest(x, 2);
        assert_eq!(up.dims(), [1, 1, 4, 4]);
        let v = up.into_data().to_vec::<f32>().unwrap();
        assert_eq!(&v[0..4], &[1.0, 1.0, 2.0, 2.0]);
        assert_eq!(&v[12..16], &[3.0, 3.0, 4.0, 4.0]);
    }
}
