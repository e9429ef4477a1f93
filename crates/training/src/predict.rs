//! Turning network output into mask images.

use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use image::{GrayImage, RgbImage};
use models::UNet;
use seg_dataset::rgb_to_chw;
use std::collections::HashSet;
use std::path::Path;

/// One mask per sample of `pred [N, C, H, W]`.
///
/// A single channel is a probability map written as `p * 255`; more channels
/// are reduced to the argmax class index.
pub fn prediction_to_masks<B: Backend>(pred: Tensor<B, 4>) -> Vec<GrayImage> {
    let [n, classes, h, w] = pred.dims();
    let values: Vec<f32> = if classes <= 1 {
        pred.mul_scalar(255.0)
            .into_data()
            .to_vec::<f32>()
            .unwrap_or_default()
    } else {
        pred.argmax(1)
            .float()
            .into_data()
            .to_vec::<f32>()
            .unwrap_or_default()
    };
    let pixels = h * w;
    values
        .chunks_exact(pixels)
        .take(n)
        .filter_map(|plane| {
            let raw = plane
                .iter()
                .map(|v| v.round().clamp(0.0, 255.0) as u8)
                .collect();
            GrayImage::from_raw(w as u32, h as u32, raw)
        })
        .collect()
}

/// `[1, 3, H, W]` tensor of a decoded RGB image.
pub fn image_tensor<B: Backend>(image: &RgbImage, device: &B::Device) -> Tensor<B, 4> {
    let (w, h) = image.dimensions();
    let data = TensorData::new(rgb_to_chw(image), [1, 3, h as usize, w as usize]);
    Tensor::from_data(data, device)
}

/// Run `model` on one image and render its mask.
pub fn predict_mask<B: Backend>(
    model: &UNet<B>,
    image: &RgbImage,
    device: &B::Device,
) -> Option<GrayImage> {
    let pred = model.forward(image_tensor::<B>(image, device));
    prediction_to_masks(pred).into_iter().next()
}

/// `<stem>_mask.png` for `input`; stems already in `used` get a `_<n>` suffix.
pub fn mask_file_name(input: &Path, used: &mut HashSet<String>) -> String {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    let mut name = format!("{stem}_mask.png");
    let mut n = 1usize;
    while used.contains(&name) {
        name = format!("{stem}_{n}_mask.png");
        n += 1;
    }
    used.insert(name.clone());
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type B = NdArray<f32>;

    #[test]
    fn binary_probabilities_scale_to_bytes() {
        let pred = Tensor::<B, 4>::from_floats([[[[0.0, 0.5], [1.0, 0.25]]]], &Default::default());
        let masks = prediction_to_masks(pred);
        assert_eq!(masks.len(), 1);
        assert_eq!(masks[0].dimensions(), (2, 2));
        assert_eq!(masks[0].as_raw(), &vec![0, 128, 255, 64]);
    }

    #[test]
    fn multiclass_takes_argmax() {
        // 3 classes over a 1x2 image: pixel 0 favours class 2, pixel 1 class 0.
        let pred = Tensor::<B, 4>::from_floats(
            [[[[0.1, 0.7]], [[0.2, 0.2]], [[0.7, 0.1]]]],
            &Default::default(),
        );
        let masks = prediction_to_masks(pred);
        assert_eq!(masks[0].as_raw(), &vec![2, 0]);
    }

    #[test]
    fn image_tensor_is_planar() {
        let mut img = RgbImage::new(2, 1);
        img.put_pixel(1, 0, image::Rgb([10, 20, 30]));
        let t = image_tensor::<B>(&img, &Default::default());
        assert_eq!(t.dims(), [1, 3, 1, 2]);
        let v = t.into_data().to_vec::<f32>().unwrap();
        assert_eq!(v, vec![0.0, 10.0, 0.0, 20.0, 0.0, 30.0]);
    }

    #[test]
    fn repeated_stems_get_distinct_names() {
        let mut used = HashSet::new();
        assert_eq!(mask_file_name(Path::new("a/car.png"), &mut used), "car_mask.png");
        assert_eq!(mask_file_name(Path::new("b/car.jpg"), &mut used), "car_1_mask.png");
        assert_eq!(mask_file_name(Path::new("c/car.png"), &mut used), "car_2_mask.png");
        assert_eq!(mask_file_name(Path::new("road.png"), &mut used), "road_mask.png");
    }
}
