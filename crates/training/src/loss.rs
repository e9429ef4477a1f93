//! IOU objective: a differentiable overlap score used both as metric and (negated) loss.
//!
//! Per sample the soft score is `(2 * sum(p * t) + eps) / (sum(p) + sum(t) + eps)`,
//! averaged over the batch. Two empty masks therefore score 1.

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

pub const IOU_EPS: f32 = 1e-7;

/// Soft IOU of flattened predictions/targets, both `[N, P]`.
pub fn soft_iou<B: Backend>(pred: Tensor<B, 2>, target: Tensor<B, 2>) -> Tensor<B, 1> {
    let intersection = (pred.clone() * target.clone())
        .sum_dim(1)
        .mul_scalar(2.0)
        .add_scalar(IOU_EPS);
    let denominator = (pred.sum_dim(1) + target.sum_dim(1)).add_scalar(IOU_EPS);
    (intersection / denominator).mean()
}

/// One-hot style targets per class, each `[N, H*W]`.
///
/// A single class means binary segmentation: foreground is any mask value above 0.
/// Otherwise channel `c` targets pixels whose mask value equals `c`.
pub fn class_targets<B: Backend>(mask: Tensor<B, 4>, classes: usize) -> Vec<Tensor<B, 2>> {
    let [n, _, h, w] = mask.dims();
    let flat = mask.reshape([n, h * w]);
    if classes <= 1 {
        return vec![flat.greater_elem(0.0).float()];
    }
    (0..classes)
        .map(|c| flat.clone().equal_elem(c as f32).float())
        .collect()
}

/// Soft IOU per class channel of `pred [N, C, H, W]` against `mask [N, 1, H, W]`.
pub fn per_class_iou<B: Backend>(pred: Tensor<B, 4>, mask: Tensor<B, 4>) -> Vec<Tensor<B, 1>> {
    let [n, classes, h, w] = pred.dims();
    class_targets(mask, classes)
        .into_iter()
        .enumerate()
        .map(|(c, target)| {
            let channel = pred
                .clone()
                .slice([0..n, c..c + 1, 0..h, 0..w])
                .reshape([n, h * w]);
            soft_iou(channel, target)
        })
        .collect()
}

/// Mean soft IOU over class channels.
pub fn sparse_iou<B: Backend>(pred: Tensor<B, 4>, mask: Tensor<B, 4>) -> Tensor<B, 1> {
    Tensor::cat(per_class_iou(pred, mask), 0).mean()
}

/// Training objective: maximize IOU by minimizing its negation.
pub fn iou_loss<B: Backend>(pred: Tensor<B, 4>, mask: Tensor<B, 4>) -> Tensor<B, 1> {
    sparse_iou(pred, mask).neg()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type B = NdArray<f32>;

    fn value(t: Tensor<B, 1>) -> f32 {
        t.into_data().to_vec::<f32>().unwrap()[0]
    }

    fn t2(rows: [[f32; 4]; 2]) -> Tensor<B, 2> {
        Tensor::from_floats(rows, &Default::default())
    }

    #[test]
    fn identical_masks_score_one() {
        let m = t2([[1.0, 1.0, 0.0, 0.0], [0.0, 1.0, 0.0, 1.0]]);
        assert!((value(soft_iou(m.clone(), m)) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn disjoint_masks_score_zero() {
        let p = t2([[1.0, 1.0, 0.0, 0.0], [1.0, 0.0, 0.0, 0.0]]);
        let t = t2([[0.0, 0.0, 1.0, 1.0], [0.0, 1.0, 1.0, 1.0]]);
        assert!(value(soft_iou(p, t)) < 1e-5);
    }

    #[test]
    fn empty_prediction_and_target_score_one() {
        let z = t2([[0.0; 4]; 2]);
        assert!((value(soft_iou(z.clone(), z)) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn half_overlap_is_averaged_over_batch() {
        // sample 0: perfect; sample 1: 2*1 / (2 + 1) = 2/3.
        let p = t2([[1.0, 0.0, 0.0, 0.0], [1.0, 1.0, 0.0, 0.0]]);
        let t = t2([[1.0, 0.0, 0.0, 0.0], [1.0, 0.0, 0.0, 0.0]]);
        let expected = (1.0 + 2.0 / 3.0) / 2.0;
        assert!((value(soft_iou(p, t)) - expected).abs() < 1e-5);
    }

    #[test]
    fn binary_targets_treat_any_positive_value_as_foreground() {
        let device = Default::default();
        let mask = Tensor::<B, 4>::from_floats([[[[255.0, 0.0], [1.0, 0.0]]]], &device);
        let targets = class_targets(mask, 1);
        assert_eq!(targets.len(), 1);
        let v = targets[0].clone().into_data().to_vec::<f32>().unwrap();
        assert_eq!(v, vec![1.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn multiclass_perfect_one_hot_prediction_scores_one() {
        let device = Default::default();
        // mask classes: [0, 1, 2, 1]
        let mask = Tensor::<B, 4>::from_floats([[[[0.0, 1.0], [2.0, 1.0]]]], &device);
        let pred = Tensor::<B, 4>::from_floats(
            [[
                [[1.0, 0.0], [0.0, 0.0]],
                [[0.0, 1.0], [0.0, 1.0]],
                [[0.0, 0.0], [1.0, 0.0]],
            ]],
            &device,
        );
        let per_class: Vec<f32> = per_class_iou(pred.clone(), mask.clone())
            .into_iter()
            .map(value)
            .collect();
        assert_eq!(per_class.len(), 3);
        assert!(per_class.iter().all(|v| (v - 1.0).abs() < 1e-5));
        assert!((value(iou_loss(pred, mask)) + 1.0).abs() < 1e-5);
    }
}
