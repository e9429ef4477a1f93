//! Integration tests for CSV -> decode -> batch workflows.

use burn_ndarray::NdArray;
use image::{GrayImage, Luma, Rgb, RgbImage};
use seg_dataset::{
    build_train_test_iters, count_records, read_pair_csv, summarize_pairs, BatchIter,
    DatasetError, DatasetConfig,
};
use std::fs;
use std::path::Path;

type B = NdArray<f32>;

/// Write `count` 8x8 image/mask pairs under `root` plus a CSV listing them (paths relative to root).
fn create_synthetic_pairs(root: &Path, csv_name: &str, count: usize) -> anyhow::Result<()> {
    let mut csv = String::from("image,mask\n");
    for i in 0..count {
        let img_name = format!("img_{i:03}.png");
        let mask_name = format!("mask_{i:03}.png");
        let img = RgbImage::from_fn(8, 8, |x, _y| Rgb([(i * 20) as u8, (x * 30) as u8, 200]));
        img.save(root.join(&img_name))?;
        let mask = GrayImage::from_fn(8, 8, |x, _y| Luma([if x < 4 { 255 } else { 0 }]));
        mask.save(root.join(&mask_name))?;
        csv.push_str(&format!("{img_name},{mask_name}\n"));
    }
    fs::write(root.join(csv_name), csv)?;
    Ok(())
}

fn data_root(root: &Path) -> String {
    format!("{}/", root.display())
}

fn plain_cfg() -> DatasetConfig {
    DatasetConfig {
        target_size: Some((8, 8)),
        log_every_samples: None,
        ..Default::default()
    }
    .eval()
}

#[test]
fn workflow_csv_to_batches_with_small_final_batch() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    create_synthetic_pairs(tmp.path(), "train.csv", 5)?;

    let mut iter = BatchIter::from_csv(&tmp.path().join("train.csv"), &data_root(tmp.path()), plain_cfg())?;
    assert_eq!(iter.len(), 5);
    assert_eq!(iter.batches_per_epoch(2), 3);

    let device = Default::default();
    let mut sizes = Vec::new();
    while let Some(batch) = iter.next_batch::<B>(2, &device)? {
        assert_eq!(batch.images.dims()[1..], [3, 8, 8]);
        assert_eq!(batch.masks.dims()[1..], [1, 8, 8]);
        sizes.push(batch.len());
    }
    assert_eq!(sizes, vec![2, 2, 1]);

    // Rewind yields the same number of samples again.
    iter.reset(1);
    let mut total = 0;
    while let Some(batch) = iter.next_batch::<B>(4, &device)? {
        total += batch.len();
    }
    assert_eq!(total, 5);
    Ok(())
}

#[test]
fn unshuffled_batches_keep_csv_order_and_raw_values() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    create_synthetic_pairs(tmp.path(), "test.csv", 3)?;
    let mut iter = BatchIter::from_csv(&tmp.path().join("test.csv"), &data_root(tmp.path()), plain_cfg())?;

    let device = Default::default();
    let batch = iter.next_batch::<B>(3, &device)?.expect("one batch");
    assert_eq!(batch.rows, vec![0, 1, 2]);

    let images = batch.images.into_data().to_vec::<f32>().unwrap();
    // First value of sample 1's red plane is 20 (raw scale, not normalized).
    assert_eq!(images[3 * 64], 20.0);
    let masks = batch.masks.into_data().to_vec::<f32>().unwrap();
    assert_eq!(masks[0], 255.0);
    assert_eq!(masks[7], 0.0);
    Ok(())
}

#[test]
fn drop_last_discards_partial_batch() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    create_synthetic_pairs(tmp.path(), "train.csv", 3)?;
    let cfg = DatasetConfig {
        drop_last: true,
        ..plain_cfg()
    };
    let mut iter = BatchIter::from_csv(&tmp.path().join("train.csv"), &data_root(tmp.path()), cfg)?;
    assert_eq!(iter.batches_per_epoch(2), 1);

    let device = Default::default();
    assert!(iter.next_batch::<B>(2, &device)?.is_some());
    assert!(iter.next_batch::<B>(2, &device)?.is_none());
    Ok(())
}

#[test]
fn wrong_geometry_is_a_shape_error() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    create_synthetic_pairs(tmp.path(), "train.csv", 2)?;
    let cfg = DatasetConfig {
        target_size: Some((16, 16)),
        ..plain_cfg()
    };
    let mut iter = BatchIter::from_csv(&tmp.path().join("train.csv"), &data_root(tmp.path()), cfg)?;
    let device = Default::default();
    let err = iter.next_batch::<B>(2, &device).unwrap_err();
    assert!(matches!(err, DatasetError::Shape { .. }), "{err}");
    Ok(())
}

#[test]
fn permissive_mode_skips_missing_files() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    create_synthetic_pairs(tmp.path(), "train.csv", 3)?;
    fs::remove_file(tmp.path().join("mask_001.png"))?;
    let csv = tmp.path().join("train.csv");
    let root = data_root(tmp.path());
    let device = Default::default();

    let mut strict = BatchIter::from_csv(&csv, &root, plain_cfg())?;
    assert!(strict.next_batch::<B>(3, &device).is_err());

    let cfg = DatasetConfig {
        permissive_errors: true,
        ..plain_cfg()
    };
    let mut lenient = BatchIter::from_csv(&csv, &root, cfg)?;
    let batch = lenient.next_batch::<B>(3, &device)?.expect("batch");
    assert_eq!(batch.rows, vec![0, 2]);
    assert_eq!(lenient.stats().skipped_errors, 1);

    let summary = summarize_pairs(&read_pair_csv(&csv, &root)?, Some((8, 8)));
    assert_eq!(summary.total, 3);
    assert_eq!(summary.ok, 2);
    assert_eq!(summary.missing_mask, 1);
    assert_eq!(summary.problems(), 1);
    Ok(())
}

#[test]
fn train_and_test_iters_share_geometry_but_not_augmentation() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    create_synthetic_pairs(tmp.path(), "train.csv", 4)?;
    create_synthetic_pairs(tmp.path(), "test.csv", 2)?;
    let root = data_root(tmp.path());
    let train_cfg = DatasetConfig {
        target_size: Some((8, 8)),
        seed: Some(3),
        log_every_samples: None,
        ..Default::default()
    };
    let (train, mut test) = build_train_test_iters(
        &tmp.path().join("train.csv"),
        &tmp.path().join("test.csv"),
        &root,
        train_cfg,
    )?;
    assert_eq!(train.len(), 4);
    assert_eq!(test.len(), 2);
    assert_eq!(count_records(&tmp.path().join("test.csv"))?, 2);

    let device = Default::default();
    let batch = test.next_batch::<B>(8, &device)?.expect("test batch");
    assert_eq!(batch.rows, vec![0, 1]);
    let masks = batch.masks.into_data().to_vec::<f32>().unwrap();
    // No flips on the eval path: left half stays foreground.
    assert_eq!(masks[0], 255.0);
    assert_eq!(masks[4], 0.0);
    Ok(())
}
