//! Reading image/mask pair CSVs and decoding samples.

use crate::aug::TransformPipeline;
use crate::types::{DatasetError, DatasetResult, PairIndex, PairSummary, SegmentationSample};
use std::fs::File;
use std::path::{Path, PathBuf};

fn csv_reader(path: &Path) -> DatasetResult<csv::Reader<File>> {
    let file = File::open(path).map_err(|e| DatasetError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(file))
}

/// Read `image,mask` records from `csv_path`, skipping the header line.
///
/// `data_root` is prepended to both columns by plain string concatenation,
/// so `"data/"` + `"a.png"` gives `data/a.png` while `"data"` gives `dataa.png`.
pub fn read_pair_csv(csv_path: &Path, data_root: &str) -> DatasetResult<Vec<PairIndex>> {
    let mut reader = csv_reader(csv_path)?;
    let mut pairs = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record.map_err(|e| DatasetError::Csv {
            path: csv_path.to_path_buf(),
            source: e,
        })?;
        let image = record.get(0).unwrap_or_default();
        let mask = record.get(1).unwrap_or_default();
        if image.is_empty() || mask.is_empty() {
            return Err(DatasetError::Row {
                path: csv_path.to_path_buf(),
                row,
                msg: format!("expected 2 non-empty columns, got {}", record.len()),
            });
        }
        pairs.push(PairIndex {
            row,
            image: PathBuf::from(format!("{data_root}{image}")),
            mask: PathBuf::from(format!("{data_root}{mask}")),
        });
    }
    Ok(pairs)
}

/// Number of records in `csv_path`, header excluded.
pub fn count_records(csv_path: &Path) -> DatasetResult<usize> {
    let mut reader = csv_reader(csv_path)?;
    let mut n = 0usize;
    for record in reader.records() {
        record.map_err(|e| DatasetError::Csv {
            path: csv_path.to_path_buf(),
            source: e,
        })?;
        n += 1;
    }
    Ok(n)
}

fn open_image(path: &Path) -> DatasetResult<image::DynamicImage> {
    image::open(path).map_err(|e| match e {
        image::ImageError::IoError(io) => DatasetError::Io {
            path: path.to_path_buf(),
            source: io,
        },
        other => DatasetError::Image {
            path: path.to_path_buf(),
            source: other,
        },
    })
}

fn check_shape(path: &Path, actual: (u32, u32), expected: Option<(u32, u32)>) -> DatasetResult<()> {
    match expected {
        Some(expected) if expected != actual => Err(DatasetError::Shape {
            path: path.to_path_buf(),
            expected,
            actual,
        }),
        _ => Ok(()),
    }
}

/// Planar CHW copy of an RGB image in raw `0..=255` scale.
pub fn rgb_to_chw(image: &image::RgbImage) -> Vec<f32> {
    let (width, height) = image.dimensions();
    let pixels = (width * height) as usize;
    let mut chw = vec![0.0f32; pixels * 3];
    for (x, y, pixel) in image.enumerate_pixels() {
        let base = (y * width + x) as usize;
        chw[base] = pixel[0] as f32;
        chw[pixels + base] = pixel[1] as f32;
        chw[2 * pixels + base] = pixel[2] as f32;
    }
    chw
}

/// Decode an RGB image, optionally checking its (width, height).
pub fn load_rgb(path: &Path, expected: Option<(u32, u32)>) -> DatasetResult<image::RgbImage> {
    let image = open_image(path)?.to_rgb8();
    check_shape(path, image.dimensions(), expected)?;
    Ok(image)
}

/// Decode one pair and run it through `pipeline`.
///
/// `salt` varies the augmentation of seeded pipelines between epochs.
pub fn load_sample(
    idx: &PairIndex,
    pipeline: &TransformPipeline,
    salt: u64,
) -> DatasetResult<SegmentationSample> {
    let image = load_rgb(&idx.image, pipeline.target_size)?;
    let mask = open_image(&idx.mask)?.to_luma8();

    let (width, height) = image.dimensions();
    check_shape(&idx.mask, mask.dimensions(), Some((width, height)))?;

    let mask: Vec<f32> = mask.as_raw().iter().map(|v| *v as f32).collect();

    let mut sample = SegmentationSample {
        row: idx.row,
        image_chw: rgb_to_chw(&image),
        mask,
        width,
        height,
    };
    pipeline.apply(&mut sample, salt);
    Ok(sample)
}

/// Check that every pair exists, decodes its header, and has the expected geometry.
pub fn summarize_pairs(pairs: &[PairIndex], expected: Option<(u32, u32)>) -> PairSummary {
    let mut summary = PairSummary {
        total: pairs.len(),
        ..Default::default()
    };
    for pair in pairs {
        if !pair.image.exists() {
            summary.missing_image += 1;
            continue;
        }
        if !pair.mask.exists() {
            summary.missing_mask += 1;
            continue;
        }
        let dims = (
            image::image_dimensions(&pair.image),
            image::image_dimensions(&pair.mask),
        );
        match dims {
            (Ok(img), Ok(mask)) => {
                let shape_ok = img == mask && expected.is_none_or(|e| e == img);
                if shape_ok {
                    summary.ok += 1;
                } else {
                    summary.bad_shape += 1;
                }
            }
            _ => summary.unreadable += 1,
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn header_is_skipped_and_root_concatenated() {
        let tmp = tempfile::tempdir().unwrap();
        let csv = tmp.path().join("train.csv");
        fs::write(&csv, "image,mask\na.png,a_mask.png\n\"b c.png\",b_mask.png\n").unwrap();

        let pairs = read_pair_csv(&csv, "root/").unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].image, PathBuf::from("root/a.png"));
        assert_eq!(pairs[1].image, PathBuf::from("root/b c.png"));
        assert_eq!(pairs[1].mask, PathBuf::from("root/b_mask.png"));
        assert_eq!(pairs[1].row, 1);
        assert_eq!(count_records(&csv).unwrap(), 2);
    }

    #[test]
    fn short_rows_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let csv = tmp.path().join("bad.csv");
        fs::write(&csv, "image,mask\nonly_image.png\n").unwrap();
        let err = read_pair_csv(&csv, "").unwrap_err();
        assert!(matches!(err, DatasetError::Row { row: 0, .. }));
    }

    #[test]
    fn missing_csv_is_io_error() {
        let err = count_records(Path::new("/definitely/not/here.csv")).unwrap_err();
        assert!(matches!(err, DatasetError::Io { .. }));
    }
}
