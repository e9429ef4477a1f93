use anyhow::Context;
use burn::backend::Autodiff;
use burn::module::AutodiffModule;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;
use clap::Parser;
use cli_support::{BackendKind, CheckpointArgs, DataArgs, DataOpts};
use image::GrayImage;
use models::{UNet, UNetConfig};
use seg_dataset::{build_train_test_iters, count_records, summarize_pairs, BatchIter, DatasetConfig};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use crate::checkpoint::{CheckpointManager, TrainingState};
use crate::config::TrainConfigFile;
use crate::loss::{iou_loss, per_class_iou};
use crate::predict::prediction_to_masks;
use crate::summary::{run_stamp, SummaryWriter};
use crate::TrainBackend;

pub const DEFAULT_EPOCHS: usize = 8;
pub const DEFAULT_LEARNING_RATE: f64 = 1e-3;
pub const DEFAULT_BATCH_SIZE: usize = 16;
pub const DEFAULT_CHANNELS: usize = 5;
pub const DEFAULT_HEIGHT: u32 = 256;
pub const DEFAULT_WIDTH: u32 = 256;
pub const DEFAULT_SUMMARY_EVERY: usize = 10;

const IOU_TAG: &str = "IOU";
const MASK_TAG: &str = "Predicted Mask";

#[derive(Parser, Debug, Clone)]
#[command(
    name = "train",
    about = "Train a U-Net segmenter against an IOU objective"
)]
pub struct TrainArgs {
    #[command(flatten)]
    pub data: DataArgs,
    #[command(flatten)]
    pub checkpoint: CheckpointArgs,
    /// TOML config file; flags given here override its values.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Number of epochs (default: 8).
    #[arg(long)]
    pub epochs: Option<usize>,
    /// Adam learning rate (default: 0.001).
    #[arg(long)]
    pub learning_rate: Option<f64>,
    /// Batch size (default: 16).
    #[arg(long)]
    pub batch_size: Option<usize>,
    /// Number of output class channels (default: 5).
    #[arg(long)]
    pub channels: Option<usize>,
    /// Image height (default: 256).
    #[arg(long)]
    pub height: Option<u32>,
    /// Image width (default: 256).
    #[arg(short = 'w', long)]
    pub width: Option<u32>,
    /// Summary directory (default: logdir).
    #[arg(long)]
    pub logdir: Option<PathBuf>,
    /// Seed for shuffling and augmentation; random when omitted.
    #[arg(long)]
    pub seed: Option<u64>,
    /// Write a predicted-mask histogram every N steps (default: 10).
    #[arg(long)]
    pub summary_every: Option<usize>,
    /// Disable flips, brightness and hue jitter.
    #[arg(long)]
    pub no_augment: bool,
    /// Skip samples that fail to load instead of aborting.
    #[arg(long)]
    pub permissive: bool,
    /// Backend to use (ndarray or wgpu if enabled).
    #[arg(long, value_enum)]
    pub backend: Option<BackendKind>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamSettings {
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
}

impl Default for AdamSettings {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

/// Fully resolved training options: command line, then config file, then defaults.
#[derive(Debug, Clone)]
pub struct TrainSettings {
    pub data: DataOpts,
    pub epochs: usize,
    pub learning_rate: f64,
    pub batch_size: usize,
    pub height: u32,
    pub width: u32,
    pub logdir: PathBuf,
    pub ckdir: PathBuf,
    pub seed: Option<u64>,
    pub summary_every: usize,
    pub augment: bool,
    pub permissive: bool,
    pub adam: AdamSettings,
    pub model: UNetConfig,
}

impl TrainSettings {
    pub fn resolve(args: &TrainArgs, file: TrainConfigFile) -> anyhow::Result<Self> {
        let defaults = DataOpts::default();
        let data = DataOpts::resolve(
            &args.data,
            DataOpts {
                data_root: file.data_root.unwrap_or(defaults.data_root),
                train_csv: file.train.unwrap_or(defaults.train_csv),
                test_csv: file.test.unwrap_or(defaults.test_csv),
            },
        );

        let model_defaults = UNetConfig::default();
        let model = UNetConfig {
            classes: args
                .channels
                .or(file.channels)
                .unwrap_or(DEFAULT_CHANNELS),
            base_filters: file.model.base_filters.unwrap_or(model_defaults.base_filters),
            depth: file.model.depth.unwrap_or(model_defaults.depth),
            ..model_defaults
        };
        let adam_defaults = AdamSettings::default();

        let settings = Self {
            data,
            epochs: args.epochs.or(file.epochs).unwrap_or(DEFAULT_EPOCHS),
            learning_rate: args
                .learning_rate
                .or(file.learning_rate)
                .unwrap_or(DEFAULT_LEARNING_RATE),
            batch_size: args
                .batch_size
                .or(file.batch_size)
                .unwrap_or(DEFAULT_BATCH_SIZE),
            height: args.height.or(file.height).unwrap_or(DEFAULT_HEIGHT),
            width: args.width.or(file.width).unwrap_or(DEFAULT_WIDTH),
            logdir: args
                .logdir
                .clone()
                .or(file.logdir)
                .unwrap_or_else(|| PathBuf::from(cli_support::DEFAULT_LOGDIR)),
            ckdir: args.checkpoint.resolve(file.ckdir),
            seed: args.seed.or(file.seed),
            summary_every: args
                .summary_every
                .or(file.summary_every)
                .unwrap_or(DEFAULT_SUMMARY_EVERY),
            augment: !args.no_augment && file.augment.unwrap_or(true),
            permissive: args.permissive || file.permissive.unwrap_or(false),
            adam: AdamSettings {
                beta1: file.adam.beta1.unwrap_or(adam_defaults.beta1),
                beta2: file.adam.beta2.unwrap_or(adam_defaults.beta2),
                epsilon: file.adam.epsilon.unwrap_or(adam_defaults.epsilon),
            },
            model,
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.batch_size == 0 {
            anyhow::bail!("batch size must be at least 1");
        }
        if self.summary_every == 0 {
            anyhow::bail!("summary interval must be at least 1 step");
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            anyhow::bail!("learning rate must be positive, got {}", self.learning_rate);
        }
        self.model
            .validate_input_size(self.height as usize, self.width as usize)
            .map_err(|e| anyhow::anyhow!("invalid model geometry: {e}"))
    }

    /// Training-side dataset options; the test side is derived with `DatasetConfig::eval`.
    pub fn dataset_config(&self) -> DatasetConfig {
        let cfg = DatasetConfig {
            target_size: Some((self.width, self.height)),
            seed: self.seed,
            permissive_errors: self.permissive,
            ..Default::default()
        };
        if self.augment {
            cfg
        } else {
            DatasetConfig {
                shuffle: true,
                ..cfg.eval()
            }
        }
    }

    pub fn adam_config(&self) -> AdamConfig {
        AdamConfig::new()
            .with_beta_1(self.adam.beta1)
            .with_beta_2(self.adam.beta2)
            .with_epsilon(self.adam.epsilon)
    }
}

pub fn validate_backend_choice(kind: BackendKind) -> anyhow::Result<()> {
    let built_wgpu = cfg!(feature = "backend-wgpu");
    match (kind, built_wgpu) {
        (BackendKind::Wgpu, false) => {
            anyhow::bail!("backend-wgpu feature not enabled; rebuild with --features backend-wgpu or choose ndarray backend")
        }
        (BackendKind::NdArray, true) => {
            tracing::warn!("built with backend-wgpu; the WGPU backend is used despite --backend ndarray");
        }
        _ => {}
    }
    Ok(())
}

/// Install the fmt subscriber; `RUST_LOG` overrides the default `info` filter.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

pub fn scalar_value<B: Backend>(t: Tensor<B, 1>) -> f32 {
    t.into_data()
        .to_vec::<f32>()
        .unwrap_or_default()
        .first()
        .copied()
        .unwrap_or(0.0)
}

pub struct StepOutput<B: AutodiffBackend> {
    pub model: UNet<B>,
    /// Batch IOU before the update.
    pub iou: f32,
    /// Detached predictions `[N, C, H, W]`.
    pub pred: Tensor<B::InnerBackend, 4>,
}

/// One Adam update on a batch, minimizing `-sparse_iou`.
pub fn train_step<B, O>(
    model: UNet<B>,
    optim: &mut O,
    images: Tensor<B, 4>,
    masks: Tensor<B, 4>,
    learning_rate: f64,
) -> StepOutput<B>
where
    B: AutodiffBackend,
    O: Optimizer<UNet<B>, B>,
{
    let pred = model.forward(images);
    let loss = iou_loss(pred.clone(), masks);
    let iou = -scalar_value(loss.clone().inner());
    let grads = GradientsParams::from_grads(loss.backward(), &model);
    let model = optim.step(learning_rate, model, grads);
    StepOutput {
        model,
        iou,
        pred: pred.inner(),
    }
}

#[derive(Debug, Clone)]
pub struct EvalReport {
    /// Sample-weighted mean IOU over all batches.
    pub mean_iou: f32,
    pub per_class: Vec<f32>,
    pub samples: usize,
    pub batches: usize,
    /// Rendered mask of the first sample seen.
    pub first_prediction: Option<GrayImage>,
}

/// Score `model` over a full pass of `iter` (rewound to its first epoch).
pub fn evaluate<B: Backend>(
    model: &UNet<B>,
    iter: &mut BatchIter,
    batch_size: usize,
    device: &B::Device,
) -> anyhow::Result<EvalReport> {
    iter.reset(0);
    let mut per_class_sum = vec![0.0f64; model.classes()];
    let mut samples = 0usize;
    let mut batches = 0usize;
    let mut first_prediction = None;

    while let Some(batch) = iter.next_batch::<B>(batch_size, device)? {
        let n = batch.len();
        let pred = model.forward(batch.images);
        if first_prediction.is_none() {
            let [_, c, h, w] = pred.dims();
            let first = pred.clone().slice([0..1, 0..c, 0..h, 0..w]);
            first_prediction = prediction_to_masks(first).into_iter().next();
        }
        for (sum, iou) in per_class_sum.iter_mut().zip(per_class_iou(pred, batch.masks)) {
            *sum += scalar_value(iou) as f64 * n as f64;
        }
        samples += n;
        batches += 1;
    }

    let per_class: Vec<f32> = per_class_sum
        .iter()
        .map(|s| if samples > 0 { (s / samples as f64) as f32 } else { 0.0 })
        .collect();
    let mean_iou = if per_class.is_empty() {
        0.0
    } else {
        per_class.iter().sum::<f32>() / per_class.len() as f32
    };
    Ok(EvalReport {
        mean_iou,
        per_class,
        samples,
        batches,
        first_prediction,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct EpochReport {
    pub epoch: usize,
    pub steps: usize,
    /// Mean of the per-step training IOU.
    pub train_iou: f32,
    pub test_iou: f32,
    pub test_samples: usize,
}

#[derive(Debug, Clone, Default)]
pub struct TrainReport {
    pub epochs: Vec<EpochReport>,
    pub global_step: u64,
    pub checkpoint_dir: PathBuf,
}

struct Summaries {
    train: SummaryWriter,
    test: SummaryWriter,
}

/// Full training run on backend `B`; the checkpoint is saved even when an epoch fails.
pub fn train<B: AutodiffBackend>(
    settings: &TrainSettings,
    device: &B::Device,
) -> anyhow::Result<TrainReport> {
    settings.validate()?;
    let train_records = count_records(&settings.data.train_csv)
        .with_context(|| format!("counting {}", settings.data.train_csv.display()))?;
    let test_records = count_records(&settings.data.test_csv)
        .with_context(|| format!("counting {}", settings.data.test_csv.display()))?;
    tracing::info!(train_records, test_records, "found image/mask pairs");

    let stamp = run_stamp();
    let mut summaries = Summaries {
        train: SummaryWriter::create(settings.logdir.join("train").join(&stamp))?,
        test: SummaryWriter::create(settings.logdir.join("test").join(&stamp))?,
    };

    let manager = CheckpointManager::new(&settings.ckdir);
    let mut model = UNet::<B>::new(settings.model, device);
    let mut optim = settings.adam_config().init::<B, UNet<B>>();
    let mut state = match manager.prepare()? {
        Some(saved) => {
            if saved.model != settings.model
                || (saved.height, saved.width) != (settings.height, settings.width)
            {
                anyhow::bail!(
                    "checkpoint in {} was trained with {:?} at {}x{}; requested {:?} at {}x{}",
                    manager.dir().display(),
                    saved.model,
                    saved.height,
                    saved.width,
                    settings.model,
                    settings.height,
                    settings.width
                );
            }
            tracing::info!("restoring from {}", manager.dir().display());
            model = manager.load_model::<B>(saved.model, device)?;
            optim = manager.load_optimizer::<B, _>(optim, device)?;
            saved
        }
        None => TrainingState::new(settings.model, settings.height, settings.width),
    };

    let (mut train_iter, mut test_iter) = build_train_test_iters(
        &settings.data.train_csv,
        &settings.data.test_csv,
        &settings.data.data_root,
        settings.dataset_config(),
    )?;
    tracing::info!(
        augmentation = %settings.dataset_config().pipeline().describe(),
        "input pipeline ready"
    );
    for (split, iter) in [("train", &train_iter), ("test", &test_iter)] {
        let summary = summarize_pairs(iter.indices(), Some((settings.width, settings.height)));
        if summary.problems() > 0 {
            tracing::warn!(split, ?summary, "some image/mask pairs look unusable");
        }
    }

    let mut report = TrainReport {
        checkpoint_dir: manager.dir().to_path_buf(),
        ..Default::default()
    };
    let outcome = run_epochs(
        settings,
        device,
        &mut model,
        &mut optim,
        &mut state,
        &mut train_iter,
        &mut test_iter,
        &mut summaries,
        &mut report,
    );

    let saved = manager.save(&model, &optim, &state);
    if saved.is_ok() {
        tracing::info!(
            global_step = state.global_step,
            "saved checkpoint to {}",
            manager.dir().display()
        );
    }
    outcome?;
    saved?;
    summaries.train.flush()?;
    summaries.test.flush()?;
    report.global_step = state.global_step;
    Ok(report)
}

#[allow(clippy::too_many_arguments)]
fn run_epochs<B, O>(
    settings: &TrainSettings,
    device: &B::Device,
    model: &mut UNet<B>,
    optim: &mut O,
    state: &mut TrainingState,
    train_iter: &mut BatchIter,
    test_iter: &mut BatchIter,
    summaries: &mut Summaries,
    report: &mut TrainReport,
) -> anyhow::Result<()>
where
    B: AutodiffBackend,
    O: Optimizer<UNet<B>, B>,
{
    for epoch in 0..settings.epochs {
        train_iter.reset(state.epochs_completed);
        let mut iou_sum = 0.0f32;
        let mut steps = 0usize;

        while let Some(batch) = train_iter.next_batch::<B>(settings.batch_size, device)? {
            let out = train_step(
                model.clone(),
                optim,
                batch.images,
                batch.masks,
                settings.learning_rate,
            );
            *model = out.model;
            state.global_step += 1;
            steps += 1;
            iou_sum += out.iou;

            summaries.train.add_scalar(IOU_TAG, out.iou, state.global_step)?;
            if state.global_step % settings.summary_every as u64 == 0 {
                let values = out.pred.into_data().to_vec::<f32>().unwrap_or_default();
                summaries
                    .train
                    .add_histogram(MASK_TAG, &values, state.global_step)?;
            }
            tracing::debug!(step = state.global_step, iou = out.iou, "train step");
        }
        summaries.train.flush()?;

        let eval = evaluate(&model.valid(), test_iter, settings.batch_size, device)?;
        summaries
            .test
            .add_scalar(IOU_TAG, eval.mean_iou, state.global_step)?;
        if let Some(mask) = &eval.first_prediction {
            summaries.test.add_image(MASK_TAG, mask, state.global_step)?;
        }
        summaries.test.flush()?;

        state.epochs_completed += 1;
        let train_iou = if steps > 0 { iou_sum / steps as f32 } else { 0.0 };
        tracing::info!(
            epoch,
            global_step = state.global_step,
            train_iou,
            test_iou = eval.mean_iou,
            test_samples = eval.samples,
            "epoch finished"
        );
        report.epochs.push(EpochReport {
            epoch,
            steps,
            train_iou,
            test_iou: eval.mean_iou,
            test_samples: eval.samples,
        });
    }
    Ok(())
}

pub fn run_train(args: TrainArgs) -> anyhow::Result<()> {
    let file = TrainConfigFile::load(args.config.as_deref())?;
    validate_backend_choice(args.backend.or(file.backend).unwrap_or_default())?;
    let settings = TrainSettings::resolve(&args, file)?;
    tracing::info!(
        epochs = settings.epochs,
        batch_size = settings.batch_size,
        learning_rate = settings.learning_rate,
        classes = settings.model.classes,
        height = settings.height,
        width = settings.width,
        "starting training"
    );

    let device = <TrainBackend as Backend>::Device::default();
    let report = train::<Autodiff<TrainBackend>>(&settings, &device)?;
    if let Some(last) = report.epochs.last() {
        tracing::info!(
            global_step = report.global_step,
            test_iou = last.test_iou,
            "training complete"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> TrainArgs {
        TrainArgs::try_parse_from(std::iter::once("train").chain(argv.iter().copied())).unwrap()
    }

    #[test]
    fn defaults_match_flags_help() {
        let settings = TrainSettings::resolve(&parse(&[]), TrainConfigFile::default()).unwrap();
        assert_eq!(settings.epochs, 8);
        assert_eq!(settings.batch_size, 16);
        assert_eq!(settings.model.classes, 5);
        assert_eq!((settings.height, settings.width), (256, 256));
        assert_eq!(settings.ckdir, PathBuf::from("models"));
        assert_eq!(settings.logdir, PathBuf::from("logdir"));
        assert_eq!(settings.data.data_root, cli_support::DEFAULT_DATA_ROOT);
        assert!(settings.augment);
        assert_eq!(settings.adam, AdamSettings::default());
    }

    #[test]
    fn command_line_beats_config_file() {
        let file = TrainConfigFile::from_toml(
            "epochs = 3\nbatch_size = 4\nheight = 64\nwidth = 64\ndata_root = \"file/\"\n[adam]\nbeta1 = 0.5\n",
        )
        .unwrap();
        let args = parse(&["--epochs", "1", "-w", "32", "--train", "t.csv"]);
        let settings = TrainSettings::resolve(&args, file).unwrap();
        assert_eq!(settings.epochs, 1);
        assert_eq!(settings.batch_size, 4);
        assert_eq!((settings.height, settings.width), (64, 32));
        assert_eq!(settings.data.data_root, "file/");
        assert_eq!(settings.data.train_csv, PathBuf::from("t.csv"));
        assert_eq!(settings.adam.beta1, 0.5);
    }

    #[test]
    fn geometry_must_survive_pooling() {
        let err = TrainSettings::resolve(&parse(&["--height", "100"]), TrainConfigFile::default())
            .unwrap_err();
        assert!(err.to_string().contains("geometry"));
        assert!(
            TrainSettings::resolve(&parse(&["--batch-size", "0"]), TrainConfigFile::default())
                .is_err()
        );
    }

    #[test]
    fn huge_model_depth_is_a_config_error() {
        let file = TrainConfigFile::from_toml("[model]\ndepth = 64\n").unwrap();
        let err = TrainSettings::resolve(&parse(&[]), file).unwrap_err();
        assert!(err.to_string().contains("invalid model geometry"));
    }

    #[test]
    fn no_augment_keeps_shuffling() {
        let settings =
            TrainSettings::resolve(&parse(&["--no-augment", "--seed", "7"]), TrainConfigFile::default())
                .unwrap();
        let cfg = settings.dataset_config();
        assert!(cfg.shuffle);
        assert_eq!(cfg.seed, Some(7));
        assert!(cfg.pipeline().is_identity());
        assert_eq!(cfg.target_size, Some((256, 256)));
    }
}
