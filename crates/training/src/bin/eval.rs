use anyhow::Context;
use clap::Parser;
use cli_support::{BackendKind, CheckpointArgs, DataArgs, DataOpts};
use seg_dataset::{read_pair_csv, BatchIter, DatasetConfig};
use training::util::{evaluate, init_tracing, validate_backend_choice};
use training::{load_unet_from_checkpoint, TrainBackend};

#[derive(Parser, Debug)]
#[command(
    name = "eval",
    about = "Evaluate a U-Net checkpoint on a test csv (mean and per-class IOU)"
)]
struct Args {
    #[command(flatten)]
    data: DataArgs,
    #[command(flatten)]
    checkpoint: CheckpointArgs,
    /// Batch size.
    #[arg(long, default_value_t = 16)]
    batch_size: usize,
    /// Skip samples that fail to load instead of aborting.
    #[arg(long)]
    permissive: bool,
    /// Backend to use (ndarray or wgpu if enabled).
    #[arg(long, value_enum, default_value_t = BackendKind::NdArray)]
    backend: BackendKind,
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();
    validate_backend_choice(args.backend)?;

    let data = DataOpts::resolve(&args.data, DataOpts::default());
    let ckdir = args.checkpoint.resolve(None);
    let device = <TrainBackend as burn::tensor::backend::Backend>::Device::default();
    let (model, state) = load_unet_from_checkpoint::<TrainBackend>(&ckdir, &device)
        .with_context(|| format!("loading checkpoint from {}", ckdir.display()))?;
    println!(
        "Loaded checkpoint {} (global step {}, {} classes, {}x{})",
        ckdir.display(),
        state.global_step,
        state.model.classes,
        state.height,
        state.width
    );

    let cfg = DatasetConfig {
        target_size: Some((state.width, state.height)),
        permissive_errors: args.permissive,
        ..Default::default()
    }
    .eval();
    let pairs = read_pair_csv(&data.test_csv, &data.data_root)?;
    if pairs.is_empty() {
        println!("No samples listed in {}", data.test_csv.display());
        return Ok(());
    }
    let mut iter = BatchIter::from_indices(pairs, cfg)?;
    let report = evaluate(&model, &mut iter, args.batch_size, &device)?;

    println!(
        "Eval: samples={} batches={} mean IOU={:.4}",
        report.samples, report.batches, report.mean_iou
    );
    for (class, iou) in report.per_class.iter().enumerate() {
        println!("  class {class}: IOU={iou:.4}");
    }
    let stats = iter.stats();
    if stats.skipped_errors > 0 {
        println!("  skipped {} unreadable samples", stats.skipped_errors);
    }
    Ok(())
}
