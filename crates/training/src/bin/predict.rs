use anyhow::Context;
use clap::Parser;
use cli_support::{BackendKind, CheckpointArgs, DEFAULT_DATA_ROOT};
use seg_dataset::{load_rgb, read_pair_csv};
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use training::predict::{mask_file_name, predict_mask};
use training::util::{init_tracing, validate_backend_choice};
use training::{load_unet_from_checkpoint, TrainBackend};

#[derive(Parser, Debug)]
#[command(
    name = "predict",
    about = "Write predicted masks for images using a U-Net checkpoint"
)]
struct Args {
    #[command(flatten)]
    checkpoint: CheckpointArgs,
    /// Image to segment; repeat for several.
    #[arg(long = "image")]
    images: Vec<PathBuf>,
    /// Csv whose first column lists images (header skipped).
    #[arg(long)]
    csv: Option<PathBuf>,
    /// Prefix for filenames in the csv.
    #[arg(long, default_value = DEFAULT_DATA_ROOT)]
    data_root: String,
    /// Output directory for `<stem>_mask.png` files (repeated stems get `_<n>`).
    #[arg(long, default_value = "predictions")]
    out_dir: PathBuf,
    /// Backend to use (ndarray or wgpu if enabled).
    #[arg(long, value_enum, default_value_t = BackendKind::NdArray)]
    backend: BackendKind,
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();
    validate_backend_choice(args.backend)?;

    let mut inputs = args.images.clone();
    if let Some(csv) = &args.csv {
        inputs.extend(
            read_pair_csv(csv, &args.data_root)?
                .into_iter()
                .map(|pair| pair.image),
        );
    }
    if inputs.is_empty() {
        anyhow::bail!("nothing to predict; pass --image or --csv");
    }

    let ckdir = args.checkpoint.resolve(None);
    let device = <TrainBackend as burn::tensor::backend::Backend>::Device::default();
    let (model, state) = load_unet_from_checkpoint::<TrainBackend>(&ckdir, &device)
        .with_context(|| format!("loading checkpoint from {}", ckdir.display()))?;
    fs::create_dir_all(&args.out_dir)
        .with_context(|| format!("creating {}", args.out_dir.display()))?;

    let expected = Some((state.width, state.height));
    let mut written = 0usize;
    let mut used_names = HashSet::new();
    for path in &inputs {
        let image = load_rgb(path, expected)?;
        let Some(mask) = predict_mask(&model, &image, &device) else {
            tracing::warn!("no prediction for {}", path.display());
            continue;
        };
        let out = args.out_dir.join(mask_file_name(path, &mut used_names));
        mask.save(&out)
            .with_context(|| format!("writing {}", out.display()))?;
        tracing::info!("{} -> {}", path.display(), out.display());
        written += 1;
    }
    println!("Wrote {written} masks to {}", args.out_dir.display());
    Ok(())
}
