use clap::{Args, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;

pub const DEFAULT_DATA_ROOT: &str = "../data/data_256_subsample_4x/";
pub const DEFAULT_TRAIN_CSV: &str = "./train.csv";
pub const DEFAULT_TEST_CSV: &str = "./test.csv";
pub const DEFAULT_CKDIR: &str = "models";
pub const DEFAULT_LOGDIR: &str = "logdir";

/// Compute backend; wgpu requires the `backend-wgpu` feature.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    #[default]
    #[value(name = "ndarray")]
    #[serde(rename = "ndarray")]
    NdArray,
    Wgpu,
}

/// Where the image/mask CSV listings live.
///
/// Fields are optional so a config file can fill whatever the command line leaves out.
#[derive(Debug, Clone, Default, Args)]
pub struct DataArgs {
    /// Prefix for filenames in csv files (default: ../data/data_256_subsample_4x/).
    #[arg(long)]
    pub data_root: Option<String>,
    /// Training csv file (default: ./train.csv).
    #[arg(long = "train")]
    pub train_csv: Option<PathBuf>,
    /// Test csv file (default: ./test.csv).
    #[arg(long = "test")]
    pub test_csv: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct DataOpts {
    pub data_root: String,
    pub train_csv: PathBuf,
    pub test_csv: PathBuf,
}

impl Default for DataOpts {
    fn default() -> Self {
        Self {
            data_root: DEFAULT_DATA_ROOT.to_string(),
            train_csv: PathBuf::from(DEFAULT_TRAIN_CSV),
            test_csv: PathBuf::from(DEFAULT_TEST_CSV),
        }
    }
}

impl DataOpts {
    /// Command line wins over `fallback`.
    pub fn resolve(args: &DataArgs, fallback: DataOpts) -> Self {
        Self {
            data_root: args.data_root.clone().unwrap_or(fallback.data_root),
            train_csv: args.train_csv.clone().unwrap_or(fallback.train_csv),
            test_csv: args.test_csv.clone().unwrap_or(fallback.test_csv),
        }
    }
}

/// Checkpoint directory shared by train/eval/predict.
#[derive(Debug, Clone, Args)]
pub struct CheckpointArgs {
    /// Checkpoint directory (default: models).
    #[arg(long)]
    pub ckdir: Option<PathBuf>,
}

impl CheckpointArgs {
    pub fn resolve(&self, fallback: Option<PathBuf>) -> PathBuf {
        self.ckdir
            .clone()
            .or(fallback)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CKDIR))
    }
}
