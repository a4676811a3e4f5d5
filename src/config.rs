use std::path::PathBuf;

use anyhow::{ensure, Result};
use tch::Device;

use crate::checkpoint::CheckpointWriter;
use crate::cli::Cli;
use crate::dataset::{DatasetKind, DatasetLayout};
use crate::error::PruneError;

pub const SUPPORTED_ARCH: &str = "alexnet";

/// Runs with a validation split write here, with a `1x1` name prefix.
const VAL_RUN_DIR: &str = "./1x1models";
const VAL_RUN_PREFIX: &str = "1x1";
/// Runs without one write here, unprefixed.
const TEST_RUN_DIR: &str = "./models";

/// Everything a run needs, resolved from the command line.
#[derive(Debug, Clone)]
pub struct TrainConfig {
    pub arch: String,
    pub data_name: String,
    pub dataset: DatasetKind,
    pub layout: DatasetLayout,
    pub zero_train: bool,
    pub checkpoint: PathBuf,
    pub batch_size: usize,
    pub eval_batch_size: usize,
    pub epochs: i64,
    pub eval_every: i64,
    pub lr: f64,
    pub momentum: f64,
    pub workers: usize,
    pub seed: u64,
    pub device: Device,
    pub log_dir: PathBuf,
    pub log_name: String,
    pub predict: Option<PathBuf>,
}

impl TrainConfig {
    pub fn from_cli(cli: Cli) -> Result<Self> {
        if cli.arch != SUPPORTED_ARCH {
            return Err(PruneError::UnsupportedArch(cli.arch).into());
        }
        let dataset = DatasetKind::from_name(&cli.data_name)?;
        ensure!(cli.batch_size > 0, "--batch_size must be positive");
        ensure!(cli.eval_batch_size > 0, "--eval_batch_size must be positive");
        ensure!(cli.eval_every > 0, "--eval_every must be positive");

        let log_name = cli
            .log_name
            .unwrap_or_else(|| format!("{}_{}.log", cli.arch, cli.data_name));
        let device = if cli.cpu { Device::Cpu } else { Device::cuda_if_available() };

        Ok(Self {
            layout: dataset.layout(&cli.data_root),
            epochs: cli.epochs.unwrap_or_else(|| dataset.default_epochs()),
            workers: cli.workers.unwrap_or_else(num_cpus::get).max(1),
            arch: cli.arch,
            data_name: cli.data_name,
            dataset,
            zero_train: cli.zero_train,
            checkpoint: cli.checkpoint,
            batch_size: cli.batch_size,
            eval_batch_size: cli.eval_batch_size,
            eval_every: cli.eval_every,
            lr: cli.lr,
            momentum: cli.momentum,
            seed: cli.seed,
            device,
            log_dir: cli.log_dir,
            log_name,
            predict: cli.predict,
        })
    }

    pub fn checkpoint_writer(&self) -> CheckpointWriter {
        if self.layout.val.is_some() {
            CheckpointWriter::new(VAL_RUN_DIR, VAL_RUN_PREFIX, &self.arch, &self.data_name)
        } else {
            CheckpointWriter::new(TEST_RUN_DIR, "", &self.arch, &self.data_name)
        }
    }
}
