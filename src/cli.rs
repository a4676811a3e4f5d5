use std::path::PathBuf;

use clap::{ArgAction, Parser};

/// Fine-tune AlexNet with per-channel 1x1 layers inserted after each conv stage.
///
/// Usage: alexnet-prune --arch alexnet --data_name Flower102
#[derive(Parser, Debug, Clone)]
#[command(name = "alexnet-prune", version)]
pub struct Cli {
    /// Model architecture
    #[arg(long, default_value = "alexnet")]
    pub arch: String,

    /// Dataset name; selects the Flower102 or Birds200 directory layout
    #[arg(long = "data_name", default_value = "Flower102")]
    pub data_name: String,

    /// Train from scratch: skip the checkpoint and keep every layer trainable
    #[arg(
        long = "zero_train",
        default_value_t = false,
        action = ArgAction::Set,
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    pub zero_train: bool,

    /// Directory holding the dataset folders
    #[arg(long = "data_root", default_value = ".")]
    pub data_root: PathBuf,

    /// Pretrained weights (.safetensors or .ot)
    #[arg(
        long,
        default_value = "./1x1models/origin1x1alexnet_Flower102_0.789.safetensors"
    )]
    pub checkpoint: PathBuf,

    #[arg(long = "batch_size", default_value_t = 32)]
    pub batch_size: usize,

    #[arg(long = "eval_batch_size", default_value_t = 1)]
    pub eval_batch_size: usize,

    /// Defaults to 50 for Flower102 and 10 for Birds200
    #[arg(long)]
    pub epochs: Option<i64>,

    /// Evaluate (and checkpoint) when epoch % eval_every == 0
    #[arg(long = "eval_every", default_value_t = 10)]
    pub eval_every: i64,

    #[arg(long, default_value_t = 0.001)]
    pub lr: f64,

    #[arg(long, default_value_t = 0.9)]
    pub momentum: f64,

    /// Threads for image decoding and torch ops (defaults to all CPUs)
    #[arg(long)]
    pub workers: Option<usize>,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// Stay on CPU even if CUDA is available
    #[arg(long)]
    pub cpu: bool,

    #[arg(long = "log_dir", default_value = "./log")]
    pub log_dir: PathBuf,

    /// Defaults to <arch>_<data_name>.log
    #[arg(long = "log_name")]
    pub log_name: Option<String>,

    /// Classify one image with the loaded weights instead of training
    #[arg(long)]
    pub predict: Option<PathBuf>,
}
