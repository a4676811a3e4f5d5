mod checkpoint;
mod cli;
mod config;
mod data;
mod dataset;
mod error;
mod logging;
mod model;
mod predict;
mod train;
mod weights;

use std::time::Instant;

use anyhow::{bail, Result};
use clap::Parser;
use tch::nn;
use tracing::{info, warn};

use cli::Cli;
use config::TrainConfig;
use data::ImageFolder;
use model::AddLayerAlexNet;
use train::{Schedule, Trainer};

fn main() -> Result<()> {
    let start_time = Instant::now();
    let cfg = TrainConfig::from_cli(Cli::parse())?;
    let _log_guard = logging::init(&cfg.log_dir, &cfg.log_name)?;

    tch::set_num_threads(cfg.workers as i32);
    tch::set_num_interop_threads(1);
    tch::manual_seed(cfg.seed as i64);
    rayon::ThreadPoolBuilder::new()
        .num_threads(cfg.workers)
        .build_global()?;
    info!("Using device: {:?} | threads: {}", cfg.device, cfg.workers);

    let classes = data::list_classes(&cfg.layout.train)?;
    let num_classes = cfg.dataset.num_classes();
    if classes.len() as i64 > num_classes {
        bail!(
            "{} has {} classes but {} expects {}",
            cfg.layout.train.display(),
            classes.len(),
            cfg.dataset.dir_name(),
            num_classes
        );
    } else if classes.len() as i64 != num_classes {
        warn!("found {} classes, model head has {}", classes.len(), num_classes);
    }

    // ===== MODEL =====
    let mut vs = nn::VarStore::new(cfg.device);
    let net = AddLayerAlexNet::new(&vs.root(), num_classes);
    info!("Built 1x1 {} with {} classes", cfg.arch, net.num_classes());

    if cfg.zero_train {
        info!("Training from scratch, all layers trainable");
    } else {
        let report = weights::load_checkpoint(&mut vs, &cfg.checkpoint)?;
        info!(
            "Loaded {:?} checkpoint {} (copied {}, 1x1 reset {})",
            report.schema,
            cfg.checkpoint.display(),
            report.copied,
            report.set_to_one
        );
        let frozen = model::freeze_original(&vs);
        info!("Frozen original params: {}", frozen);
    }

    if let Some(path) = &cfg.predict {
        let p = predict::predict_image(&net, &classes, path, cfg.device)?;
        match &p.truth {
            Some((label, name)) => info!("true label is: {} ({})", label, name),
            None => info!("true label is: unknown"),
        }
        info!("pred label is: {} ({})", p.label, p.class_name);
        return Ok(());
    }

    // ===== DATA =====
    let train = ImageFolder::open(&cfg.layout.train, &classes, true)?;
    let test = ImageFolder::open(&cfg.layout.test, &classes, false)?;
    if train.is_empty() {
        bail!("no training images under {}", cfg.layout.train.display());
    }

    // ===== TRAIN =====
    let writer = cfg.checkpoint_writer();
    let schedule = Schedule { epochs: cfg.epochs, eval_every: cfg.eval_every };
    let mut trainer = Trainer::new(&net, &vs, &cfg)?;
    info!("Checkpoints go to {}", writer.dir().display());

    let saved = match &cfg.layout.val {
        Some(val_dir) => {
            let val = ImageFolder::open(val_dir, &classes, false)?;
            trainer.train_val_test(&train, &val, &test, &writer, schedule)?
        }
        None => trainer.train_test(&train, &test, &writer, schedule)?,
    };

    info!("Trained {} batches, wrote {} checkpoints", trainer.num_batches(), saved.len());
    info!("Total time: {:.2}s", start_time.elapsed().as_secs_f64());
    Ok(())
}
