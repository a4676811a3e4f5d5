use std::path::PathBuf;

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use tch::{nn, nn::ModuleT, nn::OptimizerConfig, Device, Kind, Tensor};
use tracing::{info, warn};

use crate::checkpoint::{float_literal, round_to, CheckpointWriter};
use crate::config::TrainConfig;
use crate::data::ImageFolder;
use crate::model::AddLayerAlexNet;
use crate::weights::inserted_weight_stats;

/// `"%23s%-9s%-13s"` of the batch counter, label and loss.
pub fn batch_line(num_batches: u64, loss: f64) -> String {
    format!(
        "{:>23}{:<9}{:<13}",
        format!("the {num_batches}th batch, "),
        "loss is: ",
        float_literal(round_to(loss, 8))
    )
}

pub fn accuracy_line(label: &str, acc: f64) -> String {
    format!("{label} Accuracy :{}", float_literal(acc))
}

#[derive(Debug, Clone, Copy)]
pub struct Schedule {
    pub epochs: i64,
    pub eval_every: i64,
}

impl Schedule {
    pub fn evaluates(&self, epoch: i64) -> bool {
        epoch % self.eval_every == 0
    }
}

pub struct Trainer<'a> {
    net: &'a AddLayerAlexNet,
    vs: &'a nn::VarStore,
    opt: nn::Optimizer,
    device: Device,
    batch_size: usize,
    eval_batch_size: usize,
    rng: StdRng,
    num_batches: u64,
}

impl<'a> Trainer<'a> {
    /// SGD over every variable that still requires grad.
    pub fn new(net: &'a AddLayerAlexNet, vs: &'a nn::VarStore, cfg: &TrainConfig) -> Result<Self> {
        let sgd = nn::Sgd { momentum: cfg.momentum, ..Default::default() };
        let opt = sgd.build(vs, cfg.lr)?;
        Ok(Self {
            net,
            vs,
            opt,
            device: cfg.device,
            batch_size: cfg.batch_size,
            eval_batch_size: cfg.eval_batch_size,
            rng: StdRng::seed_from_u64(cfg.seed),
            num_batches: 0,
        })
    }

    pub fn num_batches(&self) -> u64 {
        self.num_batches
    }

    pub fn train_batch(&mut self, xs: &Tensor, ys: &Tensor) -> f64 {
        let logits = self.net.forward_t(xs, true);
        let loss = logits.cross_entropy_for_logits(ys);
        self.opt.backward_step(&loss);
        loss.double_value(&[])
    }

    /// One shuffled pass; the batch counter keeps running across epochs.
    pub fn train_epoch(&mut self, train: &ImageFolder, epoch: i64) -> Result<()> {
        let mut order = train.sequential();
        order.shuffle(&mut self.rng);

        let pb = ProgressBar::new(order.len() as u64);
        pb.set_style(
            ProgressStyle::with_template(
                "  [ep {prefix}] {elapsed_precise} │{bar:48.magenta/blue}│ {percent:>3}% {pos}/{len} • eta {eta_precise} • {msg}",
            )?
            .progress_chars("█▓░"),
        );
        pb.set_prefix(epoch.to_string());

        for (bxs, bys) in train.batches(&order, self.batch_size) {
            let bs = bys.size()[0] as u64;
            let loss = self.train_batch(&bxs.to(self.device), &bys.to(self.device));
            let line = batch_line(self.num_batches, loss);
            pb.suspend(|| info!("{}", line));
            pb.set_message(format!("loss {loss:.4}"));
            pb.inc(bs);
            self.num_batches += 1;
        }
        pb.finish_and_clear();
        Ok(())
    }

    /// Fraction of correctly classified samples, `None` for an empty split.
    pub fn accuracy(&self, data: &ImageFolder) -> Option<f64> {
        if data.is_empty() {
            return None;
        }
        let order = data.sequential();
        let (correct, total) = tch::no_grad(|| {
            let mut correct = 0i64;
            let mut total = 0i64;
            for (bxs, bys) in data.batches(&order, self.eval_batch_size) {
                let bys = bys.to(self.device);
                let logits = self.net.forward_t(&bxs.to(self.device), false);
                let preds = logits.argmax(-1, false);
                correct += preds.eq_tensor(&bys).sum(Kind::Int64).int64_value(&[]);
                total += bys.size()[0];
            }
            (correct, total)
        });
        (total > 0).then(|| correct as f64 / total as f64)
    }

    fn accuracy_or_zero(&self, data: &ImageFolder) -> f64 {
        match self.accuracy(data) {
            Some(acc) => round_to(acc, 3),
            None => {
                warn!("no images to evaluate in {}", data.root().display());
                0.0
            }
        }
    }

    pub fn test(&self, test: &ImageFolder) -> f64 {
        let acc = self.accuracy_or_zero(test);
        info!("{}", accuracy_line("Test", acc));
        acc
    }

    /// Logs validation then test accuracy; returns the test accuracy.
    pub fn val_test(&self, val: &ImageFolder, test: &ImageFolder) -> f64 {
        let val_acc = self.accuracy_or_zero(val);
        let test_acc = self.accuracy_or_zero(test);
        info!("{}", accuracy_line("Val ", val_acc));
        info!("{}", accuracy_line("Test", test_acc));
        test_acc
    }

    pub fn log_inserted_stats(&self) {
        for s in inserted_weight_stats(self.vs) {
            info!("{}  sum  is: {}", s.name, s.sum);
            info!("{}  mean is: {}", s.name, s.mean);
            info!("{}  std  is: {}", s.name, s.std);
        }
    }

    /// No validation split: a checkpoint every epoch, named by the last test accuracy.
    /// Returns the path written after each epoch.
    pub fn train_test(
        &mut self,
        train: &ImageFolder,
        test: &ImageFolder,
        writer: &CheckpointWriter,
        schedule: Schedule,
    ) -> Result<Vec<PathBuf>> {
        info!("Start training.");
        let mut acc = 0.0;
        let mut saved = Vec::new();
        for epoch in 0..schedule.epochs {
            info!("Epoch: {}", epoch);
            self.train_epoch(train, epoch)?;
            if schedule.evaluates(epoch) {
                acc = self.test(test);
            }
            saved.push(writer.save(self.vs, acc)?);
        }
        info!("Finished training.");
        Ok(saved)
    }

    /// Checkpoints after each validation round; 1x1 weight stats after every epoch.
    pub fn train_val_test(
        &mut self,
        train: &ImageFolder,
        val: &ImageFolder,
        test: &ImageFolder,
        writer: &CheckpointWriter,
        schedule: Schedule,
    ) -> Result<Vec<PathBuf>> {
        info!("Start training.");
        let mut saved = Vec::new();
        for epoch in 0..schedule.epochs {
            info!("Epoch: {}", epoch);
            self.train_epoch(train, epoch)?;
            if schedule.evaluates(epoch) {
                let acc = self.val_test(val, test);
                saved.push(writer.save(self.vs, acc)?);
            }
            self.log_inserted_stats();
        }
        info!("Finished training.");
        Ok(saved)
    }
}
