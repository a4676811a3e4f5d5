use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tch::nn;
use tracing::info;

pub fn round_to(x: f64, digits: i32) -> f64 {
    let scale = 10f64.powi(digits);
    (x * scale).round() / scale
}

/// Prints a float the way it reads as a literal: `0.789`, `0.8`, `1.0`,
/// switching to `1.23e-06` below 1e-4 and at or above 1e16.
pub fn float_literal(x: f64) -> String {
    let magnitude = x.abs();
    if x.is_finite() && x != 0.0 && !(1e-4..1e16).contains(&magnitude) {
        let sci = format!("{x:e}");
        let (mantissa, exp) = sci.split_once('e').unwrap_or((sci.as_str(), "0"));
        let exp: i32 = exp.parse().unwrap_or(0);
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{mantissa}e{sign}{:02}", exp.abs())
    } else if x.is_finite() && x.fract() == 0.0 {
        format!("{x:.1}")
    } else {
        format!("{x}")
    }
}

/// Writes `<dir>/<prefix><arch>_<data_name>_<acc>.safetensors` after each evaluation round.
#[derive(Debug, Clone)]
pub struct CheckpointWriter {
    dir: PathBuf,
    prefix: String,
    arch: String,
    data_name: String,
}

impl CheckpointWriter {
    pub fn new(dir: impl Into<PathBuf>, prefix: &str, arch: &str, data_name: &str) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.to_string(),
            arch: arch.to_string(),
            data_name: data_name.to_string(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, acc: f64) -> PathBuf {
        self.dir.join(format!(
            "{}{}_{}_{}.safetensors",
            self.prefix,
            self.arch,
            self.data_name,
            float_literal(round_to(acc, 3))
        ))
    }

    pub fn save(&self, vs: &nn::VarStore, acc: f64) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create checkpoint dir {}", self.dir.display()))?;
        let path = self.path_for(acc);
        vs.save(&path)
            .with_context(|| format!("save checkpoint {}", path.display()))?;
        info!("saved {}", path.display());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    #[test]
    fn literals_keep_one_decimal_for_whole_numbers() {
        assert_eq!(float_literal(1.0), "1.0");
        assert_eq!(float_literal(0.0), "0.0");
        assert_eq!(float_literal(0.8), "0.8");
        assert_eq!(float_literal(round_to(0.78912, 3)), "0.789");
        assert_eq!(float_literal(round_to(0.12345678912, 8)), "0.12345679");
    }

    #[test]
    fn tiny_and_huge_values_use_exponent_form() {
        assert_eq!(float_literal(round_to(0.00000123, 8)), "1.23e-06");
        assert_eq!(float_literal(0.00001), "1e-05");
        assert_eq!(float_literal(-0.00005), "-5e-05");
        assert_eq!(float_literal(0.0001), "0.0001");
        assert_eq!(float_literal(1e16), "1e+16");
        assert_eq!(float_literal(1e15), "1000000000000000.0");
    }

    #[test]
    fn names_follow_prefix_arch_dataset_accuracy() {
        let w = CheckpointWriter::new("1x1models", "1x1", "alexnet", "Flower102");
        assert_eq!(
            w.path_for(0.7894),
            Path::new("1x1models/1x1alexnet_Flower102_0.789.safetensors")
        );
        let w = CheckpointWriter::new("models", "", "alexnet", "Birds200");
        assert_eq!(w.path_for(0.5), Path::new("models/alexnet_Birds200_0.5.safetensors"));
    }

    #[test]
    fn save_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let vs = nn::VarStore::new(Device::Cpu);
        let _ = vs.root().zeros("w", &[2, 2]);
        let w = CheckpointWriter::new(dir.path().join("nested").join("out"), "", "alexnet", "Birds200");
        let path = w.save(&vs, 0.25).unwrap();
        assert!(path.exists());

        let loaded = tch::Tensor::read_safetensors(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].1.kind(), Kind::Float);
    }
}
