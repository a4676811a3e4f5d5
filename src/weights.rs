use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use half::{bf16, f16};
use safetensors::{tensor::Dtype, SafeTensors};
use tch::{nn, Kind, Tensor};
use tracing::{debug, warn};

use crate::error::PruneError;
use crate::model::{inserted_weight_names, is_inserted_param, pretrained_name_map};

/// Layout of a state dictionary on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schema {
    /// Names match this model exactly (`features11.0.weight`, ...).
    Inserted,
    /// Stock torchvision alexnet (`features.0.weight`, ...).
    PlainAlexNet,
}

#[derive(Debug, Clone, Copy)]
pub struct LoadReport {
    pub schema: Schema,
    pub copied: usize,
    pub set_to_one: usize,
}

// =============== READERS ===============
fn read_safetensors(path: &Path) -> Result<HashMap<String, Tensor>> {
    let bytes = fs::read(path).with_context(|| format!("read file {}", path.display()))?;
    let st = SafeTensors::deserialize(&bytes).with_context(|| "deserialize safetensors")?;
    let mut map = HashMap::new();

    for name in st.names() {
        let tv = st.tensor(name).with_context(|| format!("get tensor {}", name))?;
        let shape: Vec<i64> = tv.shape().iter().map(|&d| d as i64).collect();
        let data = tv.data();

        let t = match tv.dtype() {
            Dtype::F32 => {
                let v: Vec<f32> = bytemuck::pod_collect_to_vec(data);
                Tensor::from_slice(&v)
            }
            Dtype::F16 => {
                let bits: Vec<u16> = bytemuck::pod_collect_to_vec(data);
                let v: Vec<f32> = bits.iter().map(|&h| f16::from_bits(h).to_f32()).collect();
                Tensor::from_slice(&v)
            }
            Dtype::BF16 => {
                let bits: Vec<u16> = bytemuck::pod_collect_to_vec(data);
                let v: Vec<f32> = bits.iter().map(|&h| bf16::from_bits(h).to_f32()).collect();
                Tensor::from_slice(&v)
            }
            Dtype::I64 => {
                let v: Vec<i64> = bytemuck::pod_collect_to_vec(data);
                Tensor::from_slice(&v).to_kind(Kind::Int64)
            }
            Dtype::I32 => {
                let v: Vec<i32> = bytemuck::pod_collect_to_vec(data);
                Tensor::from_slice(&v).to_kind(Kind::Int)
            }
            other => {
                warn!("skipping tensor {} with unsupported dtype {:?}", name, other);
                continue;
            }
        };
        map.insert(name.to_string(), t.reshape(&shape));
    }
    Ok(map)
}

/// Reads `.safetensors` through the safetensors crate, anything else as libtorch named tensors.
pub fn read_state_dict(path: &Path) -> Result<HashMap<String, Tensor>> {
    let raw = match path.extension().and_then(|e| e.to_str()) {
        Some("safetensors") => read_safetensors(path)?,
        _ => Tensor::load_multi(path)
            .with_context(|| format!("load tensors from {}", path.display()))?
            .into_iter()
            .collect(),
    };

    // BN counters are not parameters; `module.` comes from data-parallel wrappers.
    Ok(raw
        .into_iter()
        .filter(|(k, _)| !k.ends_with("num_batches_tracked"))
        .map(|(k, v)| match k.strip_prefix("module.") {
            Some(rest) => (rest.to_string(), v),
            None => (k, v),
        })
        .collect())
}

pub fn detect_schema(src: &HashMap<String, Tensor>) -> Option<Schema> {
    if src.keys().any(|k| k.starts_with("features11.")) {
        Some(Schema::Inserted)
    } else if src.contains_key("features.0.weight") {
        Some(Schema::PlainAlexNet)
    } else {
        None
    }
}

// =============== COPY ===============
fn copy_checked(dst: &mut HashMap<String, Tensor>, name: &str, src: &Tensor) -> Result<()> {
    let d = dst
        .get_mut(name)
        .ok_or_else(|| PruneError::MissingTensor(name.to_string()))?;
    if d.size() != src.size() {
        return Err(PruneError::ShapeMismatch {
            name: name.to_string(),
            expected: d.size(),
            found: src.size(),
        }
        .into());
    }
    tch::no_grad(|| {
        d.copy_(src);
    });
    Ok(())
}

fn load_strict(dst: &mut HashMap<String, Tensor>, src: &HashMap<String, Tensor>) -> Result<usize> {
    let mut unexpected: Vec<&String> = src.keys().filter(|k| !dst.contains_key(*k)).collect();
    unexpected.sort();
    if let Some(name) = unexpected.first() {
        return Err(PruneError::UnexpectedTensor(name.to_string()).into());
    }

    let mut names: Vec<String> = dst.keys().cloned().collect();
    names.sort();
    for name in &names {
        let s = src
            .get(name)
            .ok_or_else(|| PruneError::MissingTensor(name.clone()))?;
        copy_checked(dst, name, s)?;
    }
    Ok(names.len())
}

/// Original tensors land in the non-1x1 slots; every inserted layer restarts at one.
fn load_plain(dst: &mut HashMap<String, Tensor>, src: &HashMap<String, Tensor>) -> Result<(usize, usize)> {
    let pairs = pretrained_name_map();
    let found = src
        .keys()
        .filter(|k| k.starts_with("features.") || k.starts_with("classifier."))
        .count();
    if found != pairs.len() {
        return Err(PruneError::TensorCount { expected: pairs.len(), found }.into());
    }

    for (own, theirs) in &pairs {
        let s = src
            .get(theirs)
            .ok_or_else(|| PruneError::MissingTensor(theirs.clone()))?;
        copy_checked(dst, own, s)?;
    }

    let mut set_to_one = 0usize;
    for (_, d) in dst.iter_mut().filter(|(name, _)| is_inserted_param(name)) {
        tch::no_grad(|| {
            let _ = d.fill_(1.0);
        });
        set_to_one += 1;
    }
    Ok((pairs.len(), set_to_one))
}

/// Fills `vs` from a checkpoint in either supported layout.
pub fn load_checkpoint(vs: &mut nn::VarStore, path: &Path) -> Result<LoadReport> {
    let src = read_state_dict(path)?;
    let schema = detect_schema(&src)
        .ok_or_else(|| PruneError::UnknownSchema(path.display().to_string()))?;
    debug!("checkpoint {} uses {:?} layout ({} tensors)", path.display(), schema, src.len());

    let mut dst = vs.variables();
    let (copied, set_to_one) = match schema {
        Schema::Inserted => (load_strict(&mut dst, &src)?, 0),
        Schema::PlainAlexNet => load_plain(&mut dst, &src)?,
    };
    Ok(LoadReport { schema, copied, set_to_one })
}

// =============== STATS ===============
#[derive(Debug, Clone)]
pub struct WeightStats {
    pub name: String,
    pub sum: f64,
    pub mean: f64,
    pub std: f64,
}

/// Sum, mean and unbiased std of each inserted 1x1 weight.
pub fn inserted_weight_stats(vs: &nn::VarStore) -> Vec<WeightStats> {
    let vars = vs.variables();
    inserted_weight_names()
        .into_iter()
        .filter_map(|name| {
            let t = vars.get(&name)?.detach();
            Some(WeightStats {
                sum: t.sum(Kind::Double).double_value(&[]),
                mean: t.mean(Kind::Double).double_value(&[]),
                std: t.to_kind(Kind::Double).std(true).double_value(&[]),
                name,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AddLayerAlexNet;
    use safetensors::tensor::TensorView;
    use tch::Device;

    fn build(num_classes: i64) -> nn::VarStore {
        let vs = nn::VarStore::new(Device::Cpu);
        let _ = AddLayerAlexNet::new(&vs.root(), num_classes);
        vs
    }

    fn same(a: &Tensor, b: &Tensor) -> bool {
        a.allclose(b, 0.0, 0.0, false)
    }

    #[test]
    fn strict_load_round_trips_saved_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        let saved = build(102);
        saved.save(&path).unwrap();

        let mut fresh = build(102);
        let report = load_checkpoint(&mut fresh, &path).unwrap();
        assert_eq!(report.schema, Schema::Inserted);
        assert_eq!(report.copied, 21);

        let a = saved.variables();
        let b = fresh.variables();
        assert!(same(&a["classifier.6.weight"], &b["classifier.6.weight"]));
        assert!(same(&a["features31.0.bias"], &b["features31.0.bias"]));
    }

    #[test]
    fn strict_load_reads_libtorch_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.ot");
        let saved = build(5);
        saved.save(&path).unwrap();

        let mut fresh = build(5);
        assert_eq!(load_checkpoint(&mut fresh, &path).unwrap().copied, 21);
    }

    #[test]
    fn class_count_mismatch_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        build(10).save(&path).unwrap();

        let mut fresh = build(102);
        let err = load_checkpoint(&mut fresh, &path).unwrap_err();
        match err.downcast_ref::<PruneError>() {
            Some(PruneError::ShapeMismatch { name, expected, found }) => {
                assert!(name.starts_with("classifier.6"));
                assert_eq!(expected[0], 102);
                assert_eq!(found[0], 10);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn plain_alexnet_maps_and_resets_inserted_layers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alexnet.safetensors");
        let source = build(3);
        let vars = source.variables();
        let renamed: Vec<(String, Tensor)> = pretrained_name_map()
            .into_iter()
            .map(|(own, theirs)| (theirs, vars[&own].shallow_clone()))
            .collect();
        Tensor::write_safetensors(&renamed, &path).unwrap();

        let mut fresh = build(3);
        {
            let mut dst = fresh.variables();
            tch::no_grad(|| {
                let _ = dst.get_mut("features22.0.weight").unwrap().fill_(7.0);
            });
        }
        let report = load_checkpoint(&mut fresh, &path).unwrap();
        assert_eq!(report.schema, Schema::PlainAlexNet);
        assert_eq!((report.copied, report.set_to_one), (16, 5));

        let loaded = fresh.variables();
        assert!(same(&loaded["features41.0.weight"], &vars["features41.0.weight"]));
        assert!(same(&loaded["classifier.4.bias"], &vars["classifier.4.bias"]));
        assert_eq!(loaded["features22.0.weight"].max().double_value(&[]), 1.0);
    }

    #[test]
    fn unknown_layout_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("other.safetensors");
        Tensor::write_safetensors(&[("fc.weight", Tensor::ones([2, 2], (Kind::Float, Device::Cpu)))], &path)
            .unwrap();
        let mut vs = build(2);
        let err = load_checkpoint(&mut vs, &path).unwrap_err();
        assert!(matches!(err.downcast_ref::<PruneError>(), Some(PruneError::UnknownSchema(_))));
    }

    #[test]
    fn half_precision_is_widened() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("half.safetensors");
        let bytes: Vec<u8> = [1.5f32, -2.0]
            .iter()
            .flat_map(|&v| f16::from_f32(v).to_bits().to_le_bytes())
            .collect();
        let view = TensorView::new(Dtype::F16, vec![2], &bytes).unwrap();
        safetensors::serialize_to_file([("w", view)], &None, &path).unwrap();

        let map = read_state_dict(&path).unwrap();
        let w = &map["w"];
        assert_eq!(w.kind(), Kind::Float);
        assert_eq!(Vec::<f32>::try_from(w).unwrap(), vec![1.5, -2.0]);
    }

    #[test]
    fn stats_cover_every_inserted_layer() {
        let vs = build(2);
        let stats = inserted_weight_stats(&vs);
        assert_eq!(stats.len(), 5);
        assert_eq!(stats[0].name, "features12.0.weight");
        assert_eq!(stats[0].sum, 64.0);
        assert_eq!(stats[1].mean, 1.0);
        assert_eq!(stats[2].std, 0.0);
    }
}
