use std::path::Path;

use anyhow::{Context, Result};
use tch::{nn::ModuleT, Device};

use crate::data::load_image;
use crate::model::AddLayerAlexNet;

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub label: i64,
    pub class_name: String,
    /// Set when the image sits in a directory named after a known class.
    pub truth: Option<(i64, String)>,
}

pub fn predict_image(
    net: &AddLayerAlexNet,
    classes: &[String],
    path: &Path,
    device: Device,
) -> Result<Prediction> {
    let input = load_image(path, false)?.unsqueeze(0).to(device);
    let logits = tch::no_grad(|| net.forward_t(&input, false));
    let label = logits.argmax(-1, false).int64_value(&[0]);
    let class_name = classes
        .get(label as usize)
        .cloned()
        .with_context(|| format!("predicted label {label} has no class directory"))?;

    let truth = path
        .parent()
        .and_then(|p| p.file_name())
        .and_then(|s| s.to_str())
        .and_then(|dir| classes.iter().position(|c| c == dir))
        .map(|i| (i as i64, classes[i].clone()));

    Ok(Prediction { label, class_name, truth })
}
