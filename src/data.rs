use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::{imageops::FilterType, DynamicImage, GenericImageView, RgbImage};
use rand::Rng;
use rayon::prelude::*;
use tch::{Kind, Tensor};
use tracing::{info, warn};

use crate::error::PruneError;

pub const RESIZE: u32 = 256;
pub const IMG_SIZE: u32 = 224;

const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Sorted sub-directory names of a split; their positions are the class indices.
pub fn list_classes(split_dir: &Path) -> Result<Vec<String>> {
    let mut classes: Vec<String> = fs::read_dir(split_dir)
        .with_context(|| format!("read class directories of {}", split_dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .filter_map(|p| p.file_name().and_then(|s| s.to_str()).map(|s| s.to_string()))
        .collect();
    classes.sort();
    if classes.is_empty() {
        return Err(PruneError::NoClasses(split_dir.display().to_string()).into());
    }
    Ok(classes)
}

/// Long side / short side above which an image is filled to a square instead.
const MAX_ASPECT: f64 = 4.0;

fn resize_shorter_side(img: &DynamicImage, size: u32) -> DynamicImage {
    let (w, h) = img.dimensions();
    let aspect = w.max(h) as f64 / w.min(h).max(1) as f64;
    if aspect > MAX_ASPECT {
        return img.resize_to_fill(size, size, FilterType::Triangle);
    }
    let (nw, nh) = if w <= h {
        let nh = (h as f64 * size as f64 / w.max(1) as f64).round() as u32;
        (size, nh.max(size))
    } else {
        let nw = (w as f64 * size as f64 / h.max(1) as f64).round() as u32;
        (nw.max(size), size)
    };
    img.resize_exact(nw, nh, FilterType::Triangle)
}

/// Resize to 256, crop to 224 (random + flip when training, centered otherwise).
pub fn preprocess(img: &DynamicImage, is_training: bool) -> Tensor {
    let img = resize_shorter_side(img, RESIZE);
    let (w, h) = img.dimensions();
    let (x, y) = if is_training {
        let mut rng = rand::thread_rng();
        (rng.gen_range(0..=w - IMG_SIZE), rng.gen_range(0..=h - IMG_SIZE))
    } else {
        ((w - IMG_SIZE) / 2, (h - IMG_SIZE) / 2)
    };
    let mut img = img.crop_imm(x, y, IMG_SIZE, IMG_SIZE);
    if is_training && rand::random::<bool>() {
        img = img.fliph();
    }
    to_normalized_tensor(img.to_rgb8())
}

fn to_normalized_tensor(rgb: RgbImage) -> Tensor {
    let (w, h) = rgb.dimensions();
    let raw = rgb.into_raw();
    let tensor = Tensor::from_slice(&raw)
        .reshape(&[h as i64, w as i64, 3])
        .permute(&[2, 0, 1])
        .to_kind(Kind::Float)
        / 255.0;
    let mean = Tensor::from_slice(&MEAN).view([3, 1, 1]);
    let std = Tensor::from_slice(&STD).view([3, 1, 1]);
    (tensor - mean) / std
}

pub fn load_image(path: &Path, is_training: bool) -> Result<Tensor> {
    let img = image::open(path).with_context(|| format!("decode {}", path.display()))?;
    Ok(preprocess(&img, is_training))
}

/// An `<split>/<class>/<file>` image directory, decoded lazily per batch.
#[derive(Debug)]
pub struct ImageFolder {
    root: PathBuf,
    samples: Vec<(PathBuf, i64)>,
    is_training: bool,
}

impl ImageFolder {
    /// A missing split directory yields an empty folder with a warning.
    pub fn open(root: &Path, classes: &[String], is_training: bool) -> Result<Self> {
        let mut samples = Vec::new();
        if !root.exists() {
            warn!("split not found at {}", root.display());
            return Ok(Self { root: root.to_path_buf(), samples, is_training });
        }

        let index_map: HashMap<&str, i64> = classes
            .iter()
            .enumerate()
            .map(|(i, c)| (c.as_str(), i as i64))
            .collect();

        let mut class_entries: Vec<_> = fs::read_dir(root)
            .with_context(|| format!("read {}", root.display()))?
            .filter_map(|e| e.ok())
            .collect();
        class_entries.sort_by_key(|e| e.file_name());

        for entry in class_entries {
            let class_dir = entry.path();
            if !class_dir.is_dir() {
                continue;
            }
            let Some(class_name) = class_dir.file_name().and_then(|s| s.to_str()) else {
                continue;
            };
            let Some(&class_idx) = index_map.get(class_name) else {
                warn!("class '{}' in {} is not a training class, skipped", class_name, root.display());
                continue;
            };

            let mut img_paths: Vec<_> = fs::read_dir(&class_dir)?
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_file())
                .collect();
            img_paths.sort();
            samples.extend(img_paths.into_iter().map(|p| (p, class_idx)));
        }

        info!("{}: {} images", root.display(), samples.len());
        Ok(Self { root: root.to_path_buf(), samples, is_training })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Decodes the given samples in parallel and stacks them on the CPU.
    /// Undecodable files are dropped; `None` when nothing in the chunk decoded.
    pub fn load_batch(&self, idxs: &[usize]) -> Option<(Tensor, Tensor)> {
        let results: Vec<(Tensor, i64)> = idxs
            .par_iter()
            .filter_map(|&i| {
                let (path, label) = &self.samples[i];
                match load_image(path, self.is_training) {
                    Ok(t) => Some((t, *label)),
                    Err(e) => {
                        warn!("failed to load {:?}: {:#}", path, e);
                        None
                    }
                }
            })
            .collect();
        if results.is_empty() {
            return None;
        }
        let (xs, ys): (Vec<Tensor>, Vec<i64>) = results.into_iter().unzip();
        Some((Tensor::stack(&xs, 0), Tensor::from_slice(&ys)))
    }

    pub fn batches<'a>(
        &'a self,
        order: &'a [usize],
        batch_size: usize,
    ) -> impl Iterator<Item = (Tensor, Tensor)> + 'a {
        order
            .chunks(batch_size.max(1))
            .filter_map(move |chunk| self.load_batch(chunk))
    }

    pub fn sequential(&self) -> Vec<usize> {
        (0..self.samples.len()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn write_image(path: &Path, w: u32, h: u32, shade: u8) {
        let img = RgbImage::from_pixel(w, h, Rgb([shade, shade / 2, 255 - shade]));
        img.save(path).unwrap();
    }

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (class, n) in [("b_rose", 2), ("a_daisy", 3)] {
            let class_dir = dir.path().join("train").join(class);
            fs::create_dir_all(&class_dir).unwrap();
            for i in 0..n {
                write_image(&class_dir.join(format!("{i}.png")), 300, 260, 40 * i as u8);
            }
        }
        dir
    }

    #[test]
    fn classes_are_sorted_directory_names() {
        let dir = fixture();
        let classes = list_classes(&dir.path().join("train")).unwrap();
        assert_eq!(classes, vec!["a_daisy".to_string(), "b_rose".to_string()]);
    }

    #[test]
    fn empty_split_has_no_classes() {
        let dir = tempfile::tempdir().unwrap();
        assert!(list_classes(dir.path()).is_err());
    }

    #[test]
    fn folder_labels_follow_class_order() {
        let dir = fixture();
        let root = dir.path().join("train");
        let classes = list_classes(&root).unwrap();
        let folder = ImageFolder::open(&root, &classes, false).unwrap();
        assert_eq!(folder.len(), 5);
        let labels: Vec<i64> = folder.samples.iter().map(|(_, l)| *l).collect();
        assert_eq!(labels, vec![0, 0, 0, 1, 1]);
    }

    #[test]
    fn missing_split_is_empty() {
        let dir = fixture();
        let folder = ImageFolder::open(&dir.path().join("val"), &["a".to_string()], false).unwrap();
        assert!(folder.is_empty());
    }

    #[test]
    fn batches_are_stacked_and_normalized() {
        let dir = fixture();
        let root = dir.path().join("train");
        let classes = list_classes(&root).unwrap();
        let folder = ImageFolder::open(&root, &classes, true).unwrap();
        let order = folder.sequential();
        let batches: Vec<_> = folder.batches(&order, 2).collect();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].0.size(), vec![2, 3, 224, 224]);
        assert_eq!(batches[2].0.size(), vec![1, 3, 224, 224]);
        assert_eq!(batches[2].1.size(), vec![1]);
    }

    #[test]
    fn unreadable_files_are_skipped() {
        let dir = fixture();
        let root = dir.path().join("train");
        fs::write(root.join("a_daisy").join("zz_broken.png"), b"not an image").unwrap();
        let classes = list_classes(&root).unwrap();
        let folder = ImageFolder::open(&root, &classes, false).unwrap();
        assert_eq!(folder.len(), 6);
        let (xs, ys) = folder.load_batch(&[2, 3]).unwrap();
        assert_eq!(xs.size()[0], 1);
        assert_eq!(ys.size(), vec![1]);
    }

    #[test]
    fn extreme_aspect_ratios_are_filled_to_a_square() {
        let thin = DynamicImage::ImageRgb8(RgbImage::from_pixel(1, 2000, Rgb([9, 9, 9])));
        assert_eq!(resize_shorter_side(&thin, RESIZE).dimensions(), (RESIZE, RESIZE));
        assert_eq!(preprocess(&thin, true).size(), vec![3, 224, 224]);

        let wide = DynamicImage::ImageRgb8(RgbImage::from_pixel(600, 200, Rgb([9, 9, 9])));
        assert_eq!(resize_shorter_side(&wide, RESIZE).dimensions(), (768, RESIZE));
    }

    #[test]
    fn eval_preprocessing_is_center_crop() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(500, 256, Rgb([255, 255, 255])));
        let t = preprocess(&img, false);
        assert_eq!(t.size(), vec![3, 224, 224]);
        let red = t.get(0).mean(Kind::Float).double_value(&[]);
        assert!((red - (1.0 - 0.485) / 0.229).abs() < 1e-3);
    }
}
