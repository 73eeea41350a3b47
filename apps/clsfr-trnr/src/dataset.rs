use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use rand::Rng;
use rayon::prelude::*;
use tch::{Kind, Tensor};
use tracing::warn;

pub const IMAGE_SIZE: u32 = 224;
const RESIZE_SHORTER: u32 = 256;

// Normalization statistics of the pretrained backbone; applied to the custom
// dataset unchanged.
const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "webp"];

/// Checks the `train/` + `val/` layout. Must pass before any training work.
pub fn ensure_layout(data_root: &Path) -> Result<()> {
    let train_dir = data_root.join("train");
    let val_dir = data_root.join("val");
    if !train_dir.is_dir() || !val_dir.is_dir() {
        bail!(
            "expecting 'train' and 'val' subdirectories under {}",
            data_root.display()
        );
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Split {
    Train,
    Val,
}

/// Labeled image paths for one split. Labels are indices into the class
/// list, which is always derived from the `train/` folder names.
#[derive(Debug)]
pub struct ImageFolder {
    samples: Vec<(PathBuf, i64)>,
    classes: Vec<String>,
    split: Split,
}

impl ImageFolder {
    /// Scans `data_root/train`; sorted class folder names define the label
    /// indices.
    pub fn train(data_root: &Path) -> Result<Self> {
        let dir = data_root.join("train");
        let classes = list_classes(&dir)?;
        if classes.is_empty() {
            bail!("no class directories under {}", dir.display());
        }
        let samples = scan_split(&dir, &classes)?;
        if samples.is_empty() {
            bail!("no images found under {}", dir.display());
        }
        Ok(Self { samples, classes, split: Split::Train })
    }

    /// Scans `data_root/val` against the train class list. A val folder
    /// whose class is absent from train is skipped with a warning.
    pub fn val(data_root: &Path, classes: &[String]) -> Result<Self> {
        let dir = data_root.join("val");
        for class in list_classes(&dir)? {
            if !classes.contains(&class) {
                warn!("class '{}' in {} is not present under train/, skipping", class, dir.display());
            }
        }
        let samples = scan_split(&dir, classes)?;
        if samples.is_empty() {
            bail!("no images found under {}", dir.display());
        }
        Ok(Self { samples, classes: classes.to_vec(), split: Split::Val })
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn samples(&self) -> &[(PathBuf, i64)] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Decodes and transforms a batch of samples on the worker pool,
    /// returning stacked `[N, 3, 224, 224]` images and `[N]` labels on the
    /// CPU. A corrupt image fails the whole batch.
    pub fn get_batch(&self, indices: &[usize], pool: &rayon::ThreadPool) -> Result<(Tensor, Tensor)> {
        let items: Vec<(Tensor, i64)> = pool.install(|| {
            indices
                .par_iter()
                .map(|&idx| {
                    let (path, label) = &self.samples[idx];
                    let tensor = self.load_and_transform(path)?;
                    Ok((tensor, *label))
                })
                .collect::<Result<Vec<_>>>()
        })?;

        let images: Vec<Tensor> = items.iter().map(|(t, _)| t.shallow_clone()).collect();
        let labels: Vec<i64> = items.iter().map(|(_, l)| *l).collect();
        Ok((Tensor::stack(&images, 0), Tensor::from_slice(&labels)))
    }

    fn load_and_transform(&self, path: &Path) -> Result<Tensor> {
        let img = image::open(path)
            .with_context(|| format!("failed to decode image {}", path.display()))?;
        let img = match self.split {
            Split::Train => augment(img, &mut rand::thread_rng()),
            Split::Val => eval_transform(img),
        };
        Ok(to_normalized_tensor(&img))
    }
}

/// Eval-transformed, normalized single image for inference.
pub fn load_eval_image(path: &Path) -> Result<Tensor> {
    let img = image::open(path)
        .with_context(|| format!("failed to decode image {}", path.display()))?;
    Ok(to_normalized_tensor(&eval_transform(img)))
}

fn list_classes(dir: &Path) -> Result<Vec<String>> {
    let mut classes = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                classes.push(name.to_string());
            }
        }
    }
    classes.sort();
    Ok(classes)
}

fn scan_split(dir: &Path, classes: &[String]) -> Result<Vec<(PathBuf, i64)>> {
    let mut samples = Vec::new();
    for (label, class) in classes.iter().enumerate() {
        let class_dir = dir.join(class);
        if !class_dir.is_dir() {
            continue;
        }
        let mut paths = Vec::new();
        for entry in fs::read_dir(&class_dir)? {
            let entry = entry?;
            let path = entry.path();
            let is_image = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map_or(false, |ext| {
                    IMAGE_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known))
                });
            if entry.file_type()?.is_file() && is_image {
                paths.push(path);
            }
        }
        paths.sort();
        samples.extend(paths.into_iter().map(|p| (p, label as i64)));
    }
    Ok(samples)
}

fn augment(img: DynamicImage, rng: &mut impl Rng) -> DynamicImage {
    let mut img = random_resized_crop(img, rng);

    if rng.gen_bool(0.5) {
        img = img.fliph();
    }

    let brightness = rng.gen_range(-0.2f32..=0.2);
    let contrast = rng.gen_range(-0.2f32..=0.2);
    img = img
        .adjust_contrast(contrast * 100.0)
        .brighten((brightness * 255.0) as i32)
        .huerotate(rng.gen_range(-36..=36));

    if rng.gen_range(0.0f32..1.0) < 0.3 {
        img = img.blur(rng.gen_range(0.1f32..=2.0));
    }

    img
}

/// Crop a random area fraction (0.6-1.0) at a random aspect ratio, then
/// rescale to the model input size.
fn random_resized_crop(img: DynamicImage, rng: &mut impl Rng) -> DynamicImage {
    let (width, height) = img.dimensions();
    let area = (width * height) as f32;

    for _ in 0..10 {
        let target_area = area * rng.gen_range(0.6f32..=1.0);
        let aspect = rng.gen_range(0.75f32..=4.0 / 3.0);
        let crop_w = (target_area * aspect).sqrt().round() as u32;
        let crop_h = (target_area / aspect).sqrt().round() as u32;
        if crop_w == 0 || crop_h == 0 || crop_w > width || crop_h > height {
            continue;
        }
        let x = rng.gen_range(0..=(width - crop_w));
        let y = rng.gen_range(0..=(height - crop_h));
        return img
            .crop_imm(x, y, crop_w, crop_h)
            .resize_exact(IMAGE_SIZE, IMAGE_SIZE, FilterType::Triangle);
    }

    eval_transform(img)
}

/// Resize the shorter side to 256 and center-crop the model input size.
fn eval_transform(img: DynamicImage) -> DynamicImage {
    let (width, height) = img.dimensions();
    let scale = RESIZE_SHORTER as f32 / width.min(height).max(1) as f32;
    let new_w = ((width as f32 * scale).round() as u32).max(RESIZE_SHORTER);
    let new_h = ((height as f32 * scale).round() as u32).max(RESIZE_SHORTER);
    let img = img.resize_exact(new_w, new_h, FilterType::Triangle);
    let x = (new_w - IMAGE_SIZE) / 2;
    let y = (new_h - IMAGE_SIZE) / 2;
    img.crop_imm(x, y, IMAGE_SIZE, IMAGE_SIZE)
}

fn to_normalized_tensor(img: &DynamicImage) -> Tensor {
    let rgb = img.to_rgb8();
    let raw = rgb.into_raw();
    let pixels = Tensor::from_slice(&raw)
        .reshape([IMAGE_SIZE as i64, IMAGE_SIZE as i64, 3])
        .permute([2, 0, 1])
        .to_kind(Kind::Float)
        / 255.0;
    let mean = Tensor::from_slice(&IMAGENET_MEAN).reshape([3, 1, 1]);
    let std = Tensor::from_slice(&IMAGENET_STD).reshape([3, 1, 1]);
    (pixels - mean) / std
}
