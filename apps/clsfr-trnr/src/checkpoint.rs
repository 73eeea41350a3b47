use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tch::nn::VarStore;

/// Sidecar metadata written next to each weights file.
///
/// The libtorch C optimizer keeps its moment buffers opaque, so the sidecar
/// records what a resumed run needs to rebuild the schedule and scaler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub epoch: usize,
    pub val_accuracy: f64,
    pub learning_rate: f64,
    pub loss_scale: f64,
    pub classes: Vec<String>,
}

/// Best-validation-accuracy-so-far policy: persist only on strict
/// improvement.
#[derive(Debug, Default)]
pub struct BestTracker {
    best: f64,
}

impl BestTracker {
    pub fn new() -> Self {
        Self { best: 0.0 }
    }

    /// True (and the new value is recorded) iff `val_accuracy` strictly
    /// exceeds every value seen so far in this run.
    pub fn improved(&mut self, val_accuracy: f64) -> bool {
        if val_accuracy > self.best {
            self.best = val_accuracy;
            true
        } else {
            false
        }
    }

    pub fn best(&self) -> f64 {
        self.best
    }
}

/// File stem encoding epoch number and validation accuracy.
pub fn stem(epoch: usize, val_accuracy: f64) -> String {
    format!("resnet50_epoch{epoch:03}_acc{val_accuracy:.3}")
}

/// Metadata path conventionally paired with a weights file.
pub fn meta_path_for(weights: &Path) -> PathBuf {
    weights.with_extension("json")
}

/// Writes `<stem>.safetensors` plus `<stem>.json` under `dir`, creating the
/// directory if absent. Returns the weights path.
pub fn save(vs: &VarStore, meta: &CheckpointMeta, dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create checkpoint directory {}", dir.display()))?;
    let stem = stem(meta.epoch, meta.val_accuracy);
    let weights = dir.join(format!("{stem}.safetensors"));
    vs.save(&weights)
        .with_context(|| format!("failed to save checkpoint {}", weights.display()))?;
    let meta_path = meta_path_for(&weights);
    let json = serde_json::to_string_pretty(meta)?;
    fs::write(&meta_path, json)
        .with_context(|| format!("failed to write checkpoint metadata {}", meta_path.display()))?;
    Ok(weights)
}

pub fn load_meta(path: &Path) -> Result<CheckpointMeta> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read checkpoint metadata {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("invalid checkpoint metadata {}", path.display()))
}
