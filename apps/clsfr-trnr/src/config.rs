use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};

/// Hyperparameters for one fine-tuning run. Parsed from the command line
/// once and read-only afterwards.
#[derive(Debug, Clone, Parser, Serialize, Deserialize)]
#[command(
    name = "clsfr-trnr",
    about = "Fine-tune a pretrained ResNet-50 on a folder-structured image dataset"
)]
pub struct TrainConfig {
    /// Dataset root containing `train/` and `val/` class folders.
    #[arg(long)]
    pub data_root: PathBuf,
    /// Images per batch.
    #[arg(long, default_value_t = 64)]
    pub batch_size: usize,
    /// Worker threads for image decoding.
    #[arg(long, default_value_t = 8)]
    pub num_workers: usize,
    /// Number of epochs.
    #[arg(long, default_value_t = 20)]
    pub epochs: usize,
    /// Peak learning rate for AdamW.
    #[arg(long = "lr", default_value_t = 5e-4)]
    pub learning_rate: f64,
    /// AdamW weight decay.
    #[arg(long, default_value_t = 0.01)]
    pub weight_decay: f64,
    /// Random seed.
    #[arg(long, default_value_t = 17)]
    pub seed: i64,
    /// Directory receiving checkpoints (created if absent).
    #[arg(long, default_value = "artifacts/checkpoints")]
    pub output_dir: PathBuf,
    /// Log loss and learning rate every N training steps.
    #[arg(long, default_value_t = 25)]
    pub log_every: usize,
    /// Override the class count inferred from `train/`.
    #[arg(long)]
    pub num_classes: Option<i64>,
    /// Pretrained backbone weights (torchvision-convention names).
    #[arg(long)]
    pub pretrained: Option<PathBuf>,
    /// Train the classification head only; backbone stays frozen.
    #[arg(long, default_value_t = false)]
    pub freeze_backbone: bool,
    /// Gradient clipping max norm.
    #[arg(long, default_value_t = 1.0)]
    pub clip_grad_norm: f64,
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            bail!("batch size must be > 0");
        }
        if self.epochs == 0 {
            bail!("number of epochs must be > 0");
        }
        if self.learning_rate <= 0.0 {
            bail!("learning rate must be > 0");
        }
        Ok(())
    }
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("data"),
            batch_size: 64,
            num_workers: 8,
            epochs: 20,
            learning_rate: 5e-4,
            weight_decay: 0.01,
            seed: 17,
            output_dir: PathBuf::from("artifacts/checkpoints"),
            log_every: 25,
            num_classes: None,
            pretrained: None,
            freeze_backbone: false,
            clip_grad_norm: 1.0,
        }
    }
}
