use std::time::Instant;

use anyhow::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tch::nn::{self, ModuleT, OptimizerConfig};
use tch::{Device, Kind, Tensor};
use tracing::info;

use crate::amp::GradScaler;
use crate::checkpoint::{self, BestTracker, CheckpointMeta};
use crate::config::TrainConfig;
use crate::dataset::{self, ImageFolder};
use crate::model::{self, Classifier};
use crate::sched::CosineAnnealing;

/// Outcome of a run, for the final log line and for tests.
#[derive(Debug)]
pub struct TrainSummary {
    pub best_val_accuracy: f64,
    pub checkpoints_written: usize,
}

pub struct FineTuner {
    config: TrainConfig,
    device: Device,
    vs: nn::VarStore,
    model: Classifier,
    optimizer: nn::Optimizer,
    scaler: GradScaler,
    schedule: CosineAnnealing,
    train_data: ImageFolder,
    val_data: ImageFolder,
    pool: rayon::ThreadPool,
    rng: StdRng,
    num_classes: i64,
}

impl FineTuner {
    pub fn new(config: TrainConfig) -> Result<Self> {
        config.validate()?;
        dataset::ensure_layout(&config.data_root)?;

        tch::manual_seed(config.seed);
        let rng = StdRng::seed_from_u64(config.seed as u64);

        let device = Device::cuda_if_available();
        info!("using device {:?}", device);
        if device.is_cuda() {
            tch::Cuda::cudnn_set_benchmark(true);
        }

        let train_data = ImageFolder::train(&config.data_root)?;
        let val_data = ImageFolder::val(&config.data_root, train_data.classes())?;
        let num_classes = config
            .num_classes
            .unwrap_or(train_data.classes().len() as i64);
        info!(
            "dataset loaded: {} train / {} val images, {} classes",
            train_data.len(),
            val_data.len(),
            num_classes
        );
        if train_data.len() < config.batch_size {
            bail!(
                "train split has {} images, fewer than one batch of {}",
                train_data.len(),
                config.batch_size
            );
        }

        let mut vs = nn::VarStore::new(device);
        let model = model::resnet50(&vs.root(), num_classes);
        if let Some(path) = &config.pretrained {
            model::load_pretrained(&mut vs, path)?;
        }
        if config.freeze_backbone {
            let frozen = model::freeze_backbone(&vs);
            info!("backbone frozen ({} variables)", frozen);
        }

        let optimizer = nn::adamw(0.9, 0.999, config.weight_decay)
            .build(&vs, config.learning_rate)
            .context("failed to build AdamW optimizer")?;
        let scaler = GradScaler::new(device.is_cuda());
        let schedule = CosineAnnealing::new(config.learning_rate, config.epochs);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.num_workers.max(1))
            .build()
            .context("failed to build decode worker pool")?;

        Ok(Self {
            config,
            device,
            vs,
            model,
            optimizer,
            scaler,
            schedule,
            train_data,
            val_data,
            pool,
            rng,
            num_classes,
        })
    }

    pub fn num_classes(&self) -> i64 {
        self.num_classes
    }

    pub fn train(&mut self) -> Result<TrainSummary> {
        let mut tracker = BestTracker::new();
        let mut checkpoints_written = 0;

        for epoch in 1..=self.config.epochs {
            let epoch_start = Instant::now();

            let (train_loss, train_acc) = self.train_one_epoch(epoch)?;
            let (val_loss, val_acc) = self.evaluate()?;
            self.schedule.step();
            self.schedule.apply(&mut self.optimizer);

            info!(
                "Epoch {:02} finished in {:.1}s | train loss {:.4}, train acc {:.2}% | val loss {:.4}, val acc {:.2}%",
                epoch,
                epoch_start.elapsed().as_secs_f64(),
                train_loss,
                train_acc * 100.0,
                val_loss,
                val_acc * 100.0
            );

            if tracker.improved(val_acc) {
                let meta = CheckpointMeta {
                    epoch,
                    val_accuracy: val_acc,
                    learning_rate: self.schedule.get_lr(),
                    loss_scale: self.scaler.current_scale(),
                    classes: self.train_data.classes().to_vec(),
                };
                let path = checkpoint::save(&self.vs, &meta, &self.config.output_dir)?;
                info!("saved checkpoint to {} (val acc {:.2}%)", path.display(), val_acc * 100.0);
                checkpoints_written += 1;
            }
        }

        Ok(TrainSummary {
            best_val_accuracy: tracker.best(),
            checkpoints_written,
        })
    }

    fn train_one_epoch(&mut self, epoch: usize) -> Result<(f64, f64)> {
        let mut indices: Vec<usize> = (0..self.train_data.len()).collect();
        indices.shuffle(&mut self.rng);

        // Partial batches at the tail are dropped.
        let steps = self.train_data.len() / self.config.batch_size;
        let bar = ProgressBar::new(steps as u64);
        bar.set_style(ProgressStyle::with_template(
            "  [ep {prefix}] {elapsed_precise} {bar:40} {pos}/{len} {msg}",
        )?);
        bar.set_prefix(epoch.to_string());

        let mut running_loss = 0.0;
        let mut running_acc = 0.0;

        for (step, chunk) in indices
            .chunks(self.config.batch_size)
            .take(steps)
            .enumerate()
        {
            let (images, labels) = self.train_data.get_batch(chunk, &self.pool)?;
            let images = images.to_device(self.device);
            let labels = labels.to_device(self.device);

            self.optimizer.zero_grad();

            let (loss, batch_acc) = tch::autocast(self.scaler.is_enabled(), || {
                let logits = self.model.forward_t(&images, true);
                let loss = logits.cross_entropy_for_logits(&labels);
                let acc = accuracy(&logits, &labels);
                (loss, acc)
            });

            self.scaler.scale(&loss).backward();
            let found_inf = self.scaler.unscale(&self.vs)?;
            if !found_inf {
                self.optimizer.clip_grad_norm(self.config.clip_grad_norm);
                self.optimizer.step();
            }
            self.scaler.update(found_inf);

            let loss_value = loss.double_value(&[]);
            running_loss += loss_value;
            running_acc += batch_acc;

            if step % self.config.log_every == 0 {
                info!(
                    "Epoch {} | step {:04} | lr {:.2e} | loss {:.4}",
                    epoch,
                    step,
                    self.schedule.get_lr(),
                    loss_value
                );
            }
            bar.set_message(format!("loss {loss_value:.4}"));
            bar.inc(1);
        }
        bar.finish_and_clear();

        Ok((running_loss / steps as f64, running_acc / steps as f64))
    }

    fn evaluate(&self) -> Result<(f64, f64)> {
        let indices: Vec<usize> = (0..self.val_data.len()).collect();
        let chunks: Vec<&[usize]> = indices.chunks(self.config.batch_size).collect();
        let bar = ProgressBar::new(chunks.len() as u64);
        bar.set_style(ProgressStyle::with_template("  [val] {bar:40} {pos}/{len}")?);

        let mut total_loss = 0.0;
        let mut total_acc = 0.0;

        let _guard = tch::no_grad_guard();
        for chunk in &chunks {
            let (images, labels) = self.val_data.get_batch(chunk, &self.pool)?;
            let images = images.to_device(self.device);
            let labels = labels.to_device(self.device);

            let logits = self.model.forward_t(&images, false);
            total_loss += logits.cross_entropy_for_logits(&labels).double_value(&[]);
            total_acc += accuracy(&logits, &labels);
            bar.inc(1);
        }
        bar.finish_and_clear();

        let steps = chunks.len() as f64;
        Ok((total_loss / steps, total_acc / steps))
    }
}

fn accuracy(logits: &Tensor, labels: &Tensor) -> f64 {
    logits
        .argmax(-1, false)
        .eq_tensor(labels)
        .to_kind(Kind::Float)
        .mean(Kind::Float)
        .double_value(&[])
}
