use std::fs;
use std::path::Path;

use clsfr_trnr::checkpoint;
use clsfr_trnr::config::TrainConfig;
use clsfr_trnr::model;
use clsfr_trnr::trainer::FineTuner;
use image::{Rgb, RgbImage};
use tch::nn::{ModuleT, VarStore};
use tch::{Device, Kind, Tensor};

fn write_class(root: &Path, split: &str, class: &str, count: usize, color: [u8; 3]) {
    let dir = root.join(split).join(class);
    fs::create_dir_all(&dir).unwrap();
    for i in 0..count {
        let mut img = RgbImage::new(32, 32);
        for pixel in img.pixels_mut() {
            *pixel = Rgb(color);
        }
        img.save(dir.join(format!("img_{i}.png"))).unwrap();
    }
}

fn smoke_config(root: &Path) -> TrainConfig {
    TrainConfig {
        data_root: root.to_path_buf(),
        batch_size: 2,
        num_workers: 1,
        epochs: 1,
        output_dir: root.join("ckpts"),
        log_every: 1,
        ..Default::default()
    }
}

fn weights_in(dir: &Path) -> Vec<std::path::PathBuf> {
    match fs::read_dir(dir) {
        Ok(entries) => entries
            .map(|e| e.unwrap().path())
            .filter(|p| p.extension().map_or(false, |e| e == "safetensors"))
            .collect(),
        Err(_) => Vec::new(),
    }
}

// Single-class dataset: accuracy is identically 1.0, so the first epoch must
// strictly improve on the initial best of 0 and write exactly one checkpoint.
#[test]
fn one_epoch_run_writes_exactly_one_checkpoint() {
    let temp = tempfile::tempdir().unwrap();
    write_class(temp.path(), "train", "cats", 4, [255, 0, 0]);
    write_class(temp.path(), "val", "cats", 2, [255, 0, 0]);

    let config = smoke_config(temp.path());
    let output_dir = config.output_dir.clone();
    let summary = FineTuner::new(config).unwrap().train().unwrap();

    assert_eq!(summary.best_val_accuracy, 1.0);
    assert_eq!(summary.checkpoints_written, 1);

    let weights = weights_in(&output_dir);
    assert_eq!(weights.len(), 1);
    let meta = checkpoint::load_meta(&checkpoint::meta_path_for(&weights[0])).unwrap();
    assert_eq!(meta.epoch, 1);
    assert_eq!(meta.classes, vec!["cats".to_string()]);
    assert_eq!(meta.val_accuracy, 1.0);
}

// Two-class run: a checkpoint is written iff the epoch's validation accuracy
// strictly exceeded the initial best of 0.
#[test]
fn checkpoint_count_follows_the_improvement_policy() {
    let temp = tempfile::tempdir().unwrap();
    write_class(temp.path(), "train", "cats", 2, [255, 0, 0]);
    write_class(temp.path(), "train", "dogs", 2, [0, 0, 255]);
    write_class(temp.path(), "val", "cats", 1, [255, 0, 0]);
    write_class(temp.path(), "val", "dogs", 1, [0, 0, 255]);

    let config = smoke_config(temp.path());
    let output_dir = config.output_dir.clone();
    let summary = FineTuner::new(config).unwrap().train().unwrap();

    let expected = usize::from(summary.best_val_accuracy > 0.0);
    assert_eq!(summary.checkpoints_written, expected);
    assert_eq!(weights_in(&output_dir).len(), expected);

    if let Some(weights) = weights_in(&output_dir).first() {
        let meta = checkpoint::load_meta(&checkpoint::meta_path_for(weights)).unwrap();
        assert_eq!(meta.epoch, 1);
        assert_eq!(meta.classes, vec!["cats".to_string(), "dogs".to_string()]);
        assert_eq!(meta.val_accuracy, summary.best_val_accuracy);
    }
}

#[test]
fn class_count_is_inferred_from_train_folders() {
    let temp = tempfile::tempdir().unwrap();
    write_class(temp.path(), "train", "cats", 2, [255, 0, 0]);
    write_class(temp.path(), "train", "dogs", 2, [0, 0, 255]);
    write_class(temp.path(), "val", "cats", 1, [255, 0, 0]);

    let trainer = FineTuner::new(smoke_config(temp.path())).unwrap();
    assert_eq!(trainer.num_classes(), 2);
}

#[test]
fn explicit_class_count_overrides_the_inferred_one() {
    let temp = tempfile::tempdir().unwrap();
    write_class(temp.path(), "train", "cats", 2, [255, 0, 0]);
    write_class(temp.path(), "train", "dogs", 2, [0, 0, 255]);
    write_class(temp.path(), "val", "cats", 1, [255, 0, 0]);

    let config = TrainConfig {
        num_classes: Some(5),
        ..smoke_config(temp.path())
    };
    let trainer = FineTuner::new(config).unwrap();
    assert_eq!(trainer.num_classes(), 5);
}

#[test]
fn model_output_dimensionality_matches_class_count() {
    let vs = VarStore::new(Device::Cpu);
    let net = model::resnet50(&vs.root(), 7);
    let input = Tensor::zeros([1, 3, 224, 224], (Kind::Float, Device::Cpu));
    let logits = tch::no_grad(|| net.forward_t(&input, false));
    assert_eq!(logits.size(), vec![1, 7]);
}
