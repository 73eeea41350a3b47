use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tch::nn::{self, ModuleT};
use tch::{Device, Kind};

use clsfr_trnr::checkpoint;
use clsfr_trnr::dataset;
use clsfr_trnr::model;

/// Classify images with a saved fine-tuning checkpoint.
#[derive(Debug, Parser)]
#[command(name = "clsfr-prdct")]
struct Args {
    /// Checkpoint weights file.
    #[arg(long)]
    checkpoint: PathBuf,
    /// Metadata sidecar; defaults to the weights path with a `.json` extension.
    #[arg(long)]
    meta: Option<PathBuf>,
    /// Number of top classes to print per image.
    #[arg(long, default_value_t = 5)]
    top_k: i64,
    /// Images to classify.
    #[arg(required = true)]
    images: Vec<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let meta_path = args
        .meta
        .clone()
        .unwrap_or_else(|| checkpoint::meta_path_for(&args.checkpoint));
    let meta = checkpoint::load_meta(&meta_path)?;
    if meta.classes.is_empty() {
        bail!("checkpoint metadata {} carries no class names", meta_path.display());
    }

    let device = Device::cuda_if_available();
    let mut vs = nn::VarStore::new(device);
    let net = model::resnet50(&vs.root(), meta.classes.len() as i64);
    vs.load(&args.checkpoint)
        .with_context(|| format!("failed to load checkpoint {}", args.checkpoint.display()))?;

    let top_k = args.top_k.min(meta.classes.len() as i64).max(1);
    let _guard = tch::no_grad_guard();
    for path in &args.images {
        let input = dataset::load_eval_image(path)?.unsqueeze(0).to_device(device);
        let probs = net.forward_t(&input, false).softmax(-1, Kind::Float).squeeze();
        let (values, classes) = probs.topk(top_k, -1, true, true);

        println!("{}", path.display());
        for k in 0..top_k {
            let probability = values.double_value(&[k]);
            let class = classes.int64_value(&[k]) as usize;
            println!("  {:>6.2}% {}", probability * 100.0, meta.classes[class]);
        }
    }

    Ok(())
}
