use std::path::Path;

use anyhow::{Context, Result};
use tch::nn::{self, ModuleT};
use tch::vision::resnet;
use tch::Tensor;
use tracing::info;

const BACKBONE_FEATURES: i64 = 2048;
const HEAD_DROPOUT: f64 = 0.2;

/// Pretrained ResNet-50 backbone with a fresh classification head.
///
/// The backbone lives at the var-store root so that weight files using
/// torchvision-convention names load directly; the head lives under `head`
/// and never collides with the 1000-class `fc` carried by pretrained files.
#[derive(Debug)]
pub struct Classifier {
    backbone: Box<dyn nn::ModuleT>,
    head: nn::SequentialT,
}

pub fn resnet50(vs: &nn::Path, num_classes: i64) -> Classifier {
    let backbone: Box<dyn nn::ModuleT> = Box::new(resnet::resnet50_no_final_layer(vs));
    let head = nn::seq_t()
        .add_fn_t(|xs, train| xs.dropout(HEAD_DROPOUT, train))
        .add(nn::linear(
            vs / "head",
            BACKBONE_FEATURES,
            num_classes,
            Default::default(),
        ));
    Classifier { backbone, head }
}

impl nn::ModuleT for Classifier {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let features = self.backbone.forward_t(xs, train);
        self.head.forward_t(&features, train)
    }
}

/// Copies every matching variable from a pretrained weights file into the
/// var-store; variables absent from the file (the head) keep their fresh
/// initialization.
pub fn load_pretrained(vs: &mut nn::VarStore, path: &Path) -> Result<()> {
    let missing = vs
        .load_partial(path)
        .with_context(|| format!("failed to load pretrained weights from {}", path.display()))?;
    let total = vs.variables().len();
    info!(
        "loaded pretrained weights from {} ({} variables, {} left at fresh init)",
        path.display(),
        total - missing.len(),
        missing.len()
    );
    Ok(())
}

/// Turns off gradients for everything outside the head. Must run before the
/// optimizer is built so the frozen variables never enter it.
pub fn freeze_backbone(vs: &nn::VarStore) -> usize {
    let mut frozen = 0;
    for (name, var) in vs.variables() {
        if !name.starts_with("head.") {
            let _ = var.set_requires_grad(false);
            frozen += 1;
        }
    }
    frozen
}
