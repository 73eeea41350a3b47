use anyhow::Result;
use clap::Parser;

use clsfr_trnr::config::TrainConfig;
use clsfr_trnr::trainer::FineTuner;

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = TrainConfig::parse();

    let mut trainer = FineTuner::new(config)?;
    let summary = trainer.train()?;
    tracing::info!(
        "training done | best val acc {:.2}% | {} checkpoint(s) written",
        summary.best_val_accuracy * 100.0,
        summary.checkpoints_written
    );

    Ok(())
}
