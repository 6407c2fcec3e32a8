//! Adversarial patch training CLI.
//!
//! Loads a JSON configuration, wires the dataset, the reference detector
//! and the metrics sink, and runs the optimization loop. Real detector
//! integrations implement the `Detector` trait against their own runtime
//! and drive `PatchTrainer` the same way.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use advpatch::config::TrainConfig;
use advpatch::data::YoloDirSource;
use advpatch::detect::PoolingDetector;
use advpatch::metrics::TracingSink;
use advpatch::train::PatchTrainer;

/// Grid stride used by the built-in reference detector.
const REFERENCE_DETECTOR_STRIDE: usize = 32;

#[derive(Parser, Debug)]
#[command(
    name = "advpatch",
    about = "Optimize an adversarial patch against a frozen object detector",
    version
)]
struct Cli {
    /// Path to the JSON training configuration.
    #[arg(short, long)]
    config: PathBuf,

    /// Override the configured number of epochs.
    #[arg(long)]
    epochs: Option<usize>,

    /// Override the configured seed.
    #[arg(long)]
    seed: Option<u64>,

    /// Force debug mode (anomaly surfacing, per-batch composite dumps).
    #[arg(long, default_value_t = false)]
    debug: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let mut cfg = TrainConfig::load(&cli.config)?;
    if let Some(epochs) = cli.epochs {
        cfg.n_epochs = epochs;
    }
    if let Some(seed) = cli.seed {
        cfg.seed = seed;
    }
    if cli.debug {
        cfg.debug_mode = true;
    }

    tracing::info!("advpatch v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        "patch {} ({}x{}), target {:?}, {} epochs, lr {}",
        cfg.patch_name,
        cfg.patch_size[0],
        cfg.patch_size[1],
        cfg.loss_target,
        cfg.n_epochs,
        cfg.start_lr,
    );

    let source = Arc::new(YoloDirSource::new(
        &cfg.image_dir,
        &cfg.label_dir,
        cfg.model_in_sz,
        cfg.max_labels,
        cfg.batch_size,
        Some(cfg.seed),
    )?);
    tracing::info!("dataset: {} samples", source.num_samples());

    let grid = (cfg.model_in_sz[0] / REFERENCE_DETECTOR_STRIDE).max(1);
    let detector = Box::new(PoolingDetector::new(grid, cfg.n_classes));

    let mut trainer = PatchTrainer::new(&cfg, detector, source, Box::new(TracingSink))?;
    tracing::info!("run directory: {}", trainer.run_dir().display());

    let summary = trainer.train()?;

    tracing::info!(
        "done: {} epochs, final mean loss {:.4}, final lr {:.5}",
        summary.epoch_losses.len(),
        summary.epoch_losses.last().copied().unwrap_or(f32::NAN),
        summary.final_lr,
    );
    if let Some(last) = summary.checkpoints.last() {
        tracing::info!("final patch: {}", last.display());
    }
    Ok(())
}
