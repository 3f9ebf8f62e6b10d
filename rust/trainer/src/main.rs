//! Phased Pipeline Trainer
//!
//! Runs `epochs` rounds of Train then Validate, followed by a final Test,
//! over a three-stage execution pipeline on one worker rank.
//!
//! # Usage
//!
//! ```bash
//! # Synthetic data, 10 batches per phase
//! dlrm-trainer
//!
//! # Day files on disk, rank 1 of 4
//! dlrm-trainer --dataset-path /data/criteo --rank 1 --world-size 4
//!
//! # With a configuration file
//! dlrm-trainer --config trainer.toml --epochs 2
//! ```

mod probe;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pipeline_core::{PipelineDepth, Result, Runtime, StagedEngine, TrainerConfig};
use probe::LinearProbe;

/// Phased pipeline trainer
#[derive(Parser, Debug)]
#[command(name = "dlrm-trainer")]
#[command(about = "Train / validate / test driver for a pipelined recommendation model")]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory of day_<d>_<kind> files (synthetic data when omitted)
    #[arg(long)]
    dataset_path: Option<PathBuf>,

    /// Number of train/validate rounds
    #[arg(long)]
    epochs: Option<usize>,

    /// Rows per batch
    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    limit_train_batches: Option<usize>,

    #[arg(long)]
    limit_val_batches: Option<usize>,

    #[arg(long)]
    limit_test_batches: Option<usize>,

    /// Shuffle batch order on every traversal
    #[arg(long)]
    shuffle_batches: bool,

    #[arg(long)]
    seed: Option<u64>,

    /// Prefetch threads per phase sequence
    #[arg(long)]
    num_workers: Option<usize>,

    /// Hash size for every categorical feature
    #[arg(long)]
    num_embeddings: Option<u32>,

    /// Comma separated hash sizes, one per categorical feature
    #[arg(long, value_delimiter = ',')]
    num_embeddings_per_feature: Option<Vec<u32>>,

    /// Rank of this worker
    #[arg(long, env = "RANK")]
    rank: Option<usize>,

    /// Number of workers
    #[arg(long, env = "WORLD_SIZE")]
    world_size: Option<usize>,

    /// Probe learning rate
    #[arg(long, default_value = "0.05")]
    learning_rate: f32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Loads the configuration and applies command line overrides on top.
fn build_config(args: &Args) -> Result<TrainerConfig> {
    let mut config = match &args.config {
        Some(path) => TrainerConfig::from_file(path)?,
        None => TrainerConfig::default(),
    }
    .with_env_overrides();

    if let Some(path) = &args.dataset_path {
        config.dataset.path = Some(path.clone());
    }
    if let Some(epochs) = args.epochs {
        config.training.epochs = epochs;
    }
    if let Some(batch_size) = args.batch_size {
        config.training.batch_size = batch_size;
    }
    if args.limit_train_batches.is_some() {
        config.training.limit_train_batches = args.limit_train_batches;
    }
    if args.limit_val_batches.is_some() {
        config.training.limit_val_batches = args.limit_val_batches;
    }
    if args.limit_test_batches.is_some() {
        config.training.limit_test_batches = args.limit_test_batches;
    }
    if args.shuffle_batches {
        config.dataset.shuffle_batches = true;
    }
    if args.seed.is_some() {
        config.dataset.seed = args.seed;
    }
    if let Some(num_workers) = args.num_workers {
        config.dataset.num_workers = num_workers;
    }
    if let Some(num_embeddings) = args.num_embeddings {
        config.dataset.num_embeddings = num_embeddings;
    }
    if args.num_embeddings_per_feature.is_some() {
        config.dataset.num_embeddings_per_feature = args.num_embeddings_per_feature.clone();
    }
    if let Some(rank) = args.rank {
        config.distributed.rank = rank;
    }
    if let Some(world_size) = args.world_size {
        config.distributed.world_size = world_size;
    }

    config.validate()?;
    Ok(config)
}

fn run(args: &Args) -> Result<()> {
    let config = build_config(args)?;
    let is_rank_zero = config.distributed.rank == 0;

    tracing::info!("Starting phased pipeline trainer");
    tracing::info!("  Epochs: {}", config.training.epochs);
    tracing::info!("  Batch size: {}", config.training.batch_size);
    tracing::info!(
        "  Rank: {} of {}",
        config.distributed.rank,
        config.distributed.world_size
    );

    let runtime = Runtime::from_config(config)?;
    let engine = StagedEngine::new(LinearProbe::new(args.learning_rate), PipelineDepth::default());

    let report = runtime.run(engine, |summary| {
        if is_rank_zero {
            println!("{summary}");
        }
    })?;

    for train in &report.train {
        tracing::info!(
            "Epoch {}: {} train steps, mean loss {:.4}",
            train.epoch,
            train.steps,
            train.mean_loss
        );
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize logging
    let filter = tracing_subscriber::filter::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Trainer failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("dlrm-trainer").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_cli_overrides() {
        let args = parse(&[
            "--epochs",
            "3",
            "--limit-val-batches",
            "4",
            "--shuffle-batches",
            "--rank",
            "1",
            "--world-size",
            "2",
            "--num-embeddings-per-feature",
            &vec!["7"; 26].join(","),
        ]);
        let config = build_config(&args).unwrap();

        assert_eq!(config.training.epochs, 3);
        assert_eq!(config.training.limit_val_batches, Some(4));
        assert!(config.dataset.shuffle_batches);
        assert_eq!(config.distributed.rank, 1);
        assert_eq!(config.distributed.world_size, 2);
        assert_eq!(config.dataset.hash_sizes(), vec![7; 26]);
    }

    #[test]
    fn test_cli_overrides_config_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [training]
            epochs = 5
            batch_size = 64
            "#
        )
        .unwrap();

        let path = file.path().to_str().unwrap();
        let config = build_config(&parse(&["--config", path, "--epochs", "2"])).unwrap();
        assert_eq!(config.training.epochs, 2);
        assert_eq!(config.training.batch_size, 64);
    }

    #[test]
    fn test_invalid_rank_is_rejected() {
        let args = parse(&["--rank", "2", "--world-size", "2"]);
        assert!(build_config(&args).unwrap_err().is_config());
    }

    #[test]
    fn test_synthetic_run() {
        let args = parse(&["--batch-size", "8", "--limit-train-batches", "4", "--num-workers", "0"]);
        assert!(run(&args).is_ok());
    }
}
