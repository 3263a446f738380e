use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use vae_trainer::{
    config::{DatasetKind, RunConfig, RunPaths, DEFAULT_CHECKPOINT_DIR, DEFAULT_OUTPUT_ROOT},
    logging::init_logging,
    model::{DenseVae, VaeConfig},
    training::TrainingDriver,
};

/// Trains a variational autoencoder on a pickled or SQLite image dataset.
#[derive(Parser, Debug)]
#[command(name = "vae-trainer")]
#[command(version)]
#[command(about = "Variational autoencoder training driver", long_about = None)]
struct Cli {
    /// Number of passes over the dataset
    #[arg(long, alias = "training_epochs", default_value_t = 300)]
    training_epochs: usize,

    /// Log batch losses every N batches
    #[arg(long, alias = "display_step", default_value_t = 5)]
    display_step: usize,

    /// Save a checkpoint every N epochs
    #[arg(long, alias = "checkpoint_step", default_value_t = 5)]
    checkpoint_step: usize,

    /// Write reconstructions every N epochs (the last epoch always writes)
    #[arg(long, alias = "sample_step", default_value_t = 1)]
    sample_step: usize,

    #[arg(long, alias = "batch_size", default_value_t = 64)]
    batch_size: usize,

    /// Latent dimensionality
    #[arg(long, alias = "z_dim", default_value_t = 100)]
    z_dim: usize,

    /// Width of the encoder and decoder hidden layers
    #[arg(long, alias = "hidden_dim", default_value_t = 128)]
    hidden_dim: usize,

    #[arg(long, alias = "learning_rate", default_value_t = 0.0002)]
    learning_rate: f64,

    /// Dataset name: mammo or kaggle
    #[arg(long, default_value = "mammo")]
    dataset: DatasetKind,

    /// Image side length in pixels
    #[arg(long, default_value_t = 256)]
    imsize: usize,

    #[arg(long, alias = "num_channels", default_value_t = 3)]
    num_channels: usize,

    /// Standard deviation of the input noise added while training
    #[arg(long, default_value_t = 0.0)]
    std: f64,

    /// Non-zero restores the latest checkpoint before training
    #[arg(long, default_value_t = 0)]
    restore: u32,

    /// Shuffle sample order every pass
    #[arg(long, default_value = "false")]
    shuffle: bool,

    /// Seed for weight init, sampling noise and shuffling
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Dataset file; defaults to ./datasets/<dataset>_cancer/dataset_<dataset>_train_<imsize>.pickle
    #[arg(long, alias = "dataset_path")]
    dataset_path: Option<PathBuf>,

    #[arg(long, alias = "checkpoint_dir", default_value = DEFAULT_CHECKPOINT_DIR)]
    checkpoint_dir: PathBuf,

    /// Checkpoints kept on disk; older ones are deleted. 0 keeps all
    #[arg(long, alias = "max_to_keep", default_value_t = 5)]
    max_to_keep: usize,

    /// Root directory for reconstruction images
    #[arg(long, alias = "output_root", default_value = DEFAULT_OUTPUT_ROOT)]
    output_root: PathBuf,

    /// Enable debug logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,
}

impl Cli {
    fn run_config(&self) -> RunConfig {
        RunConfig {
            training_epochs: self.training_epochs,
            display_step: self.display_step,
            checkpoint_step: self.checkpoint_step,
            sample_step: self.sample_step,
            batch_size: self.batch_size,
            z_dim: self.z_dim,
            hidden_dim: self.hidden_dim,
            learning_rate: self.learning_rate,
            dataset: self.dataset,
            imsize: self.imsize,
            num_channels: self.num_channels,
            std: self.std,
            restore: self.restore != 0,
            shuffle: self.shuffle,
            seed: self.seed,
            max_to_keep: self.max_to_keep,
        }
    }

    fn run_paths(&self) -> RunPaths {
        RunPaths {
            dataset_override: self.dataset_path.clone(),
            checkpoint_dir: self.checkpoint_dir.clone(),
            output_root: self.output_root.clone(),
            ..RunPaths::default()
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose).context("failed to install log subscriber")?;

    let config = cli.run_config();
    let paths = cli.run_paths();
    info!(?config, "starting run");

    let mut driver = TrainingDriver::from_disk(config, paths, |c| {
        DenseVae::new(VaeConfig::from_run(c))
    })
    .context("training setup failed")?;
    let summary = driver.run().context("training failed")?;

    info!(
        epochs = summary.epochs,
        steps = summary.steps,
        checkpoints = summary.checkpoints.len(),
        images = summary.images_written,
        "training finished"
    );
    Ok(())
}
