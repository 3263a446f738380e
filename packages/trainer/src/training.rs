use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    batch::{Batch, BatchProducer},
    checkpoint::{self, CheckpointError},
    config::{ConfigError, RunConfig, RunPaths},
    data::{self, DataError, Dataset, ImageShape},
    imageio::{self, ImageError},
    model::{ModelError, VaeModel},
};

pub const RUN_CONFIG_FILE: &str = "run_config.json";

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error("dataset has {samples} samples, fewer than one batch of {batch_size}")]
    DatasetTooSmall { samples: usize, batch_size: usize },
    #[error("dataset images are {actual:?}, run is configured for {expected:?}")]
    ShapeMismatch {
        expected: ImageShape,
        actual: ImageShape,
    },
    #[error("failed to prepare {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode run config: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingSummary {
    pub epochs: usize,
    pub steps: usize,
    pub epoch_costs: Vec<f64>,
    /// Every checkpoint written, the final epoch-0 save last.
    pub checkpoints: Vec<PathBuf>,
    pub images_written: usize,
    pub restored_from: Option<PathBuf>,
}

#[derive(Serialize)]
struct RunRecord<'a> {
    config: &'a RunConfig,
    paths: &'a RunPaths,
}

/// Share of one step's cost in the epoch average.
pub fn cost_contribution(cost: f64, n_samples: usize, batch_size: usize) -> f64 {
    cost / n_samples as f64 * batch_size as f64
}

/// Owns a run from setup to the final checkpoint.
pub struct TrainingDriver<M> {
    config: RunConfig,
    paths: RunPaths,
    dataset: Dataset,
    model: M,
    restored_from: Option<PathBuf>,
}

impl<M: VaeModel> TrainingDriver<M> {
    /// Loads the configured dataset from disk, then runs [`TrainingDriver::new`].
    pub fn from_disk<F>(config: RunConfig, paths: RunPaths, build: F) -> Result<Self, TrainingError>
    where
        F: FnOnce(&RunConfig) -> M,
    {
        config.validate()?;
        let dataset_path = paths.dataset_path(&config);
        let dataset = data::load_dataset(config.dataset, &dataset_path, config.image_shape())?;
        Self::new(config, paths, dataset, build)
    }

    /// Setup phase: validates the run, prepares the checkpoint directory,
    /// builds the model and restores the latest checkpoint when asked to and
    /// one exists.
    pub fn new<F>(
        config: RunConfig,
        paths: RunPaths,
        dataset: Dataset,
        build: F,
    ) -> Result<Self, TrainingError>
    where
        F: FnOnce(&RunConfig) -> M,
    {
        config.validate()?;
        if dataset.shape() != config.image_shape() {
            return Err(TrainingError::ShapeMismatch {
                expected: config.image_shape(),
                actual: dataset.shape(),
            });
        }
        if dataset.len() < config.batch_size {
            return Err(TrainingError::DatasetTooSmall {
                samples: dataset.len(),
                batch_size: config.batch_size,
            });
        }

        let checkpoint_dir = &paths.checkpoint_dir;
        fs::create_dir_all(checkpoint_dir).map_err(|source| TrainingError::Io {
            path: checkpoint_dir.clone(),
            source,
        })?;
        write_run_record(checkpoint_dir, &config, &paths)?;

        let mut model = build(&config);

        let restored_from =
            if config.restore && checkpoint::latest_checkpoint(checkpoint_dir)?.is_some() {
                let path = model.load_model(checkpoint_dir)?;
                info!(path = %path.display(), "restored model");
                Some(path)
            } else {
                None
            };

        Ok(Self {
            config,
            paths,
            dataset,
            model,
            restored_from,
        })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    /// Epoch loop and teardown.
    pub fn run(&mut self) -> Result<TrainingSummary, TrainingError> {
        let config = &self.config;
        let n_samples = self.dataset.len();
        let total_batch = n_samples / config.batch_size;
        let prefix = self.paths.checkpoint_prefix(config);
        let sample_dir = self.paths.sample_dir(config);

        let mut producer = if config.shuffle {
            BatchProducer::shuffled(&self.dataset, config.batch_size, config.seed)
        } else {
            BatchProducer::new(&self.dataset, config.batch_size)
        };
        let mut summary = TrainingSummary {
            restored_from: self.restored_from.clone(),
            ..TrainingSummary::default()
        };
        let mut last_batch: Option<Batch> = None;

        info!(
            dataset = %config.dataset,
            samples = n_samples,
            batches_per_epoch = total_batch,
            epochs = config.training_epochs,
            "training started"
        );

        for epoch in 0..config.training_epochs {
            let mut avg_cost = 0.0;
            for i in 0..total_batch {
                let mut batch = producer.next_batch();
                batch.rescale_to_unit();
                let losses = self.model.partial_fit(&batch)?;

                if i % config.display_step == 0 {
                    info!(
                        "Epoch: {:04} batch: {:04} cost: {:.6} l2_loss = {:.6} kl_loss = {:.6}",
                        epoch + 1,
                        i,
                        losses.cost,
                        losses.l2_loss,
                        losses.kl_loss
                    );
                }

                avg_cost += cost_contribution(losses.cost, n_samples, config.batch_size);
                summary.steps += 1;
                last_batch = Some(batch);
            }

            info!("Epoch: {:04} cost= {:.6}", epoch + 1, avg_cost);
            summary.epoch_costs.push(avg_cost);
            summary.epochs += 1;

            if epoch > 0 && epoch % config.checkpoint_step == 0 {
                let path = self.model.save_model(&prefix, epoch)?;
                info!("model saved to {}", path.display());
                summary.checkpoints.push(path);
            }

            let is_last = epoch + 1 == config.training_epochs;
            if epoch % config.sample_step == 0 || is_last {
                if let Some(batch) = &last_batch {
                    let recons = self.model.reconstruct(batch)?;
                    let written =
                        imageio::write_reconstructions(&sample_dir, epoch, batch, &recons)?;
                    debug!(
                        dir = %sample_dir.display(),
                        files = written.len(),
                        "reconstructions written"
                    );
                    summary.images_written += written.len();
                }
            }
        }

        // epoch tag 0 marks the finished model
        let path = self.model.save_model(&prefix, 0)?;
        info!("final model saved to {}", path.display());
        summary.checkpoints.push(path);

        Ok(summary)
    }
}

fn write_run_record(dir: &Path, config: &RunConfig, paths: &RunPaths) -> Result<(), TrainingError> {
    let path = dir.join(RUN_CONFIG_FILE);
    let json = serde_json::to_vec_pretty(&RunRecord { config, paths })?;
    fs::write(&path, json).map_err(|source| TrainingError::Io { path, source })
}
