use std::{fmt, path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::data::ImageShape;

pub const DEFAULT_DATASET_TEMPLATE: &str =
    "./datasets/{dataset}_cancer/dataset_{dataset}_train_{imsize}.pickle";
pub const DEFAULT_CHECKPOINT_DIR: &str = "./checkpoints/vae";
pub const DEFAULT_OUTPUT_ROOT: &str = "out";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unsupported dataset '{0}' (expected one of: mammo, kaggle)")]
    UnsupportedDataset(String),
    #[error("{0} must be > 0")]
    Zero(&'static str),
    #[error("learning_rate must be a positive finite number, got {0}")]
    InvalidLearningRate(f64),
    #[error("std must be a non-negative finite number, got {0}")]
    InvalidStd(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetKind {
    Mammo,
    Kaggle,
}

impl DatasetKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Mammo => "mammo",
            Self::Kaggle => "kaggle",
        }
    }

    /// Class keys in concatenation order.
    pub fn class_keys(self) -> &'static [&'static str] {
        match self {
            Self::Mammo => &["normal", "cancer"],
            Self::Kaggle => &["1", "2", "3"],
        }
    }
}

impl FromStr for DatasetKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mammo" => Ok(Self::Mammo),
            "kaggle" => Ok(Self::Kaggle),
            other => Err(ConfigError::UnsupportedDataset(other.to_string())),
        }
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Hyperparameters fixed for one training invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub training_epochs: usize,
    pub display_step: usize,
    pub checkpoint_step: usize,
    pub sample_step: usize,
    pub batch_size: usize,
    pub z_dim: usize,
    pub hidden_dim: usize,
    pub learning_rate: f64,
    pub dataset: DatasetKind,
    pub imsize: usize,
    pub num_channels: usize,
    pub std: f64,
    pub restore: bool,
    pub shuffle: bool,
    pub seed: u64,
    /// Checkpoints kept on disk before the oldest is deleted; 0 keeps all.
    pub max_to_keep: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            training_epochs: 300,
            display_step: 5,
            checkpoint_step: 5,
            sample_step: 1,
            batch_size: 64,
            z_dim: 100,
            hidden_dim: 128,
            learning_rate: 0.0002,
            dataset: DatasetKind::Mammo,
            imsize: 256,
            num_channels: 3,
            std: 0.0,
            restore: false,
            shuffle: false,
            seed: 42,
            max_to_keep: 5,
        }
    }
}

impl RunConfig {
    pub fn image_shape(&self) -> ImageShape {
        ImageShape::square(self.imsize, self.num_channels)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("batch_size", self.batch_size),
            ("display_step", self.display_step),
            ("checkpoint_step", self.checkpoint_step),
            ("sample_step", self.sample_step),
            ("z_dim", self.z_dim),
            ("hidden_dim", self.hidden_dim),
            ("imsize", self.imsize),
            ("num_channels", self.num_channels),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Zero(*name));
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(ConfigError::InvalidLearningRate(self.learning_rate));
        }
        if !self.std.is_finite() || self.std < 0.0 {
            return Err(ConfigError::InvalidStd(self.std));
        }
        Ok(())
    }

    /// Noise parameter as it appears in output directory names (`0.0`, `0.5`).
    pub fn std_label(&self) -> String {
        format!("{:?}", self.std)
    }
}

/// Filesystem layout of a run. `{dataset}` and `{imsize}` are substituted
/// in the dataset template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunPaths {
    pub dataset_template: String,
    pub dataset_override: Option<PathBuf>,
    pub checkpoint_dir: PathBuf,
    pub output_root: PathBuf,
}

impl Default for RunPaths {
    fn default() -> Self {
        Self {
            dataset_template: DEFAULT_DATASET_TEMPLATE.to_string(),
            dataset_override: None,
            checkpoint_dir: PathBuf::from(DEFAULT_CHECKPOINT_DIR),
            output_root: PathBuf::from(DEFAULT_OUTPUT_ROOT),
        }
    }
}

impl RunPaths {
    pub fn dataset_path(&self, config: &RunConfig) -> PathBuf {
        if let Some(path) = &self.dataset_override {
            return path.clone();
        }
        PathBuf::from(
            self.dataset_template
                .replace("{dataset}", config.dataset.name())
                .replace("{imsize}", &config.imsize.to_string()),
        )
    }

    /// Checkpoint file stem; the model appends `-<epoch>` when saving.
    pub fn checkpoint_prefix(&self, config: &RunConfig) -> PathBuf {
        self.checkpoint_dir
            .join(format!("{}_model.ckpt", config.dataset.name()))
    }

    pub fn sample_dir(&self, config: &RunConfig) -> PathBuf {
        self.output_root
            .join(format!("vae_{}_{}", config.dataset.name(), config.std_label()))
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn parses_known_datasets_and_rejects_others() {
        assert_eq!("mammo".parse::<DatasetKind>().unwrap(), DatasetKind::Mammo);
        assert_eq!("kaggle".parse::<DatasetKind>().unwrap(), DatasetKind::Kaggle);
        let err = "cifar".parse::<DatasetKind>().unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedDataset(ref name) if name == "cifar"));
    }

    #[test]
    fn default_paths_follow_dataset_layout() {
        let paths = RunPaths::default();
        let config = RunConfig {
            dataset: DatasetKind::Kaggle,
            imsize: 64,
            std: 0.5,
            ..RunConfig::default()
        };

        assert_eq!(
            paths.dataset_path(&config),
            PathBuf::from("./datasets/kaggle_cancer/dataset_kaggle_train_64.pickle")
        );
        assert_eq!(
            paths.checkpoint_prefix(&config),
            PathBuf::from("./checkpoints/vae/kaggle_model.ckpt")
        );
        assert_eq!(paths.sample_dir(&config), PathBuf::from("out/vae_kaggle_0.5"));
    }

    #[test]
    fn dataset_override_wins_over_template() {
        let paths = RunPaths {
            dataset_override: Some(PathBuf::from("/data/train.sqlite")),
            ..RunPaths::default()
        };
        assert_eq!(
            paths.dataset_path(&RunConfig::default()),
            PathBuf::from("/data/train.sqlite")
        );
    }

    #[test]
    fn validate_rejects_zero_cadence() {
        let config = RunConfig {
            checkpoint_step: 0,
            ..RunConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Zero("checkpoint_step"))
        ));
        assert!(RunConfig::default().validate().is_ok());
    }

    #[test]
    fn std_label_keeps_decimal_point() {
        assert_eq!(RunConfig::default().std_label(), "0.0");
    }
}
