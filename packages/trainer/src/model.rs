use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    autograd::{Act, Param, Rng, Tape},
    batch::Batch,
    checkpoint::{self, CheckpointError, CheckpointState, LoadedCheckpoint},
    config::RunConfig,
    optim::Adam,
};

/// Losses reported by one optimization step, averaged over the batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitLosses {
    pub cost: f64,
    pub l2_loss: f64,
    pub kl_loss: f64,
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("batch has {actual} images, model was built for {expected}")]
    BatchSize { expected: usize, actual: usize },
    #[error("images have {actual} values, model was built for {expected}")]
    InputWidth { expected: usize, actual: usize },
    #[error("epoch tag {0} does not fit in a checkpoint header")]
    EpochTag(usize),
    #[error("no checkpoint recorded in {}", .0.display())]
    NoCheckpoint(PathBuf),
    #[error("checkpoint does not match this model: {0}")]
    IncompatibleCheckpoint(String),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

/// The operations the training driver needs from a model.
pub trait VaeModel {
    /// One optimization step on a batch of images in [0, 1].
    fn partial_fit(&mut self, batch: &Batch) -> Result<FitLosses, ModelError>;

    /// Model output for every image of the batch, same shape, in [0, 1].
    fn reconstruct(&mut self, batch: &Batch) -> Result<Batch, ModelError>;

    /// Writes `<prefix>-<epoch_tag>` and returns the path written.
    fn save_model(&self, prefix: &Path, epoch_tag: usize) -> Result<PathBuf, ModelError>;

    /// Restores the latest checkpoint recorded in `checkpoint_dir` and
    /// returns its path.
    fn load_model(&mut self, checkpoint_dir: &Path) -> Result<PathBuf, ModelError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VaeConfig {
    pub input_dim: usize,
    pub hidden_dim: usize,
    pub z_dim: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    /// Std of the gaussian noise added to encoder inputs during training.
    pub noise_std: f64,
    pub seed: u64,
    #[serde(default)]
    pub max_to_keep: usize,
}

impl VaeConfig {
    pub fn from_run(config: &RunConfig) -> Self {
        Self {
            input_dim: config.image_shape().pixels(),
            hidden_dim: config.hidden_dim,
            z_dim: config.z_dim,
            batch_size: config.batch_size,
            learning_rate: config.learning_rate,
            noise_std: config.std,
            seed: config.seed,
            max_to_keep: config.max_to_keep,
        }
    }

    fn same_architecture(&self, other: &Self) -> bool {
        self.input_dim == other.input_dim
            && self.hidden_dim == other.hidden_dim
            && self.z_dim == other.z_dim
    }
}

/// Fully-connected VAE: one hidden layer each side of a gaussian latent,
/// sigmoid output, loss = summed squared error + KL.
#[derive(Debug)]
pub struct DenseVae {
    config: VaeConfig,
    tape: Tape,
    rng: Rng,
    optimizer: Adam,
    enc_w: usize,
    enc_b: usize,
    mu_w: usize,
    mu_b: usize,
    logvar_w: usize,
    logvar_b: usize,
    dec_w: usize,
    dec_b: usize,
    out_w: usize,
    out_b: usize,
}

impl DenseVae {
    pub fn new(config: VaeConfig) -> Self {
        let mut tape = Tape::new();
        let mut rng = Rng::new(config.seed);
        let in_std = (1.0 / config.input_dim as f64).sqrt();
        let h_std = (1.0 / config.hidden_dim as f64).sqrt();
        let z_std = (1.0 / config.z_dim as f64).sqrt();

        let enc_w = tape.add_param(Param::matrix(
            &mut rng,
            config.hidden_dim,
            config.input_dim,
            in_std,
        ));
        let enc_b = tape.add_param(Param::zeros(config.hidden_dim));
        let mu_w = tape.add_param(Param::matrix(
            &mut rng,
            config.z_dim,
            config.hidden_dim,
            h_std,
        ));
        let mu_b = tape.add_param(Param::zeros(config.z_dim));
        let logvar_w = tape.add_param(Param::matrix(
            &mut rng,
            config.z_dim,
            config.hidden_dim,
            h_std * 0.1,
        ));
        let logvar_b = tape.add_param(Param::zeros(config.z_dim));
        let dec_w = tape.add_param(Param::matrix(
            &mut rng,
            config.hidden_dim,
            config.z_dim,
            z_std,
        ));
        let dec_b = tape.add_param(Param::zeros(config.hidden_dim));
        let out_w = tape.add_param(Param::matrix(
            &mut rng,
            config.input_dim,
            config.hidden_dim,
            h_std,
        ));
        let out_b = tape.add_param(Param::zeros(config.input_dim));

        let optimizer = Adam::new(&tape, config.learning_rate);
        debug!(
            input_dim = config.input_dim,
            hidden_dim = config.hidden_dim,
            z_dim = config.z_dim,
            params = tape.params().iter().map(Param::len).sum::<usize>(),
            "dense vae built"
        );

        Self {
            config,
            tape,
            rng,
            optimizer,
            enc_w,
            enc_b,
            mu_w,
            mu_b,
            logvar_w,
            logvar_b,
            dec_w,
            dec_b,
            out_w,
            out_b,
        }
    }

    pub fn config(&self) -> VaeConfig {
        self.config
    }

    pub fn param_indices(&self) -> [usize; 10] {
        [
            self.enc_w,
            self.enc_b,
            self.mu_w,
            self.mu_b,
            self.logvar_w,
            self.logvar_b,
            self.dec_w,
            self.dec_b,
            self.out_w,
            self.out_b,
        ]
    }

    pub fn optimizer_steps(&self) -> u64 {
        self.optimizer.steps()
    }

    fn check_batch(&self, batch: &Batch) -> Result<(), ModelError> {
        if batch.len() != self.config.batch_size {
            return Err(ModelError::BatchSize {
                expected: self.config.batch_size,
                actual: batch.len(),
            });
        }
        let width = batch.shape().pixels();
        if width != self.config.input_dim {
            return Err(ModelError::InputWidth {
                expected: self.config.input_dim,
                actual: width,
            });
        }
        Ok(())
    }

    fn encode(&mut self, x: Act) -> (Act, Act) {
        let pre = self.tape.linear(self.enc_w, self.enc_b, x);
        let hidden = self.tape.relu(pre);
        let mu = self.tape.linear(self.mu_w, self.mu_b, hidden);
        let logvar = self.tape.linear(self.logvar_w, self.logvar_b, hidden);
        (mu, logvar)
    }

    fn decode(&mut self, z: Act) -> Act {
        let pre = self.tape.linear(self.dec_w, self.dec_b, z);
        let hidden = self.tape.relu(pre);
        let logits = self.tape.linear(self.out_w, self.out_b, hidden);
        self.tape.sigmoid(logits)
    }
}

impl VaeModel for DenseVae {
    fn partial_fit(&mut self, batch: &Batch) -> Result<FitLosses, ModelError> {
        self.check_batch(batch)?;
        let scale = 1.0 / batch.len() as f64;
        let noise_std = self.config.noise_std;

        self.tape.reset();
        let mut l2_total = 0.0;
        let mut kl_total = 0.0;
        for image in batch.images() {
            // one graph per image; parameter grads sum across the batch
            self.tape.clear_graph();
            let target = image.iter().map(|v| *v as f64).collect::<Vec<_>>();
            let input = if noise_std > 0.0 {
                target
                    .iter()
                    .map(|v| v + self.rng.gauss(0.0, noise_std))
                    .collect()
            } else {
                target.clone()
            };

            let x = self.tape.constant(input);
            let (mu, logvar) = self.encode(x);
            let eps = self.rng.gauss_vec(self.config.z_dim, 1.0);
            let z = self.tape.reparameterize(mu, logvar, eps);
            let recon = self.decode(z);
            let l2 = self.tape.squared_error(recon, target);
            let kl = self.tape.kl_divergence(mu, logvar);
            let total = self.tape.vec_add(l2, kl);
            let loss = self.tape.scale(total, scale);

            l2_total += self.tape.scalar(l2);
            kl_total += self.tape.scalar(kl);
            self.tape.backward(loss);
        }

        let losses = FitLosses {
            cost: (l2_total + kl_total) * scale,
            l2_loss: l2_total * scale,
            kl_loss: kl_total * scale,
        };
        if losses.cost.is_finite() {
            self.optimizer.step(&mut self.tape);
        } else {
            warn!(cost = losses.cost, "non-finite cost, skipping update");
        }
        self.tape.reset();
        Ok(losses)
    }

    fn reconstruct(&mut self, batch: &Batch) -> Result<Batch, ModelError> {
        self.check_batch(batch)?;
        let mut pixels = Vec::with_capacity(batch.pixels().len());
        for image in batch.images() {
            self.tape.clear_graph();
            let x = self
                .tape
                .constant(image.iter().map(|v| *v as f64).collect());
            // decode the posterior mean so reconstructions are repeatable
            let (mu, _) = self.encode(x);
            let recon = self.decode(mu);
            pixels.extend(self.tape.value(recon).iter().map(|v| *v as f32));
        }
        self.tape.clear_graph();
        Ok(Batch::from_pixels(batch.shape(), pixels))
    }

    fn save_model(&self, prefix: &Path, epoch_tag: usize) -> Result<PathBuf, ModelError> {
        let tag = u32::try_from(epoch_tag).map_err(|_| ModelError::EpochTag(epoch_tag))?;
        let path = checkpoint::tagged_path(prefix, tag);
        checkpoint::save(
            &path,
            &self.config,
            &self.tape,
            &self.param_indices(),
            self.optimizer.moments(),
            tag,
        )?;
        CheckpointState::record(&path, self.config.max_to_keep)?;
        debug!(path = %path.display(), epoch_tag, "checkpoint written");
        Ok(path)
    }

    fn load_model(&mut self, checkpoint_dir: &Path) -> Result<PathBuf, ModelError> {
        let path = checkpoint::latest_checkpoint(checkpoint_dir)?
            .ok_or_else(|| ModelError::NoCheckpoint(checkpoint_dir.to_path_buf()))?;
        let loaded: LoadedCheckpoint<VaeConfig> = checkpoint::load(&path)?;
        if !self.config.same_architecture(&loaded.config) {
            return Err(ModelError::IncompatibleCheckpoint(format!(
                "checkpoint is {}-{}-{}, model is {}-{}-{}",
                loaded.config.input_dim,
                loaded.config.hidden_dim,
                loaded.config.z_dim,
                self.config.input_dim,
                self.config.hidden_dim,
                self.config.z_dim
            )));
        }
        let indices = self.param_indices();
        checkpoint::apply_checkpoint(&loaded, &indices, &mut self.tape)?;
        self.optimizer
            .restore(loaded.optimizer)
            .map_err(ModelError::IncompatibleCheckpoint)?;
        debug!(
            path = %path.display(),
            epoch_tag = loaded.epoch_tag,
            "checkpoint restored"
        );
        Ok(path)
    }
}
