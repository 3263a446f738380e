use std::{
    fs::{self, File},
    io::{self, BufReader, BufWriter, Read, Write},
    path::{Path, PathBuf},
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::{
    autograd::Tape,
    optim::{AdamMoments, AdamState},
};

const MAGIC: &[u8; 4] = b"SVAE";
const VERSION: u32 = 1;

/// Index file kept next to the checkpoints, naming the latest one.
pub const STATE_FILE: &str = "checkpoint";

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid checkpoint: {0}")]
    InvalidFormat(String),
    #[error("checkpoint json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug)]
pub struct LoadedCheckpoint<C> {
    pub version: u32,
    pub epoch_tag: u32,
    pub config: C,
    pub params: Vec<Vec<f64>>,
    pub optimizer: AdamState,
}

/// `<prefix>-<epoch_tag>`, e.g. `mammo_model.ckpt-15`.
pub fn tagged_path(prefix: &Path, epoch_tag: u32) -> PathBuf {
    let mut name = prefix
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!("-{epoch_tag}"));
    prefix.with_file_name(name)
}

pub fn save<C: Serialize>(
    path: &Path,
    config: &C,
    tape: &Tape,
    param_indices: &[usize],
    optimizer: AdamMoments<'_>,
    epoch_tag: u32,
) -> Result<(), CheckpointError> {
    let mut tmp_name = path.as_os_str().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    {
        let mut file = BufWriter::new(File::create(&tmp_path)?);
        let config_json = serde_json::to_vec(config)?;

        file.write_all(MAGIC)?;
        file.write_all(&VERSION.to_le_bytes())?;
        file.write_all(&epoch_tag.to_le_bytes())?;
        file.write_all(&(config_json.len() as u32).to_le_bytes())?;
        file.write_all(&config_json)?;

        file.write_all(&(param_indices.len() as u32).to_le_bytes())?;
        for param_idx in param_indices {
            write_f64s(&mut file, &tape.params()[*param_idx].data)?;
        }

        file.write_all(&optimizer.step.to_le_bytes())?;
        file.write_all(&(optimizer.first.len() as u32).to_le_bytes())?;
        for (m, v) in optimizer.first.iter().zip(optimizer.second) {
            write_f64s(&mut file, m)?;
            write_f64s(&mut file, v)?;
        }
        file.flush()?;
    }

    fs::rename(&tmp_path, path)?;
    Ok(())
}

pub fn load<C: DeserializeOwned>(path: &Path) -> Result<LoadedCheckpoint<C>, CheckpointError> {
    let mut file = BufReader::new(File::open(path)?);
    let mut magic = [0_u8; 4];
    file.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(CheckpointError::InvalidFormat("bad magic".to_string()));
    }

    let version = read_u32(&mut file)?;
    if version != VERSION {
        return Err(CheckpointError::InvalidFormat(format!(
            "unsupported version {version}"
        )));
    }
    let epoch_tag = read_u32(&mut file)?;
    let config_len = read_u32(&mut file)? as usize;

    let mut config_bytes = vec![0_u8; config_len];
    file.read_exact(&mut config_bytes)?;
    let config: C = serde_json::from_slice(&config_bytes)?;

    let param_count = read_u32(&mut file)? as usize;
    let mut params = Vec::with_capacity(param_count);
    for _ in 0..param_count {
        params.push(read_f64s(&mut file)?);
    }

    let step = read_u64(&mut file)?;
    let slot_count = read_u32(&mut file)? as usize;
    let mut first_moments = Vec::with_capacity(slot_count);
    let mut second_moments = Vec::with_capacity(slot_count);
    for _ in 0..slot_count {
        first_moments.push(read_f64s(&mut file)?);
        second_moments.push(read_f64s(&mut file)?);
    }

    Ok(LoadedCheckpoint {
        version,
        epoch_tag,
        config,
        params,
        optimizer: AdamState {
            step,
            first_moments,
            second_moments,
        },
    })
}

pub fn apply_checkpoint<C>(
    loaded: &LoadedCheckpoint<C>,
    param_indices: &[usize],
    tape: &mut Tape,
) -> Result<(), CheckpointError> {
    if loaded.params.len() != param_indices.len() {
        return Err(CheckpointError::InvalidFormat(
            "parameter count mismatch".to_string(),
        ));
    }

    for (slot, param_idx) in param_indices.iter().enumerate() {
        let target = &mut tape.params_mut()[*param_idx];
        if target.data.len() != loaded.params[slot].len() {
            return Err(CheckpointError::InvalidFormat(format!(
                "parameter {} size mismatch: {} != {}",
                slot,
                target.data.len(),
                loaded.params[slot].len()
            )));
        }
        target.data.copy_from_slice(&loaded.params[slot]);
    }

    Ok(())
}

/// Contents of the [`STATE_FILE`] index. Entries are file names relative to
/// the checkpoint directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub model_checkpoint_path: String,
    pub all_model_checkpoint_paths: Vec<String>,
}

impl CheckpointState {
    pub fn read(dir: &Path) -> Result<Option<Self>, CheckpointError> {
        let path = dir.join(STATE_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Marks `written` as the latest checkpoint in its directory. With
    /// `max_to_keep > 0` the oldest entries past that count leave the index
    /// and their files are deleted; 0 keeps everything.
    pub fn record(written: &Path, max_to_keep: usize) -> Result<Self, CheckpointError> {
        let dir = written.parent().unwrap_or_else(|| Path::new("."));
        let name = written
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                CheckpointError::InvalidFormat(format!(
                    "checkpoint path {} has no file name",
                    written.display()
                ))
            })?
            .to_string();

        let mut state = Self::read(dir)?.unwrap_or_default();
        state.all_model_checkpoint_paths.retain(|n| *n != name);
        state.all_model_checkpoint_paths.push(name.clone());
        state.model_checkpoint_path = name;

        let excess = match max_to_keep {
            0 => 0,
            keep => state.all_model_checkpoint_paths.len().saturating_sub(keep),
        };
        let stale = state
            .all_model_checkpoint_paths
            .drain(..excess)
            .collect::<Vec<_>>();

        fs::write(dir.join(STATE_FILE), serde_json::to_vec_pretty(&state)?)?;

        for old in stale {
            match fs::remove_file(dir.join(&old)) {
                Ok(()) => debug!(checkpoint = %old, "old checkpoint removed"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(state)
    }
}

/// Path of the latest recorded checkpoint, if the index names one that exists.
pub fn latest_checkpoint(dir: &Path) -> Result<Option<PathBuf>, CheckpointError> {
    let Some(state) = CheckpointState::read(dir)? else {
        return Ok(None);
    };
    if state.model_checkpoint_path.is_empty() {
        return Ok(None);
    }
    let path = dir.join(&state.model_checkpoint_path);
    Ok(path.exists().then_some(path))
}

fn write_f64s(writer: &mut impl Write, values: &[f64]) -> Result<(), CheckpointError> {
    writer.write_all(&(values.len() as u32).to_le_bytes())?;
    for value in values {
        writer.write_all(&value.to_le_bytes())?;
    }
    Ok(())
}

fn read_f64s(reader: &mut impl Read) -> Result<Vec<f64>, CheckpointError> {
    let len = read_u32(reader)? as usize;
    // length comes from the file; cap the up-front allocation
    let mut values = Vec::with_capacity(len.min(1 << 20));
    for _ in 0..len {
        values.push(read_f64(reader)?);
    }
    Ok(values)
}

fn read_u32(reader: &mut impl Read) -> Result<u32, CheckpointError> {
    let mut bytes = [0_u8; 4];
    reader.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

fn read_u64(reader: &mut impl Read) -> Result<u64, CheckpointError> {
    let mut bytes = [0_u8; 8];
    reader.read_exact(&mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}

fn read_f64(reader: &mut impl Read) -> Result<f64, CheckpointError> {
    let mut bytes = [0_u8; 8];
    reader.read_exact(&mut bytes)?;
    Ok(f64::from_le_bytes(bytes))
}
