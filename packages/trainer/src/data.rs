use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
};

use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    config::DatasetKind,
    pickle::{self, NdArray, Object, PickleError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageShape {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl ImageShape {
    pub fn square(size: usize, channels: usize) -> Self {
        Self {
            height: size,
            width: size,
            channels,
        }
    }

    /// Values per image (height x width x channels).
    pub fn pixels(&self) -> usize {
        self.height * self.width * self.channels
    }
}

#[derive(Debug, Error)]
pub enum DataError {
    #[error("dataset file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unsupported dataset format {} (expected .pickle, .pkl, .sqlite or .db)", .0.display())]
    UnsupportedFormat(PathBuf),
    #[error("pickle decode error: {0}")]
    Pickle(#[from] PickleError),
    #[error("sqlite error: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("pickled dataset must be a dict of class name to images")]
    NotAMapping,
    #[error("dataset is missing class key '{0}'")]
    MissingClass(String),
    #[error("class '{0}' has no images")]
    EmptyClass(String),
    #[error("class '{class}' image {index}: {reason}")]
    InvalidImage {
        class: String,
        index: usize,
        reason: String,
    },
    #[error("class '{class}' image {index} has {actual} values, expected {expected}")]
    ImageSize {
        class: String,
        index: usize,
        actual: usize,
        expected: usize,
    },
}

/// Images of every class, concatenated along the sample axis.
///
/// Pixels are stored sample-major in HWC order and keep the [-1, 1]
/// convention of the source files.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    shape: ImageShape,
    pixels: Vec<f32>,
    class_counts: Vec<(String, usize)>,
}

impl Dataset {
    pub fn from_classes(
        shape: ImageShape,
        classes: Vec<(String, Vec<Vec<f32>>)>,
    ) -> Result<Self, DataError> {
        let expected = shape.pixels();
        let total = classes.iter().map(|(_, images)| images.len()).sum::<usize>();
        let mut pixels = Vec::with_capacity(total * expected);
        let mut class_counts = Vec::with_capacity(classes.len());

        for (class, images) in classes {
            for (index, image) in images.iter().enumerate() {
                if image.len() != expected {
                    return Err(DataError::ImageSize {
                        class,
                        index,
                        actual: image.len(),
                        expected,
                    });
                }
                pixels.extend_from_slice(image);
            }
            class_counts.push((class, images.len()));
        }

        Ok(Self {
            shape,
            pixels,
            class_counts,
        })
    }

    pub fn len(&self) -> usize {
        self.class_counts.iter().map(|(_, n)| n).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shape(&self) -> ImageShape {
        self.shape
    }

    pub fn class_counts(&self) -> &[(String, usize)] {
        &self.class_counts
    }

    pub fn image(&self, index: usize) -> &[f32] {
        let width = self.shape.pixels();
        &self.pixels[index * width..(index + 1) * width]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StoreFormat {
    Pickle,
    Sqlite,
}

impl StoreFormat {
    fn from_path(path: &Path) -> Result<Self, DataError> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("pickle") | Some("pkl") => Ok(Self::Pickle),
            Some("sqlite") | Some("db") => Ok(Self::Sqlite),
            _ => Err(DataError::UnsupportedFormat(path.to_path_buf())),
        }
    }
}

pub fn load_mammo_data(path: &Path, shape: ImageShape) -> Result<Dataset, DataError> {
    load_dataset(DatasetKind::Mammo, path, shape)
}

pub fn load_kaggle_data(path: &Path, shape: ImageShape) -> Result<Dataset, DataError> {
    load_dataset(DatasetKind::Kaggle, path, shape)
}

pub fn load_dataset(
    kind: DatasetKind,
    path: &Path,
    shape: ImageShape,
) -> Result<Dataset, DataError> {
    if !path.exists() {
        return Err(DataError::NotFound(path.to_path_buf()));
    }
    let keys = kind.class_keys();
    let classes = match StoreFormat::from_path(path)? {
        StoreFormat::Pickle => read_pickle_classes(path, keys)?,
        StoreFormat::Sqlite => {
            let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
            read_store_classes(&conn, keys)?
        }
    };
    if let Some((class, _)) = classes.iter().find(|(_, images)| images.is_empty()) {
        return Err(DataError::EmptyClass(class.clone()));
    }
    let dataset = Dataset::from_classes(shape, classes)?;

    for (class, count) in dataset.class_counts() {
        debug!(class = %class, count, "class loaded");
    }
    info!(
        dataset = %kind,
        path = %path.display(),
        samples = dataset.len(),
        "dataset loaded"
    );
    Ok(dataset)
}

// ---------------------------------------------------------------------------
// Pickle store
// ---------------------------------------------------------------------------

fn read_pickle_classes(
    path: &Path,
    keys: &[&str],
) -> Result<Vec<(String, Vec<Vec<f32>>)>, DataError> {
    let file = File::open(path).map_err(|source| DataError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut root = pickle::from_reader(BufReader::new(file))?;
    if !matches!(root, Object::Dict(_)) {
        return Err(DataError::NotAMapping);
    }

    let mut classes = Vec::with_capacity(keys.len());
    for key in keys {
        let value = root
            .take_entry(key)
            .ok_or_else(|| DataError::MissingClass(key.to_string()))?;
        classes.push((key.to_string(), class_images(key, value)?));
    }
    Ok(classes)
}

/// A class is either one array whose leading axis indexes images, or a
/// sequence of images (arrays or nested lists).
fn class_images(class: &str, value: Object) -> Result<Vec<Vec<f32>>, DataError> {
    let invalid = |index: usize, reason: String| DataError::InvalidImage {
        class: class.to_string(),
        index,
        reason,
    };
    match value {
        Object::Array(array) => split_samples(&array).map_err(|reason| invalid(0, reason)),
        Object::List(items) | Object::Tuple(items) => items
            .iter()
            .enumerate()
            .map(|(index, item)| {
                let mut pixels = Vec::new();
                flatten_numbers(item, &mut pixels).map_err(|reason| invalid(index, reason))?;
                Ok(pixels)
            })
            .collect(),
        _ => Err(invalid(
            0,
            "class value is not an array or a list of images".to_string(),
        )),
    }
}

fn split_samples(array: &NdArray) -> Result<Vec<Vec<f32>>, String> {
    let Some((&count, image_axes)) = array.shape.split_first() else {
        return Err("0-d array has no sample axis".to_string());
    };
    let width = image_axes.iter().product::<usize>();
    if image_axes.is_empty() || width == 0 {
        return Err(format!("array of shape {:?} holds no image axes", array.shape));
    }
    if count == 0 {
        return Ok(Vec::new());
    }
    Ok(array.data.chunks_exact(width).map(<[f32]>::to_vec).collect())
}

fn flatten_numbers(value: &Object, out: &mut Vec<f32>) -> Result<(), String> {
    match value {
        Object::Float(v) => out.push(*v as f32),
        Object::Int(v) => out.push(*v as f32),
        Object::Array(array) => out.extend_from_slice(&array.data),
        Object::List(items) | Object::Tuple(items) => {
            for item in items {
                flatten_numbers(item, out)?;
            }
        }
        _ => return Err("expected an array or nested lists of numbers".to_string()),
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// SQLite store: images(class TEXT, idx INTEGER, pixels BLOB of f32 LE)
// ---------------------------------------------------------------------------

fn parse_pixel_blob(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

fn read_store_classes(
    conn: &Connection,
    keys: &[&str],
) -> Result<Vec<(String, Vec<Vec<f32>>)>, DataError> {
    let mut stmt = conn.prepare("SELECT pixels FROM images WHERE class = ?1 ORDER BY idx ASC")?;

    let mut classes = Vec::with_capacity(keys.len());
    for key in keys {
        let mut rows = stmt.query(rusqlite::params![key])?;
        let mut images = Vec::new();
        while let Some(row) = rows.next()? {
            let blob: Vec<u8> = row.get(0)?;
            let pixels = parse_pixel_blob(&blob).ok_or_else(|| DataError::InvalidImage {
                class: key.to_string(),
                index: images.len(),
                reason: format!("pixel blob of {} bytes is not a whole number of f32", blob.len()),
            })?;
            images.push(pixels);
        }
        classes.push((key.to_string(), images));
    }
    Ok(classes)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
