use std::{
    fs::{self, File},
    io::BufWriter,
    path::{Path, PathBuf},
};

use thiserror::Error;

use crate::{batch::Batch, data::ImageShape};

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("cannot encode {0}-channel images as png")]
    UnsupportedChannels(usize),
    #[error("image dimensions {0}x{1} exceed png limits")]
    TooLarge(usize, usize),
    #[error("reconstruction batch has {recons} images but input batch has {actual}")]
    BatchMismatch { actual: usize, recons: usize },
    #[error("image io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("png encoding error: {0}")]
    Encoding(#[from] png::EncodingError),
}

/// [0, 1] → [0, 255], rounded and clipped.
pub fn unit_to_u8(value: f32) -> u8 {
    (value * 255.0).round().clamp(0.0, 255.0) as u8
}

/// [-1, 1] → [0, 255] through the unit range.
pub fn signed_to_u8(value: f32) -> u8 {
    unit_to_u8((value + 1.0) / 2.0)
}

pub fn write_png(path: &Path, image: &[f32], shape: ImageShape) -> Result<(), ImageError> {
    let color = match shape.channels {
        1 => png::ColorType::Grayscale,
        2 => png::ColorType::GrayscaleAlpha,
        3 => png::ColorType::Rgb,
        4 => png::ColorType::Rgba,
        n => return Err(ImageError::UnsupportedChannels(n)),
    };
    let (width, height) = match (u32::try_from(shape.width), u32::try_from(shape.height)) {
        (Ok(w), Ok(h)) => (w, h),
        _ => return Err(ImageError::TooLarge(shape.width, shape.height)),
    };
    let bytes = image.iter().map(|v| unit_to_u8(*v)).collect::<Vec<_>>();

    let file = BufWriter::new(File::create(path)?);
    let mut encoder = png::Encoder::new(file, width, height);
    encoder.set_color(color);
    encoder.set_depth(png::BitDepth::Eight);
    let mut writer = encoder.write_header()?;
    writer.write_image_data(&bytes)?;
    writer.finish()?;
    Ok(())
}

/// Writes `iter_<epoch>_<j>_recons.png` and `iter_<epoch>_<j>_actual.png`
/// for every image `j`. Both batches are expected in [0, 1].
pub fn write_reconstructions(
    dir: &Path,
    epoch: usize,
    actual: &Batch,
    recons: &Batch,
) -> Result<Vec<PathBuf>, ImageError> {
    if actual.len() != recons.len() {
        return Err(ImageError::BatchMismatch {
            actual: actual.len(),
            recons: recons.len(),
        });
    }
    fs::create_dir_all(dir)?;

    let mut written = Vec::with_capacity(actual.len() * 2);
    for (j, (real, recon)) in actual.images().zip(recons.images()).enumerate() {
        let recon_path = dir.join(format!("iter_{epoch}_{j}_recons.png"));
        write_png(&recon_path, recon, recons.shape())?;
        written.push(recon_path);

        let actual_path = dir.join(format!("iter_{epoch}_{j}_actual.png"));
        write_png(&actual_path, real, actual.shape())?;
        written.push(actual_path);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn decode(path: &Path) -> (png::OutputInfo, Vec<u8>) {
        let decoder = png::Decoder::new(File::open(path).unwrap());
        let mut reader = decoder.read_info().unwrap();
        let mut buf = vec![0u8; reader.output_buffer_size()];
        let info = reader.next_frame(&mut buf).unwrap();
        buf.truncate(info.buffer_size());
        (info, buf)
    }

    #[test]
    fn signed_chain_rounds_and_clips() {
        for step in -220..=220 {
            let x = step as f32 / 200.0;
            let expected = (((x + 1.0) / 2.0 * 255.0).round()).clamp(0.0, 255.0) as u8;
            assert_eq!(signed_to_u8(x), expected, "x = {x}");
        }
        assert_eq!(signed_to_u8(-1.0), 0);
        assert_eq!(signed_to_u8(0.0), 128);
        assert_eq!(signed_to_u8(1.0), 255);
        assert_eq!(signed_to_u8(3.0), 255);
        assert_eq!(signed_to_u8(-3.0), 0);
    }

    #[test]
    fn rgb_png_round_trips_pixels() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("img.png");
        let shape = ImageShape::square(2, 3);
        let image = [0.0, 0.5, 1.0, 1.0, 0.0, 0.5, 0.25, 0.75, 0.0, 1.0, 1.0, 1.0];

        write_png(&path, &image, shape).unwrap();
        let (info, bytes) = decode(&path);
        assert_eq!((info.width, info.height), (2, 2));
        assert_eq!(info.color_type, png::ColorType::Rgb);
        assert_eq!(
            bytes,
            vec![0, 128, 255, 255, 0, 128, 64, 191, 0, 255, 255, 255]
        );
    }

    #[test]
    fn unsupported_channel_count_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("img.png");
        let err = write_png(&path, &[0.0; 5], ImageShape::square(1, 5)).unwrap_err();
        assert!(matches!(err, ImageError::UnsupportedChannels(5)));
    }

    #[test]
    fn reconstructions_are_named_by_epoch_and_index() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("vae_mammo_0.0");
        let shape = ImageShape::square(2, 1);
        let actual = Batch::from_pixels(shape, vec![0.25; 8]);
        let recons = Batch::from_pixels(shape, vec![0.75; 8]);

        let written = write_reconstructions(&out, 7, &actual, &recons).unwrap();
        let names = written
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        assert_eq!(
            names,
            vec![
                "iter_7_0_recons.png",
                "iter_7_0_actual.png",
                "iter_7_1_recons.png",
                "iter_7_1_actual.png",
            ]
        );
        let (_, bytes) = decode(&out.join("iter_7_1_recons.png"));
        assert_eq!(bytes, vec![191; 4]);
    }
}
