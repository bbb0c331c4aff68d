//! High-level image operations.
//!
//! File-level helpers used by every provider: decode a source into a tensor,
//! resample to exact output dimensions, and write the result in each
//! requested format.

use super::params::OutputFormat;
use super::tensor::ImageTensor;
use image::imageops::FilterType;
use image::{DynamicImage, ImageReader, RgbImage};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImageIoError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to decode {path}: {source}")]
    Decode {
        path: PathBuf,
        source: image::ImageError,
    },
    #[error("Failed to encode {path}: {source}")]
    Encode {
        path: PathBuf,
        source: image::ImageError,
    },
}

/// Result type for image operations.
pub type Result<T> = std::result::Result<T, ImageIoError>;

/// Read just the pixel dimensions of an image file.
pub fn get_dimensions(path: &Path) -> Result<(u32, u32)> {
    image::image_dimensions(path).map_err(|source| ImageIoError::Decode {
        path: path.to_path_buf(),
        source,
    })
}

/// Decode an image file to 8-bit RGB.
pub fn load_rgb(path: &Path) -> Result<RgbImage> {
    let img = ImageReader::open(path)?
        .with_guessed_format()?
        .decode()
        .map_err(|source| ImageIoError::Decode {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(img.to_rgb8())
}

/// Decode encoded bytes (e.g. from a remote response) to 8-bit RGB.
pub fn decode_rgb(bytes: &[u8], origin: &str) -> Result<RgbImage> {
    image::load_from_memory(bytes)
        .map(|img| img.to_rgb8())
        .map_err(|source| ImageIoError::Decode {
            path: PathBuf::from(origin),
            source,
        })
}

/// Decode an image file straight into a normalized tensor.
pub fn load_tensor(path: &Path) -> Result<ImageTensor> {
    Ok(ImageTensor::from_rgb8(&load_rgb(path)?))
}

/// Resample to exactly `width × height` with Lanczos3. A no-op when the size
/// already matches.
pub fn resize_exact(img: RgbImage, width: u32, height: u32) -> RgbImage {
    if img.dimensions() == (width, height) {
        return img;
    }
    image::imageops::resize(&img, width, height, FilterType::Lanczos3)
}

/// Lanczos3 resample of a float tensor, keeping full precision between
/// pipeline stages.
pub fn resize_tensor(tensor: &ImageTensor, width: u32, height: u32) -> ImageTensor {
    if tensor.dimensions() == (width, height) {
        return tensor.clone();
    }
    let resized = image::imageops::resize(&tensor.to_rgb32f(), width, height, FilterType::Lanczos3);
    ImageTensor::from_rgb32f(resized)
}

/// Save an image once per requested format as `<output_dir>/<name>.<ext>`.
///
/// Creates `output_dir` if needed. Returns the written paths in the order of
/// `formats`.
pub fn save_image_formats(
    img: &RgbImage,
    output_name: &str,
    output_dir: &Path,
    formats: &[OutputFormat],
) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(output_dir)?;
    let dynamic = DynamicImage::ImageRgb8(img.clone());

    let mut saved = Vec::with_capacity(formats.len());
    for &format in formats {
        let path = output_dir.join(format!("{}.{}", output_name, format.extension()));
        dynamic
            .save_with_format(&path, format.image_format())
            .map_err(|source| ImageIoError::Encode {
                path: path.clone(),
                source,
            })?;
        saved.push(path);
    }
    Ok(saved)
}
