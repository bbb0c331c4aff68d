//! Parameter types for image operations.
//!
//! These types describe *what* to do, not *how* to do it. They are shared by
//! the providers (which parse them out of job configs) and the
//! [`operations`](super::operations) module (which writes files).
//!
//! ## Types
//!
//! - [`OutputFormat`]: `png` or uncompressed `tiff`.
//! - [`Precision`]: numeric precision a model is materialized at.
//! - [`Device`]: where a model lives (accelerator or general processor).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Encoded output format for saved results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Png,
    #[serde(alias = "tif")]
    Tiff,
}

impl OutputFormat {
    /// File extension written for this format.
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Tiff => "tiff",
        }
    }

    pub fn image_format(self) -> image::ImageFormat {
        match self {
            OutputFormat::Png => image::ImageFormat::Png,
            OutputFormat::Tiff => image::ImageFormat::Tiff,
        }
    }
}

/// Numeric precision of a resident model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Half,
    Full,
}

/// Where a resident model lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Accelerator,
    Cpu,
}

impl Precision {
    /// Half precision is only honoured on an accelerator.
    pub fn select(want_half: bool, device: Device) -> Self {
        if want_half && device == Device::Accelerator {
            Precision::Half
        } else {
            Precision::Full
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Precision::Half => "fp16",
            Precision::Full => "fp32",
        })
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Device::Accelerator => "accelerator",
            Device::Cpu => "cpu",
        })
    }
}
