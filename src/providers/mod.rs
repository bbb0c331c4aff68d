//! Upscale providers.
//!
//! Each provider turns a job config into files on disk:
//!
//! | Method | Provider | Heavy resources |
//! |---|---|---|
//! | `esrgan` | [`EsrganProvider`] | one upscale network |
//! | `flux` | [`FluxProvider`] | upscale network, diffusion backbone, prompt encoder (lazy) |
//! | `imagen` | [`ImagenProvider`] | none (remote API) |
//!
//! Shared flow: validate the config, check the input exists, plan output
//! dimensions, run the provider-specific pipeline, resample to the exact
//! planned size, save in the requested format.
//!
//! Providers never hold models themselves. Everything resident lives in the
//! [`ModelCache`] handed in through [`JobContext`].

pub mod esrgan;
pub mod flux;
pub mod imagen;

pub use esrgan::EsrganProvider;
pub use flux::FluxProvider;
pub use imagen::ImagenProvider;

use crate::cache::{LoadError, ModelCache};
use crate::config::WorkerConfig;
use crate::imaging::operations::{resize_exact, save_image_formats};
use crate::imaging::{
    BlendError, CropInfo, ImageIoError, InferenceError, OutputDimensions, OutputFormat,
    PlanError, PrintTarget, TilingError, calculate_output_dimensions,
};
use crate::output::EventSink;
use crate::runtime::ModelRuntime;
use image::RgbImage;
use serde::Deserialize;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum UpscaleError {
    #[error("Input file not found: {0}")]
    InputNotFound(PathBuf),
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    #[error("Failed to load model: {0}")]
    ResourceLoad(#[from] LoadError),
    #[error("{0}")]
    RemoteCall(String),
    #[error("Inference failed: {0}")]
    Inference(#[from] InferenceError),
    #[error("Image error: {0}")]
    Imaging(#[from] ImageIoError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Writing to the job channel failed; the worker can't continue.
    #[error("Job channel closed: {0}")]
    Channel(#[source] std::io::Error),
}

impl UpscaleError {
    /// Stable name of the error class, reported in tracebacks.
    pub fn kind(&self) -> &'static str {
        match self {
            UpscaleError::InputNotFound(_) => "InputNotFound",
            UpscaleError::InvalidConfig(_) => "InvalidConfig",
            UpscaleError::ResourceLoad(_) => "ResourceLoadFailure",
            UpscaleError::RemoteCall(_) => "RemoteCallFailure",
            UpscaleError::Inference(_) => "InferenceFailure",
            UpscaleError::Imaging(_) => "ImagingFailure",
            UpscaleError::Io(_) => "IoFailure",
            UpscaleError::Channel(_) => "ChannelFailure",
        }
    }
}

impl From<PlanError> for UpscaleError {
    fn from(e: PlanError) -> Self {
        UpscaleError::InvalidConfig(e.to_string())
    }
}

impl From<TilingError> for UpscaleError {
    fn from(e: TilingError) -> Self {
        UpscaleError::InvalidConfig(e.to_string())
    }
}

impl From<BlendError> for UpscaleError {
    fn from(e: BlendError) -> Self {
        match e {
            BlendError::Tiling(e) => e.into(),
            BlendError::Inference(e) => e.into(),
        }
    }
}

/// Upscale method named in a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Esrgan,
    Flux,
    Imagen,
}

impl Method {
    pub const ALL: [Method; 3] = [Method::Esrgan, Method::Flux, Method::Imagen];

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Esrgan => "esrgan",
            Method::Flux => "flux",
            Method::Imagen => "imagen",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Method::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| s.to_string())
    }
}

/// Everything a provider may touch while running one job.
pub struct JobContext<'a> {
    pub cache: &'a mut ModelCache,
    pub runtime: &'a dyn ModelRuntime,
    pub config: &'a WorkerConfig,
    pub events: &'a mut dyn EventSink,
}

impl JobContext<'_> {
    /// Emit a status line; a failed write is fatal for the worker.
    pub fn status(&mut self, message: &str) -> Result<(), UpscaleError> {
        self.events.status(message).map_err(UpscaleError::Channel)
    }
}

/// What a finished job produced.
#[derive(Debug, Clone, PartialEq)]
pub struct UpscaleOutput {
    pub output_paths: Vec<PathBuf>,
    pub output_width: u32,
    pub output_height: u32,
    pub crop_info: Option<CropInfo>,
    pub processing_time: f64,
}

/// One upscale method.
pub trait Provider {
    fn method(&self) -> Method;

    fn upscale(
        &mut self,
        config: serde_json::Value,
        ctx: &mut JobContext<'_>,
    ) -> Result<UpscaleOutput, UpscaleError>;
}

/// Deserialize a provider config, mapping shape errors to `InvalidConfig`.
pub fn parse_config<T: serde::de::DeserializeOwned>(
    value: serde_json::Value,
) -> Result<T, UpscaleError> {
    serde_json::from_value(value).map_err(|e| UpscaleError::InvalidConfig(e.to_string()))
}

/// Fields every provider accepts.
///
/// Unknown keys are ignored: the orchestrator sends one superset shape to
/// every method.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CommonConfig {
    pub image_path: PathBuf,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default)]
    pub output_name: Option<String>,
    #[serde(default)]
    pub output_format: OutputFormat,
    #[serde(default)]
    pub target_dpi: Option<u32>,
    #[serde(default)]
    pub target_width_inches: Option<f64>,
    #[serde(default)]
    pub target_height_inches: Option<f64>,
}

impl CommonConfig {
    /// Fail with `InputNotFound` unless the source image exists.
    pub fn require_input(&self) -> Result<&Path, UpscaleError> {
        if self.image_path.is_file() {
            Ok(&self.image_path)
        } else {
            Err(UpscaleError::InputNotFound(self.image_path.clone()))
        }
    }

    /// Print target when both inches are given; `None` means "scale by factor".
    pub fn print_target(&self, default_dpi: u32) -> Result<Option<PrintTarget>, UpscaleError> {
        let dpi = self.target_dpi.unwrap_or(default_dpi);
        if dpi == 0 {
            return Err(UpscaleError::InvalidConfig(
                "target_dpi must be positive".into(),
            ));
        }
        match (self.target_width_inches, self.target_height_inches) {
            (Some(w), Some(h)) => {
                if !(w > 0.0 && h > 0.0) {
                    return Err(UpscaleError::InvalidConfig(format!(
                        "target print size must be positive, got {}\" x {}\"",
                        w, h
                    )));
                }
                Ok(Some(PrintTarget {
                    width_inches: w,
                    height_inches: h,
                    dpi,
                }))
            }
            _ => Ok(None),
        }
    }

    /// Output directory: the job's own, else the configured default.
    pub fn output_dir<'a>(&'a self, config: &'a WorkerConfig) -> &'a Path {
        self.output_dir.as_deref().unwrap_or(&config.output_dir)
    }

    /// Output base name: the job's own, else `<input stem>_<method>`.
    pub fn output_name(&self, method: Method) -> String {
        match &self.output_name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => {
                let stem = self
                    .image_path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "output".to_string());
                format!("{}_{}", stem, method)
            }
        }
    }

    /// Reject an `output_name` that isn't a single plain file name.
    pub fn validate(&self) -> Result<(), UpscaleError> {
        let Some(name) = self.output_name.as_deref().filter(|n| !n.is_empty()) else {
            return Ok(());
        };
        let mut components = Path::new(name).components();
        let single_file = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        );
        if !single_file || name.contains(['/', '\\']) {
            return Err(UpscaleError::InvalidConfig(format!(
                "output_name must be a plain file name, got {:?}",
                name
            )));
        }
        Ok(())
    }

    /// Plan output dimensions for an input of `input` pixels.
    ///
    /// Plans larger than `defaults.max_output_pixels` are rejected before
    /// anything is allocated.
    pub fn plan(
        &self,
        input: (u32, u32),
        upscale_factor: f64,
        config: &WorkerConfig,
    ) -> Result<OutputDimensions, UpscaleError> {
        let max_pixels = config.defaults.max_output_pixels;
        let target = self.print_target(config.defaults.dpi)?;
        match target {
            Some(t) => check_pixel_budget(
                "print target",
                t.width_inches * f64::from(t.dpi),
                t.height_inches * f64::from(t.dpi),
                max_pixels,
            )?,
            None => check_pixel_budget(
                "output",
                f64::from(input.0) * upscale_factor,
                f64::from(input.1) * upscale_factor,
                max_pixels,
            )?,
        }
        let dims = calculate_output_dimensions(input, upscale_factor, target)?;
        check_pixel_budget(
            "output",
            f64::from(dims.output_width),
            f64::from(dims.output_height),
            max_pixels,
        )?;
        Ok(dims)
    }
}

/// Fail with `InvalidConfig` unless a `width × height` image fits in
/// `max_pixels` and in `u32` per side.
///
/// Sizes are taken as floats so the check runs before any `as u32` cast.
pub fn check_pixel_budget(
    what: &str,
    width: f64,
    height: f64,
    max_pixels: u64,
) -> Result<(), UpscaleError> {
    let side_limit = f64::from(u32::MAX);
    let fits = width.is_finite()
        && height.is_finite()
        && width <= side_limit
        && height <= side_limit
        && width * height <= max_pixels as f64;
    if fits {
        Ok(())
    } else {
        Err(UpscaleError::InvalidConfig(format!(
            "{} of {:.0}x{:.0} px exceeds the limit of {} pixels",
            what, width, height, max_pixels
        )))
    }
}

/// Resample to the planned size, write every requested format, and report.
pub fn finish_job(
    image: RgbImage,
    dims: OutputDimensions,
    common: &CommonConfig,
    method: Method,
    config: &WorkerConfig,
    started: Instant,
) -> Result<UpscaleOutput, UpscaleError> {
    if dims.output_width == 0 || dims.output_height == 0 {
        return Err(UpscaleError::InvalidConfig(format!(
            "planned output is empty ({}x{})",
            dims.output_width, dims.output_height
        )));
    }
    check_pixel_budget(
        "output",
        f64::from(dims.output_width),
        f64::from(dims.output_height),
        config.defaults.max_output_pixels,
    )?;
    let resized = resize_exact(image, dims.output_width, dims.output_height);
    let output_paths = save_image_formats(
        &resized,
        &common.output_name(method),
        common.output_dir(config),
        &[common.output_format],
    )?;
    Ok(UpscaleOutput {
        output_paths,
        output_width: dims.output_width,
        output_height: dims.output_height,
        crop_info: dims.crop_info,
        processing_time: started.elapsed().as_secs_f64(),
    })
}
