//! Tiled upscale-network provider.
//!
//! Decode, run the resident upscale network tile by tile (optionally twice
//! for 16× with a 4× model), resample to the planned size, save.

use super::{
    CommonConfig, JobContext, Method, Provider, UpscaleError, UpscaleOutput, check_pixel_budget,
    finish_job, parse_config,
};
use crate::cache::{LoadError, ModelCache, ModelIdentity};
use crate::imaging::operations::load_rgb;
use crate::imaging::{ImageTensor, Precision, TileTransform, upscale_tiled};
use crate::runtime::{ModelRuntime, UpscalerLoader};
use serde::Deserialize;
use std::path::Path;
use std::time::Instant;
use tracing::info;

pub const DEFAULT_MODEL: &str = "4x-UltraSharp.pth";

/// Upper bound on the second pass's tile size; its input is already
/// magnified, so tiles stay small to bound per-tile memory.
pub const SECOND_PASS_MAX_TILE: u32 = 384;

const MAX_UPSCALE_FACTOR: u32 = 8;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EsrganConfig {
    #[serde(flatten)]
    pub common: CommonConfig,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_tile_size")]
    pub tile_size: u32,
    #[serde(default = "default_tile_overlap")]
    pub tile_overlap: u32,
    #[serde(default = "default_true")]
    pub use_fp16: bool,
    #[serde(default)]
    pub use_two_pass: bool,
    /// Falls back to the worker default when absent.
    #[serde(default)]
    pub upscale_factor: Option<u32>,
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_tile_size() -> u32 {
    512
}

fn default_tile_overlap() -> u32 {
    32
}

fn default_true() -> bool {
    true
}

impl EsrganConfig {
    pub fn validate(&self) -> Result<(), UpscaleError> {
        self.common.validate()?;
        if self.model.trim().is_empty() {
            return Err(UpscaleError::InvalidConfig("model must not be empty".into()));
        }
        if self.tile_size == 0 {
            return Err(UpscaleError::InvalidConfig(
                "tile_size must be positive".into(),
            ));
        }
        let smallest_tile = self.second_pass_tile();
        if self.tile_overlap >= smallest_tile {
            return Err(UpscaleError::InvalidConfig(format!(
                "tile_overlap {} must be smaller than tile size {}",
                self.tile_overlap, smallest_tile
            )));
        }
        if let Some(f) = self
            .upscale_factor
            .filter(|f| !(1..=MAX_UPSCALE_FACTOR).contains(f))
        {
            return Err(UpscaleError::InvalidConfig(format!(
                "upscale_factor must be 1-{}, got {}",
                MAX_UPSCALE_FACTOR, f
            )));
        }
        Ok(())
    }

    /// Tile size the second pass would use (same as the first when
    /// two-pass is off).
    fn second_pass_tile(&self) -> u32 {
        if self.use_two_pass {
            self.tile_size.min(SECOND_PASS_MAX_TILE)
        } else {
            self.tile_size
        }
    }
}

/// Identity an upscale network is cached under.
pub fn upscaler_identity(name: &str, want_half: bool, runtime: &dyn ModelRuntime) -> ModelIdentity {
    let device = runtime.device();
    ModelIdentity::new(name, Precision::select(want_half, device), device)
}

/// Load `model` into the upscaler slot ahead of the first job.
pub fn prewarm(
    cache: &mut ModelCache,
    runtime: &dyn ModelRuntime,
    model_root: &Path,
    model: &str,
) -> Result<(), LoadError> {
    let identity = upscaler_identity(model, true, runtime);
    let loader = UpscalerLoader {
        runtime,
        model_root,
    };
    cache.upscaler.acquire(&identity, &loader, runtime)?;
    Ok(())
}

/// Run one or two tiled passes of `network`.
pub fn run_passes(
    network: &dyn TileTransform,
    input: &ImageTensor,
    config: &EsrganConfig,
) -> Result<ImageTensor, UpscaleError> {
    let first = upscale_tiled(network, input, config.tile_size, config.tile_overlap)?;
    if !config.use_two_pass {
        return Ok(first);
    }
    Ok(upscale_tiled(
        network,
        &first,
        config.second_pass_tile(),
        config.tile_overlap,
    )?)
}

#[derive(Debug, Default)]
pub struct EsrganProvider;

impl Provider for EsrganProvider {
    fn method(&self) -> Method {
        Method::Esrgan
    }

    fn upscale(
        &mut self,
        config: serde_json::Value,
        ctx: &mut JobContext<'_>,
    ) -> Result<UpscaleOutput, UpscaleError> {
        let started = Instant::now();
        let job: EsrganConfig = parse_config(config)?;
        job.validate()?;
        let input_path = job.common.require_input()?;

        let source = load_rgb(input_path)?;
        let factor = job
            .upscale_factor
            .unwrap_or(ctx.config.defaults.upscale_factor);
        let dims = job
            .common
            .plan(source.dimensions(), factor as f64, ctx.config)?;

        let identity = upscaler_identity(&job.model, job.use_fp16, ctx.runtime);
        let loader = UpscalerLoader {
            runtime: ctx.runtime,
            model_root: &ctx.config.model_cache_dir,
        };
        let network = ctx.cache.upscaler.acquire(&identity, &loader, ctx.runtime)?;

        let passes = if job.use_two_pass { 2 } else { 1 };
        let magnification = f64::from(network.scale()).powi(passes);
        let (width, height) = source.dimensions();
        check_pixel_budget(
            "network output",
            f64::from(width) * magnification,
            f64::from(height) * magnification,
            ctx.config.defaults.max_output_pixels,
        )?;

        info!(
            input = %input_path.display(),
            model = %identity,
            two_pass = job.use_two_pass,
            "esrgan upscale"
        );
        let tensor = ImageTensor::from_rgb8(&source);
        drop(source);
        let upscaled = run_passes(&**network, &tensor, &job)?;
        drop(tensor);

        finish_job(
            upscaled.to_rgb8(),
            dims,
            &job.common,
            Method::Esrgan,
            ctx.config,
            started,
        )
    }
}
