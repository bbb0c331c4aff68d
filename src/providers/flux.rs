//! Diffusion refinement provider.
//!
//! Pipeline per job:
//!
//! ```text
//! source ──upscale network (tiled)──► ×model scale
//!        ──Lanczos──────────────────► ×upscale_by
//!        ──backbone refine (tiled)──► same size, detail regenerated
//!        ──Lanczos──────────────────► planned output size
//! ```
//!
//! The heavy resources load lazily on the first flux job, bracketed by
//! `loading_flux_models` / `flux_models_loaded` status lines. The prompt
//! encoder is only needed to produce conditioning: empty prompts are encoded
//! once at load time and the encoder is released straight away. A job with a
//! custom `positive_prompt` brings it back just long enough to encode.

use super::esrgan::upscaler_identity;
use super::{
    CommonConfig, JobContext, Method, Provider, UpscaleError, UpscaleOutput, check_pixel_budget,
    finish_job, parse_config,
};
use crate::cache::ModelIdentity;
use crate::imaging::operations::{load_tensor, resize_tensor};
use crate::imaging::{Precision, get_dimensions, upscale_tiled};
use crate::runtime::{
    BackboneLoader, Conditioning, EncoderLoader, ModelRuntime, RefinePass, SamplerParams,
    UpscalerLoader,
};
use serde::Deserialize;
use std::hash::{BuildHasher, RandomState};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

pub const LOADING_STATUS: &str = "loading_flux_models";
pub const LOADED_STATUS: &str = "flux_models_loaded";

/// File names of the heavy pipeline pieces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FluxModels {
    pub unet: String,
    pub vae: String,
    pub clip_l: String,
    pub t5xxl: String,
}

impl Default for FluxModels {
    fn default() -> Self {
        Self {
            unet: "flux1-dev-Q8_0.gguf".to_string(),
            vae: "ae.sft".to_string(),
            clip_l: "clip_l.safetensors".to_string(),
            t5xxl: "t5xxl_fp8_e4m3fn.safetensors".to_string(),
        }
    }
}

impl FluxModels {
    fn backbone_identity(&self, runtime: &dyn ModelRuntime) -> ModelIdentity {
        let device = runtime.device();
        ModelIdentity::new(&self.unet, Precision::select(true, device), device)
    }

    fn encoder_identity(&self, runtime: &dyn ModelRuntime) -> ModelIdentity {
        let device = runtime.device();
        ModelIdentity::new(
            format!("{}+{}", self.clip_l, self.t5xxl),
            Precision::select(true, device),
            device,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FluxConfig {
    #[serde(flatten)]
    pub common: CommonConfig,
    #[serde(default = "default_upscale_by")]
    pub upscale_by: f64,
    /// Output magnification when no print target is given. Falls back to the
    /// worker default.
    #[serde(default)]
    pub upscale_factor: Option<f64>,
    #[serde(default = "default_denoise")]
    pub denoise: f32,
    #[serde(default = "default_steps")]
    pub steps: u32,
    /// 0 picks a random seed per job.
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_cfg")]
    pub cfg: f32,
    #[serde(default = "default_sampler")]
    pub sampler_name: String,
    #[serde(default = "default_scheduler")]
    pub scheduler: String,
    #[serde(default = "default_upscale_model")]
    pub upscale_model: String,
    /// Tiles are square.
    #[serde(default = "default_tile_size", alias = "tile_width")]
    pub tile_size: u32,
    #[serde(default = "default_tile_padding")]
    pub tile_padding: u32,
    #[serde(default = "default_mask_blur")]
    pub mask_blur: u32,
    #[serde(default)]
    pub positive_prompt: Option<String>,
    #[serde(default = "default_guidance")]
    pub guidance: f32,
}

fn default_upscale_by() -> f64 {
    4.0
}
fn default_denoise() -> f32 {
    0.2
}
fn default_steps() -> u32 {
    20
}
fn default_cfg() -> f32 {
    7.0
}
fn default_sampler() -> String {
    "euler".to_string()
}
fn default_scheduler() -> String {
    "normal".to_string()
}
fn default_upscale_model() -> String {
    super::esrgan::DEFAULT_MODEL.to_string()
}
fn default_tile_size() -> u32 {
    512
}
fn default_tile_padding() -> u32 {
    32
}
fn default_mask_blur() -> u32 {
    8
}
fn default_guidance() -> f32 {
    3.5
}

impl FluxConfig {
    pub fn validate(&self) -> Result<(), UpscaleError> {
        self.common.validate()?;
        let invalid = |msg: String| Err(UpscaleError::InvalidConfig(msg));
        if !(self.upscale_by.is_finite() && self.upscale_by > 0.0) {
            return invalid(format!("upscale_by must be positive, got {}", self.upscale_by));
        }
        if let Some(f) = self.upscale_factor.filter(|f| !(f.is_finite() && *f > 0.0)) {
            return invalid(format!("upscale_factor must be positive, got {}", f));
        }
        if !(0.0..=1.0).contains(&self.denoise) {
            return invalid(format!("denoise must be 0.0-1.0, got {}", self.denoise));
        }
        if !(1..=100).contains(&self.steps) {
            return invalid(format!("steps must be 1-100, got {}", self.steps));
        }
        if self.tile_size == 0 {
            return invalid("tile_size must be positive".into());
        }
        if self.tile_padding >= self.tile_size {
            return invalid(format!(
                "tile_padding {} must be smaller than tile size {}",
                self.tile_padding, self.tile_size
            ));
        }
        if !self.guidance.is_finite() {
            return invalid("guidance must be finite".into());
        }
        Ok(())
    }

    fn sampler_params(&self, seed: u64) -> SamplerParams {
        SamplerParams {
            steps: self.steps,
            cfg: self.cfg,
            sampler_name: self.sampler_name.clone(),
            scheduler: self.scheduler.clone(),
            denoise: self.denoise,
            seed,
            mask_blur: self.mask_blur,
        }
    }
}

/// Seed in `0..2^32`, fresh per call.
pub fn random_seed() -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    RandomState::new().hash_one(nanos) & u64::from(u32::MAX)
}

/// Conditioning for empty prompts, computed once at load time.
#[derive(Debug, Clone)]
struct EmptyPrompts {
    positive: Conditioning,
    negative: Conditioning,
}

#[derive(Debug, Default)]
pub struct FluxProvider {
    models: FluxModels,
    prompts: Option<EmptyPrompts>,
}

impl FluxProvider {
    pub fn new(models: FluxModels) -> Self {
        Self {
            models,
            prompts: None,
        }
    }

    /// Whether the first heavy load has completed.
    pub fn is_loaded(&self) -> bool {
        self.prompts.is_some()
    }

    fn ensure_loaded(
        &mut self,
        job: &FluxConfig,
        ctx: &mut JobContext<'_>,
    ) -> Result<&EmptyPrompts, UpscaleError> {
        let prompts = match self.prompts.take() {
            Some(p) => p,
            None => {
                ctx.status(LOADING_STATUS)?;
                let p = self.load_models(job, ctx)?;
                ctx.status(LOADED_STATUS)?;
                p
            }
        };
        Ok(self.prompts.insert(prompts))
    }

    fn load_models(
        &self,
        job: &FluxConfig,
        ctx: &mut JobContext<'_>,
    ) -> Result<EmptyPrompts, UpscaleError> {
        let config = ctx.config;
        let root = &config.model_cache_dir;
        info!(unet = %self.models.unet, "loading diffusion pipeline");

        let positive = encode_prompt(&self.models, "", job.guidance, ctx)?;
        let negative = positive.clone();

        let backbone = BackboneLoader::new(ctx.runtime, root, &self.models.unet, &self.models.vae);
        ctx.cache.backbone.acquire(
            &self.models.backbone_identity(ctx.runtime),
            &backbone,
            ctx.runtime,
        )?;

        let upscaler = UpscalerLoader {
            runtime: ctx.runtime,
            model_root: root,
        };
        ctx.cache.upscaler.acquire(
            &upscaler_identity(&job.upscale_model, true, ctx.runtime),
            &upscaler,
            ctx.runtime,
        )?;

        Ok(EmptyPrompts { positive, negative })
    }
}

/// Bring the prompt encoder in, encode `prompt`, and release it again.
fn encode_prompt(
    models: &FluxModels,
    prompt: &str,
    guidance: f32,
    ctx: &mut JobContext<'_>,
) -> Result<Conditioning, UpscaleError> {
    let loader = EncoderLoader::new(
        ctx.runtime,
        &ctx.config.model_cache_dir,
        &models.clip_l,
        &models.t5xxl,
    );
    let identity = models.encoder_identity(ctx.runtime);
    let encoder = ctx
        .cache
        .prompt_encoder
        .acquire(&identity, &loader, ctx.runtime)?;
    let conditioning = encoder.encode(prompt, guidance);
    ctx.cache.prompt_encoder.release(ctx.runtime);
    Ok(conditioning)
}

impl Provider for FluxProvider {
    fn method(&self) -> Method {
        Method::Flux
    }

    fn upscale(
        &mut self,
        config: serde_json::Value,
        ctx: &mut JobContext<'_>,
    ) -> Result<UpscaleOutput, UpscaleError> {
        let job: FluxConfig = parse_config(config)?;
        job.validate()?;
        let input_path = job.common.require_input()?;

        // Size checks run before the heavy models are brought in.
        let (width, height) = get_dimensions(input_path)?;
        let factor = job
            .upscale_factor
            .unwrap_or(f64::from(ctx.config.defaults.upscale_factor));
        let dims = job.common.plan((width, height), factor, ctx.config)?;
        let max_pixels = ctx.config.defaults.max_output_pixels;
        let base_width = f64::from(width) * job.upscale_by;
        let base_height = f64::from(height) * job.upscale_by;
        check_pixel_budget("refinement canvas", base_width, base_height, max_pixels)?;

        let prompts = self.ensure_loaded(&job, ctx)?.clone();
        let started = Instant::now();

        let seed = match job.seed {
            0 => random_seed(),
            s => s,
        };
        let source = load_tensor(input_path)?;

        let positive = match job.positive_prompt.as_deref().filter(|p| !p.is_empty()) {
            Some(prompt) => {
                debug!(prompt, "encoding custom prompt");
                encode_prompt(&self.models, prompt, job.guidance, ctx)?
            }
            None => prompts.positive.clone(),
        };

        info!(
            input = %input_path.display(),
            upscale_by = job.upscale_by,
            seed,
            steps = job.steps,
            denoise = job.denoise,
            "flux upscale"
        );

        let upscaler = UpscalerLoader {
            runtime: ctx.runtime,
            model_root: &ctx.config.model_cache_dir,
        };
        let network = ctx.cache.upscaler.acquire(
            &upscaler_identity(&job.upscale_model, true, ctx.runtime),
            &upscaler,
            ctx.runtime,
        )?;
        let scale = f64::from(network.scale());
        check_pixel_budget(
            "network output",
            f64::from(width) * scale,
            f64::from(height) * scale,
            max_pixels,
        )?;
        let magnified = upscale_tiled(&**network, &source, job.tile_size, job.tile_padding)?;
        drop(source);

        let base_width = (base_width.round() as u32).max(1);
        let base_height = (base_height.round() as u32).max(1);
        let base = resize_tensor(&magnified, base_width, base_height);
        drop(magnified);

        let backbone = BackboneLoader::new(
            ctx.runtime,
            &ctx.config.model_cache_dir,
            &self.models.unet,
            &self.models.vae,
        );
        let denoiser = ctx.cache.backbone.acquire(
            &self.models.backbone_identity(ctx.runtime),
            &backbone,
            ctx.runtime,
        )?;
        let params = job.sampler_params(seed);
        let pass = RefinePass {
            denoiser: &**denoiser,
            positive: &positive,
            negative: &prompts.negative,
            params: &params,
        };
        let refined = upscale_tiled(&pass, &base, job.tile_size, job.tile_padding)?;
        drop(base);

        finish_job(
            refined.to_rgb8(),
            dims,
            &job.common,
            Method::Flux,
            ctx.config,
            started,
        )
    }
}
