//! Inference runtime boundary.
//!
//! The worker never runs network math itself. Everything that does lives
//! behind [`ModelRuntime`]: it turns model files into resident objects
//! ([`TileTransform`] upscale networks, [`Denoiser`] diffusion backbones,
//! [`PromptEncoder`] text encoders) and reclaims device memory on request.
//!
//! The [`loaders`](self::loaders) submodule adapts a runtime to the
//! [`Loader`](crate::cache::Loader) interface the model cache expects,
//! resolving file names under the configured model root.
//!
//! The production implementation shipped with the crate is
//! [`ReferenceRuntime`]: pure Rust, no accelerator, with a Lanczos resampler
//! standing in for the upscale network and a pass-through refiner for the
//! diffusion backbone. It exercises every code path of the worker (tiling,
//! caching, dispatch, file layout) without a GPU stack.

pub mod loaders;
pub mod reference;

use crate::cache::{LoadError, ModelIdentity, Reclaim};
use crate::imaging::params::Device;
use crate::imaging::{ImageTensor, InferenceError, TileTransform};
use serde::Serialize;
use std::path::{Path, PathBuf};

pub use loaders::{BackboneLoader, EncoderLoader, UpscalerLoader};
pub use reference::ReferenceRuntime;

/// Text conditioning handed to the diffusion backbone.
#[derive(Debug, Clone, PartialEq)]
pub struct Conditioning {
    pub prompt: String,
    pub guidance: f32,
    pub embedding: Vec<f32>,
}

/// Sampler settings for one refinement pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SamplerParams {
    pub steps: u32,
    pub cfg: f32,
    pub sampler_name: String,
    pub scheduler: String,
    pub denoise: f32,
    pub seed: u64,
    pub mask_blur: u32,
}

/// A diffusion backbone: refines a tile in place (same size out as in).
pub trait Denoiser {
    fn refine(
        &self,
        tile: &ImageTensor,
        positive: &Conditioning,
        negative: &Conditioning,
        params: &SamplerParams,
    ) -> Result<ImageTensor, InferenceError>;
}

/// Text encoder producing conditioning for the backbone.
pub trait PromptEncoder {
    fn encode(&self, prompt: &str, guidance: f32) -> Conditioning;
}

/// Files making up a diffusion backbone.
#[derive(Debug, Clone, PartialEq)]
pub struct BackboneFiles {
    pub unet: PathBuf,
    pub vae: PathBuf,
}

/// Files making up the dual text encoder.
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderFiles {
    pub clip_l: PathBuf,
    pub t5xxl: PathBuf,
}

/// Something that can materialize models and reclaim device memory.
pub trait ModelRuntime: Reclaim {
    /// Device models are placed on.
    fn device(&self) -> Device;

    fn load_upscaler(
        &self,
        path: &Path,
        identity: &ModelIdentity,
    ) -> Result<Box<dyn TileTransform>, LoadError>;

    fn load_backbone(
        &self,
        files: &BackboneFiles,
        identity: &ModelIdentity,
    ) -> Result<Box<dyn Denoiser>, LoadError>;

    fn load_prompt_encoder(
        &self,
        files: &EncoderFiles,
        identity: &ModelIdentity,
    ) -> Result<Box<dyn PromptEncoder>, LoadError>;
}

/// Adapts a [`Denoiser`] plus fixed conditioning into a scale-1
/// [`TileTransform`], so refinement reuses the tiled blend pipeline.
pub struct RefinePass<'a> {
    pub denoiser: &'a dyn Denoiser,
    pub positive: &'a Conditioning,
    pub negative: &'a Conditioning,
    pub params: &'a SamplerParams,
}

impl TileTransform for RefinePass<'_> {
    fn scale(&self) -> u32 {
        1
    }

    fn forward(&self, tile: &ImageTensor) -> Result<ImageTensor, InferenceError> {
        self.denoiser
            .refine(tile, self.positive, self.negative, self.params)
    }
}
