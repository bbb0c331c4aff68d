//! The opaque per-tile transform boundary.
//!
//! The [`TileTransform`] trait is the only thing the tiling and blending code
//! knows about a neural network: it has an integer magnification and maps a
//! tile to a tile `scale` times larger. What happens inside (an ESRGAN-style
//! network on an accelerator, a diffusion refiner, or the pure-Rust reference
//! resampler in [`crate::runtime`]) is none of the compositor's business.
//!
//! Implementations are called one tile at a time, synchronously, from the
//! single job thread.

use super::tensor::ImageTensor;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("inference failed: {0}")]
    Failed(String),
    #[error("tile output is {got_w}x{got_h}, expected {expected_w}x{expected_h}")]
    ShapeMismatch {
        expected_w: u32,
        expected_h: u32,
        got_w: u32,
        got_h: u32,
    },
}

/// A transform applied independently to each tile.
pub trait TileTransform {
    /// Integer magnification: output tiles are `scale` times the input.
    fn scale(&self) -> u32;

    /// Transform one tile. The output must be exactly `scale` times the
    /// input in both dimensions.
    fn forward(&self, tile: &ImageTensor) -> Result<ImageTensor, InferenceError>;
}

impl<T: TileTransform + ?Sized> TileTransform for Box<T> {
    fn scale(&self) -> u32 {
        (**self).scale()
    }

    fn forward(&self, tile: &ImageTensor) -> Result<ImageTensor, InferenceError> {
        (**self).forward(tile)
    }
}
