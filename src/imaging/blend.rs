//! Feathered recomposition of transformed tiles.
//!
//! Every tile's output is multiplied by a weight mask and summed into an
//! accumulation canvas; a parallel weight plane sums the masks. Dividing the
//! two at the end normalizes overlapping contributions, so overlaps neither
//! brighten nor darken the image.
//!
//! The mask is 1 everywhere except along *interior* edges, where it ramps
//! linearly from 0 at the edge to 1 over `feather = overlap * scale / 2`
//! pixels. Edges touching the true image border are never feathered, which
//! keeps the border pixels at full weight.

use rayon::prelude::*;
use thiserror::Error;
use tracing::debug;

use super::backend::{InferenceError, TileTransform};
use super::tensor::{CHANNELS, ImageTensor};
use super::tiling::{Tile, TileGrid, TilingError};

/// Floor applied to the weight plane before dividing.
pub const WEIGHT_EPSILON: f32 = 1e-8;

#[derive(Error, Debug)]
pub enum BlendError {
    #[error(transparent)]
    Tiling(#[from] TilingError),
    #[error(transparent)]
    Inference(#[from] InferenceError),
}

/// Weighted-sum output plus per-pixel weight totals.
#[derive(Debug)]
pub struct Canvas {
    width: u32,
    height: u32,
    output: Vec<f32>,
    weight: Vec<f32>,
}

impl Canvas {
    pub fn new(width: u32, height: u32) -> Self {
        let pixels = width as usize * height as usize;
        Self {
            width,
            height,
            output: vec![0.0; pixels * CHANNELS],
            weight: vec![0.0; pixels],
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Total weight accumulated at `(x, y)`.
    pub fn weight_at(&self, x: u32, y: u32) -> f32 {
        self.weight[y as usize * self.width as usize + x as usize]
    }

    /// Add one transformed tile into the canvas.
    ///
    /// `pixels` must match the tile's destination rectangle exactly.
    pub fn accumulate(
        &mut self,
        grid: &TileGrid,
        tile: &Tile,
        pixels: &ImageTensor,
    ) -> Result<(), InferenceError> {
        let dest = tile.dest;
        if pixels.dimensions() != (dest.width(), dest.height()) {
            return Err(InferenceError::ShapeMismatch {
                expected_w: dest.width(),
                expected_h: dest.height(),
                got_w: pixels.width(),
                got_h: pixels.height(),
            });
        }

        let feather = grid.overlap * grid.scale / 2;
        let row_weights = edge_ramp(
            dest.height(),
            feather,
            tile.row > 0,
            tile.row + 1 < grid.rows,
        );
        let col_weights = edge_ramp(
            dest.width(),
            feather,
            tile.col > 0,
            tile.col + 1 < grid.cols,
        );

        let src = pixels.as_slice();
        let tile_w = dest.width() as usize;
        let canvas_w = self.width as usize;
        for (ty, &wy) in row_weights.iter().enumerate() {
            let cy = dest.y0 as usize + ty;
            for (tx, &wx) in col_weights.iter().enumerate() {
                let m = wy * wx;
                let cp = cy * canvas_w + dest.x0 as usize + tx;
                let sp = (ty * tile_w + tx) * CHANNELS;
                for c in 0..CHANNELS {
                    self.output[cp * CHANNELS + c] += src[sp + c] * m;
                }
                self.weight[cp] += m;
            }
        }
        Ok(())
    }

    /// Divide the weighted sums by the weights and return the image.
    pub fn finalize(self) -> ImageTensor {
        let Canvas {
            width,
            height,
            mut output,
            weight,
        } = self;
        output
            .par_chunks_mut(CHANNELS)
            .zip(weight.par_iter())
            .for_each(|(px, &w)| {
                let w = w.max(WEIGHT_EPSILON);
                px.iter_mut().for_each(|v| *v /= w);
            });
        ImageTensor::from_raw(width, height, output)
            .unwrap_or_else(|| ImageTensor::zeros(width, height))
    }
}

/// Per-position weights along one axis of a tile.
///
/// The `k`-th pixel inward from a feathered edge gets `k / feather`; ramps
/// from both ends multiply where they meet on very small tiles.
fn edge_ramp(len: u32, feather: u32, ramp_start: bool, ramp_end: bool) -> Vec<f32> {
    let mut weights = vec![1.0f32; len as usize];
    let feather = feather.min(len);
    if feather == 0 {
        return weights;
    }
    let f = feather as f32;
    for k in 0..feather as usize {
        let ramp = k as f32 / f;
        if ramp_start {
            weights[k] *= ramp;
        }
        if ramp_end {
            weights[len as usize - 1 - k] *= ramp;
        }
    }
    weights
}

/// Run `transform` over `image` tile by tile and blend the results.
///
/// Images that fit in one tile go through the transform directly with no
/// canvas at all.
pub fn upscale_tiled<T: TileTransform + ?Sized>(
    transform: &T,
    image: &ImageTensor,
    tile_size: u32,
    overlap: u32,
) -> Result<ImageTensor, BlendError> {
    let scale = transform.scale();
    let grid = TileGrid::new(image.height(), image.width(), tile_size, overlap, scale)?;

    if grid.is_single() {
        let out = transform.forward(image)?;
        let expected = (image.width() * scale, image.height() * scale);
        if out.dimensions() != expected {
            return Err(InferenceError::ShapeMismatch {
                expected_w: expected.0,
                expected_h: expected.1,
                got_w: out.width(),
                got_h: out.height(),
            }
            .into());
        }
        return Ok(out);
    }

    debug!(
        rows = grid.rows,
        cols = grid.cols,
        tile_size,
        overlap,
        scale,
        "tiled inference"
    );

    let mut canvas = Canvas::new(image.width() * scale, image.height() * scale);
    for tile in grid.iter() {
        let input = image.crop(tile.source);
        let output = transform.forward(&input)?;
        canvas.accumulate(&grid, tile, &output)?;
    }
    Ok(canvas.finalize())
}
