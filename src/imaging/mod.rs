//! Image processing: pure Rust, no native libraries.
//!
//! | Operation | Crate / function |
//! |---|---|
//! | **Identify** | `image::image_dimensions` |
//! | **Decode / encode** | `image` (PNG, JPEG, WebP in; PNG, TIFF out) |
//! | **Resample to exact size** | Lanczos3 |
//! | **Tiled inference** | [`TileGrid`] + [`Canvas`] feathered blend |
//!
//! The module is split into:
//! - **Calculations**: Pure functions for dimension math (unit testable)
//! - **Tiling**: Pure tile-grid geometry
//! - **Parameters**: Data structures describing image operations
//! - **Backend**: [`TileTransform`], the opaque per-tile model call
//! - **Blend**: Canvas accumulation and [`upscale_tiled`]
//! - **Operations**: File-level helpers combining the above

pub mod backend;
pub mod blend;
mod calculations;
pub mod operations;
pub mod params;
pub mod tensor;
pub mod tiling;

pub use backend::{InferenceError, TileTransform};
pub use blend::{BlendError, Canvas, upscale_tiled};
pub use calculations::{
    CropDirection, CropInfo, DEFAULT_UPSCALE_FACTOR, DimensionPlan, OutputDimensions, PlanError,
    PrintTarget, calculate_output_dimensions, calculate_scale_for_crop,
};
pub use operations::{ImageIoError, get_dimensions};
pub use params::{Device, OutputFormat, Precision};
pub use tensor::ImageTensor;
pub use tiling::{Rect, Tile, TileGrid, TilingError};
