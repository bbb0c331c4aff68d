//! Shared test utilities: fixture images and fake model trees.
//!
//! # Usage
//!
//! ```rust
//! use crate::test_helpers::*;
//!
//! let tmp = TempDir::new().unwrap();
//! let input = write_test_image(tmp.path(), "photo.png", 32, 24);
//! write_flux_models(&tmp.path().join("models"));
//! ```

use image::{Rgb, RgbImage};
use std::path::{Path, PathBuf};

// =========================================================================
// Fixture setup
// =========================================================================

/// Write a `width × height` gradient PNG (or whatever `name`'s extension
/// says) and return its path.
pub fn write_test_image(dir: &Path, name: &str, width: u32, height: u32) -> PathBuf {
    std::fs::create_dir_all(dir).unwrap();
    let img = RgbImage::from_fn(width, height, |x, y| {
        Rgb([
            (x * 255 / width.max(1)) as u8,
            (y * 255 / height.max(1)) as u8,
            128,
        ])
    });
    let path = dir.join(name);
    img.save(&path).unwrap();
    path
}

/// Write a non-empty placeholder model file at `<root>/<subdir>/<name>`.
pub fn write_model_file(root: &Path, subdir: &str, name: &str) -> PathBuf {
    let dir = root.join(subdir);
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, b"placeholder weights").unwrap();
    path
}

/// Populate every file the diffusion pipeline needs with default names.
pub fn write_flux_models(root: &Path) {
    write_model_file(root, "upscale_models", "4x-UltraSharp.pth");
    write_model_file(root, "unet", "flux1-dev-Q8_0.gguf");
    write_model_file(root, "vae", "ae.sft");
    write_model_file(root, "clip", "clip_l.safetensors");
    write_model_file(root, "clip", "t5xxl_fp8_e4m3fn.safetensors");
}
