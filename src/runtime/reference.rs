//! Pure Rust reference runtime: no accelerator, no external libraries.
//!
//! ## Component mapping
//!
//! | Resource | Reference implementation |
//! |---|---|
//! | Upscale network | [`LanczosNetwork`]: `image::imageops::resize` with `Lanczos3`, scale read from the model file name |
//! | Diffusion backbone | [`PassthroughRefiner`]: returns the tile clamped to `[0, 1]` |
//! | Prompt encoder | [`HashingEncoder`]: deterministic bag-of-words embedding |
//!
//! Model files are still required to exist and be non-empty, so a worker
//! configured with this runtime fails the same way a GPU worker would when
//! weights are missing.

use super::{
    BackboneFiles, Conditioning, Denoiser, EncoderFiles, ModelRuntime, PromptEncoder,
    SamplerParams,
};
use crate::cache::{LoadError, ModelIdentity, Reclaim};
use crate::imaging::params::{Device, Precision};
use crate::imaging::{ImageTensor, InferenceError, TileTransform};
use image::imageops::FilterType;
use std::path::Path;
use tracing::{debug, warn};

/// Magnification assumed when the file name doesn't encode one.
const FALLBACK_SCALE: u32 = 4;

/// Width of the prompt embedding.
const EMBEDDING_DIM: usize = 64;

/// Pure Rust runtime. See the [module docs](self) for the mapping.
pub struct ReferenceRuntime {
    device: Device,
}

impl ReferenceRuntime {
    pub fn new(device: Device) -> Self {
        Self { device }
    }
}

impl Default for ReferenceRuntime {
    fn default() -> Self {
        Self::new(Device::Cpu)
    }
}

/// Fail unless `path` is a readable, non-empty file.
fn check_weights(path: &Path) -> Result<(), LoadError> {
    let meta = std::fs::metadata(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => LoadError::NotFound(path.to_path_buf()),
        _ => LoadError::Io(e),
    })?;
    if !meta.is_file() || meta.len() == 0 {
        return Err(LoadError::Malformed {
            path: path.to_path_buf(),
            reason: "weights file is empty".into(),
        });
    }
    Ok(())
}

/// Read the magnification out of names like `4x-UltraSharp.pth` or
/// `RealESRGAN_x2plus.pth`.
pub fn parse_scale(name: &str) -> Option<u32> {
    let stem = Path::new(name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(name)
        .to_ascii_lowercase();

    let leading: String = stem.chars().take_while(|c| c.is_ascii_digit()).collect();
    if !leading.is_empty() && stem[leading.len()..].starts_with('x') {
        return leading.parse().ok().filter(|&s| s > 0);
    }

    stem.match_indices('x').find_map(|(i, _)| {
        let digits: String = stem[i + 1..]
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        digits.parse().ok().filter(|&s: &u32| s > 0)
    })
}

impl Reclaim for ReferenceRuntime {
    fn reclaim_memory(&self) {
        // Host memory is returned on drop; there's no device pool to flush.
        debug!(device = %self.device, "memory reclaimed");
    }
}

impl ModelRuntime for ReferenceRuntime {
    fn device(&self) -> Device {
        self.device
    }

    fn load_upscaler(
        &self,
        path: &Path,
        identity: &ModelIdentity,
    ) -> Result<Box<dyn TileTransform>, LoadError> {
        check_weights(path)?;
        let scale = parse_scale(&identity.name).unwrap_or_else(|| {
            warn!(model = %identity.name, "no scale in model name, assuming {FALLBACK_SCALE}x");
            FALLBACK_SCALE
        });
        Ok(Box::new(LanczosNetwork {
            scale,
            precision: identity.precision,
        }))
    }

    fn load_backbone(
        &self,
        files: &BackboneFiles,
        _identity: &ModelIdentity,
    ) -> Result<Box<dyn Denoiser>, LoadError> {
        check_weights(&files.unet)?;
        check_weights(&files.vae)?;
        Ok(Box::new(PassthroughRefiner))
    }

    fn load_prompt_encoder(
        &self,
        files: &EncoderFiles,
        _identity: &ModelIdentity,
    ) -> Result<Box<dyn PromptEncoder>, LoadError> {
        check_weights(&files.clip_l)?;
        check_weights(&files.t5xxl)?;
        Ok(Box::new(HashingEncoder))
    }
}

/// Lanczos3 resampler with a fixed integer scale.
pub struct LanczosNetwork {
    pub scale: u32,
    pub precision: Precision,
}

/// Drop mantissa bits below half precision (10-bit mantissa).
fn to_half_mantissa(v: f32) -> f32 {
    f32::from_bits(v.to_bits() & 0xFFFF_E000)
}

impl TileTransform for LanczosNetwork {
    fn scale(&self) -> u32 {
        self.scale
    }

    fn forward(&self, tile: &ImageTensor) -> Result<ImageTensor, InferenceError> {
        let (w, h) = tile.dimensions();
        let resized = image::imageops::resize(
            &tile.to_rgb32f(),
            w * self.scale,
            h * self.scale,
            FilterType::Lanczos3,
        );
        let mut out = ImageTensor::from_rgb32f(resized);
        if self.precision == Precision::Half {
            let (ow, oh) = out.dimensions();
            let data = out.into_raw().into_iter().map(to_half_mantissa).collect();
            out = ImageTensor::from_raw(ow, oh, data)
                .ok_or_else(|| InferenceError::Failed("half-precision repack".into()))?;
        }
        Ok(out)
    }
}

/// Returns each tile unchanged apart from clamping to the valid range.
pub struct PassthroughRefiner;

impl Denoiser for PassthroughRefiner {
    fn refine(
        &self,
        tile: &ImageTensor,
        _positive: &Conditioning,
        _negative: &Conditioning,
        _params: &SamplerParams,
    ) -> Result<ImageTensor, InferenceError> {
        let data = tile.as_slice().iter().map(|v| v.clamp(0.0, 1.0)).collect();
        ImageTensor::from_raw(tile.width(), tile.height(), data)
            .ok_or_else(|| InferenceError::Failed("refiner repack".into()))
    }
}

/// Deterministic embedding: each lowercase word is FNV-1a hashed into one of
/// [`EMBEDDING_DIM`] buckets.
pub struct HashingEncoder;

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325, |h, &b| {
        (h ^ b as u64).wrapping_mul(0x0100_0000_01b3)
    })
}

impl PromptEncoder for HashingEncoder {
    fn encode(&self, prompt: &str, guidance: f32) -> Conditioning {
        let mut embedding = vec![0.0f32; EMBEDDING_DIM];
        for word in prompt.split_whitespace() {
            let h = fnv1a(word.to_lowercase().as_bytes());
            embedding[(h % EMBEDDING_DIM as u64) as usize] += 1.0;
        }
        Conditioning {
            prompt: prompt.to_string(),
            guidance,
            embedding,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // =========================================================================
    // parse_scale
    // =========================================================================

    #[test]
    fn scale_from_leading_prefix() {
        assert_eq!(parse_scale("4x-UltraSharp.pth"), Some(4));
        assert_eq!(parse_scale("2X_Foo.safetensors"), Some(2));
    }

    #[test]
    fn scale_from_embedded_x() {
        assert_eq!(parse_scale("RealESRGAN_x2plus.pth"), Some(2));
        assert_eq!(parse_scale("realesr-general-x4v3.pth"), Some(4));
    }

    #[test]
    fn no_scale_in_name() {
        assert_eq!(parse_scale("model.pth"), None);
        assert_eq!(parse_scale("0x-broken.pth"), None);
    }

    // =========================================================================
    // Loading
    // =========================================================================

    #[test]
    fn load_upscaler_checks_weights() {
        let tmp = TempDir::new().unwrap();
        let rt = ReferenceRuntime::default();
        let id = ModelIdentity::new("2x-Test.pth", Precision::Full, Device::Cpu);

        let missing = tmp.path().join("2x-Test.pth");
        assert!(matches!(
            rt.load_upscaler(&missing, &id),
            Err(LoadError::NotFound(_))
        ));

        std::fs::write(&missing, b"").unwrap();
        assert!(matches!(
            rt.load_upscaler(&missing, &id),
            Err(LoadError::Malformed { .. })
        ));

        std::fs::write(&missing, b"weights").unwrap();
        let net = rt.load_upscaler(&missing, &id).unwrap();
        assert_eq!(net.scale(), 2);
    }

    #[test]
    fn unknown_scale_falls_back() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("mystery.pth");
        std::fs::write(&path, b"weights").unwrap();
        let rt = ReferenceRuntime::default();
        let id = ModelIdentity::new("mystery.pth", Precision::Full, Device::Cpu);
        assert_eq!(rt.load_upscaler(&path, &id).unwrap().scale(), FALLBACK_SCALE);
    }

    // =========================================================================
    // Components
    // =========================================================================

    #[test]
    fn lanczos_network_scales_tile() {
        let net = LanczosNetwork {
            scale: 3,
            precision: Precision::Full,
        };
        let out = net.forward(&ImageTensor::filled(5, 4, 0.5)).unwrap();
        assert_eq!(out.dimensions(), (15, 12));
        for &v in out.as_slice() {
            assert!((v - 0.5).abs() < 1e-4);
        }
    }

    #[test]
    fn half_precision_truncates_mantissa() {
        let v = 0.1f32;
        let h = to_half_mantissa(v);
        assert!(h <= v);
        assert!((v - h).abs() < 1e-3);
        assert_eq!(to_half_mantissa(0.5), 0.5);
    }

    #[test]
    fn passthrough_refiner_clamps() {
        let cond = HashingEncoder.encode("", 3.5);
        let params = SamplerParams {
            steps: 1,
            cfg: 1.0,
            sampler_name: "euler".into(),
            scheduler: "normal".into(),
            denoise: 0.2,
            seed: 0,
            mask_blur: 0,
        };
        let out = PassthroughRefiner
            .refine(&ImageTensor::filled(2, 2, 1.4), &cond, &cond, &params)
            .unwrap();
        assert_eq!(out.pixel(0, 0), [1.0, 1.0, 1.0]);
    }

    #[test]
    fn encoder_is_deterministic_and_case_insensitive() {
        let a = HashingEncoder.encode("Sharp Details", 3.5);
        let b = HashingEncoder.encode("sharp details", 3.5);
        assert_eq!(a.embedding, b.embedding);
        assert_eq!(a.embedding.iter().sum::<f32>(), 2.0);
        assert_ne!(a.embedding, HashingEncoder.encode("", 3.5).embedding);
    }
}
