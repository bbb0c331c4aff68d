//! [`Loader`] adapters binding a [`ModelRuntime`] to on-disk model files.
//!
//! Model files live under the model root, namespaced by class:
//!
//! ```text
//! <model_cache_dir>/
//! ├── upscale_models/4x-UltraSharp.pth
//! ├── unet/flux1-dev-Q8_0.gguf
//! ├── vae/ae.sft
//! └── clip/{clip_l.safetensors, t5xxl_fp8_e4m3fn.safetensors}
//! ```

use super::{BackboneFiles, Denoiser, EncoderFiles, ModelRuntime, PromptEncoder};
use crate::cache::{LoadError, Loader, ModelIdentity, ResourceClass};
use crate::imaging::TileTransform;
use std::path::{Path, PathBuf};

/// Subdirectory holding latent decoder weights.
pub const VAE_SUBDIR: &str = "vae";

fn require_file(path: &Path) -> Result<(), LoadError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(LoadError::NotFound(path.to_path_buf()))
    }
}

/// Path of an upscale network file under the model root.
pub fn upscaler_path(model_root: &Path, name: &str) -> PathBuf {
    model_root.join(ResourceClass::Upscaler.subdir()).join(name)
}

/// Loads upscale networks from `<root>/upscale_models/<identity.name>`.
pub struct UpscalerLoader<'a> {
    pub runtime: &'a dyn ModelRuntime,
    pub model_root: &'a Path,
}

impl Loader<Box<dyn TileTransform>> for UpscalerLoader<'_> {
    fn locate(&self, identity: &ModelIdentity) -> Result<(), LoadError> {
        require_file(&upscaler_path(self.model_root, &identity.name))
    }

    fn load(&self, identity: &ModelIdentity) -> Result<Box<dyn TileTransform>, LoadError> {
        let path = upscaler_path(self.model_root, &identity.name);
        self.runtime.load_upscaler(&path, identity)
    }
}

/// Loads the diffusion backbone (UNet + VAE).
pub struct BackboneLoader<'a> {
    pub runtime: &'a dyn ModelRuntime,
    pub files: BackboneFiles,
}

impl<'a> BackboneLoader<'a> {
    pub fn new(runtime: &'a dyn ModelRuntime, model_root: &Path, unet: &str, vae: &str) -> Self {
        Self {
            runtime,
            files: BackboneFiles {
                unet: model_root.join(ResourceClass::Backbone.subdir()).join(unet),
                vae: model_root.join(VAE_SUBDIR).join(vae),
            },
        }
    }
}

impl Loader<Box<dyn Denoiser>> for BackboneLoader<'_> {
    fn locate(&self, _identity: &ModelIdentity) -> Result<(), LoadError> {
        require_file(&self.files.unet)?;
        require_file(&self.files.vae)
    }

    fn load(&self, identity: &ModelIdentity) -> Result<Box<dyn Denoiser>, LoadError> {
        self.runtime.load_backbone(&self.files, identity)
    }
}

/// Loads the dual text encoder from `<root>/clip/`.
pub struct EncoderLoader<'a> {
    pub runtime: &'a dyn ModelRuntime,
    pub files: EncoderFiles,
}

impl<'a> EncoderLoader<'a> {
    pub fn new(
        runtime: &'a dyn ModelRuntime,
        model_root: &Path,
        clip_l: &str,
        t5xxl: &str,
    ) -> Self {
        let dir = model_root.join(ResourceClass::PromptEncoder.subdir());
        Self {
            runtime,
            files: EncoderFiles {
                clip_l: dir.join(clip_l),
                t5xxl: dir.join(t5xxl),
            },
        }
    }
}

impl Loader<Box<dyn PromptEncoder>> for EncoderLoader<'_> {
    fn locate(&self, _identity: &ModelIdentity) -> Result<(), LoadError> {
        require_file(&self.files.clip_l)?;
        require_file(&self.files.t5xxl)
    }

    fn load(&self, identity: &ModelIdentity) -> Result<Box<dyn PromptEncoder>, LoadError> {
        self.runtime.load_prompt_encoder(&self.files, identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::params::{Device, Precision};
    use crate::runtime::tests::MockRuntime;
    use tempfile::TempDir;

    fn id(name: &str) -> ModelIdentity {
        ModelIdentity::new(name, Precision::Full, Device::Cpu)
    }

    #[test]
    fn upscaler_locate_requires_file() {
        let tmp = TempDir::new().unwrap();
        let rt = MockRuntime::default();
        let loader = UpscalerLoader {
            runtime: &rt,
            model_root: tmp.path(),
        };
        let err = loader.locate(&id("4x.pth")).unwrap_err();
        match err {
            LoadError::NotFound(p) => assert!(p.ends_with("upscale_models/4x.pth")),
            other => panic!("unexpected {other:?}"),
        }

        std::fs::create_dir_all(tmp.path().join("upscale_models")).unwrap();
        std::fs::write(tmp.path().join("upscale_models/4x.pth"), b"w").unwrap();
        loader.locate(&id("4x.pth")).unwrap();
        loader.load(&id("4x.pth")).unwrap();
        assert_eq!(rt.calls(), vec!["load_upscaler 4x.pth"]);
    }

    #[test]
    fn backbone_locate_checks_unet_and_vae() {
        let tmp = TempDir::new().unwrap();
        let rt = MockRuntime::default();
        let loader = BackboneLoader::new(&rt, tmp.path(), "flux.gguf", "ae.sft");

        std::fs::create_dir_all(tmp.path().join("unet")).unwrap();
        std::fs::write(tmp.path().join("unet/flux.gguf"), b"w").unwrap();
        let err = loader.locate(&id("flux.gguf")).unwrap_err();
        assert!(matches!(err, LoadError::NotFound(p) if p.ends_with("vae/ae.sft")));

        std::fs::create_dir_all(tmp.path().join("vae")).unwrap();
        std::fs::write(tmp.path().join("vae/ae.sft"), b"w").unwrap();
        loader.locate(&id("flux.gguf")).unwrap();
    }

    #[test]
    fn encoder_paths_live_under_clip() {
        let rt = MockRuntime::default();
        let loader = EncoderLoader::new(&rt, Path::new("/models"), "l.st", "t5.st");
        assert_eq!(loader.files.clip_l, PathBuf::from("/models/clip/l.st"));
        assert_eq!(loader.files.t5xxl, PathBuf::from("/models/clip/t5.st"));
    }
}
