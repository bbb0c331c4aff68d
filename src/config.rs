//! Worker configuration.
//!
//! Three layers, later ones winning: stock defaults, an optional
//! `upscale-worker.toml`, then environment variables.
//!
//! ## Configuration Options
//!
//! ```toml
//! # All options are optional - defaults shown below
//!
//! model_cache_dir = "/app/models"   # env MODEL_CACHE_DIR
//! output_dir = "/app/results"       # env OUTPUT_DIR
//!
//! [gcp]
//! project_id = "artinafti"          # env GCP_PROJECT_ID
//! region = "us-central1"            # env GCP_REGION
//!
//! [defaults]
//! dpi = 150                         # env DEFAULT_DPI
//! upscale_factor = 4                # env DEFAULT_UPSCALE_FACTOR
//! prewarm_model = "4x-UltraSharp.pth"
//! max_output_pixels = 400000000     # largest image a job may produce
//!
//! [processing]
//! max_threads = 4                   # omit for auto = CPU cores
//!
//! [device]
//! accelerator = false               # allow half precision
//! ```
//!
//! Unknown keys are rejected to catch typos early. Environment values that
//! fail to parse are ignored and the file/default value stands.

use crate::imaging::params::Device;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::warn;

/// File name looked up in the working directory when `--config` is absent.
pub const CONFIG_FILE_NAME: &str = "upscale-worker.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Worker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    /// Root of the model tree (`upscale_models/`, `unet/`, `vae/`, `clip/`).
    pub model_cache_dir: PathBuf,
    /// Where results land when a job names no `output_dir`.
    pub output_dir: PathBuf,
    pub gcp: GcpConfig,
    pub defaults: DefaultsConfig,
    pub processing: ProcessingConfig,
    pub device: DeviceConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            model_cache_dir: PathBuf::from("/app/models"),
            output_dir: PathBuf::from("/app/results"),
            gcp: GcpConfig::default(),
            defaults: DefaultsConfig::default(),
            processing: ProcessingConfig::default(),
            device: DeviceConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Validate config values are within acceptable ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.defaults.dpi == 0 {
            return Err(ConfigError::Validation(
                "defaults.dpi must be positive".into(),
            ));
        }
        if self.defaults.upscale_factor == 0 {
            return Err(ConfigError::Validation(
                "defaults.upscale_factor must be positive".into(),
            ));
        }
        if self.defaults.prewarm_model.trim().is_empty() {
            return Err(ConfigError::Validation(
                "defaults.prewarm_model must not be empty".into(),
            ));
        }
        if self.defaults.max_output_pixels == 0 {
            return Err(ConfigError::Validation(
                "defaults.max_output_pixels must be positive".into(),
            ));
        }
        if self.processing.max_threads == Some(0) {
            return Err(ConfigError::Validation(
                "processing.max_threads must be positive when set".into(),
            ));
        }
        Ok(())
    }

    /// Apply environment overrides read through `lookup`.
    ///
    /// Taking a lookup function instead of reading `std::env` directly keeps
    /// tests free of process-global state.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("MODEL_CACHE_DIR").filter(|v| !v.is_empty()) {
            self.model_cache_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("OUTPUT_DIR").filter(|v| !v.is_empty()) {
            self.output_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("GCP_PROJECT_ID").filter(|v| !v.is_empty()) {
            self.gcp.project_id = v;
        }
        if let Some(v) = lookup("GCP_REGION").filter(|v| !v.is_empty()) {
            self.gcp.region = v;
        }
        if let Some(v) = parse_env(&lookup, "DEFAULT_DPI") {
            self.defaults.dpi = v;
        }
        if let Some(v) = parse_env(&lookup, "DEFAULT_UPSCALE_FACTOR") {
            self.defaults.upscale_factor = v;
        }
    }

    /// Device models are placed on.
    pub fn device(&self) -> Device {
        if self.device.accelerator {
            Device::Accelerator
        } else {
            Device::Cpu
        }
    }
}

fn parse_env<F, T>(lookup: &F, key: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}

/// Vertex AI project settings for the remote provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GcpConfig {
    pub project_id: String,
    pub region: String,
}

impl Default for GcpConfig {
    fn default() -> Self {
        Self {
            project_id: "artinafti".to_string(),
            region: "us-central1".to_string(),
        }
    }
}

/// 400 MP: a 20" x 30" print at 600 dpi with headroom for the crop overshoot.
pub const DEFAULT_MAX_OUTPUT_PIXELS: u64 = 400_000_000;

/// Values jobs fall back to when their config omits them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DefaultsConfig {
    /// Print density in pixels per inch.
    pub dpi: u32,
    pub upscale_factor: u32,
    /// Upscale network loaded before the first job.
    pub prewarm_model: String,
    /// Upper bound on width × height of any image a job materializes:
    /// the planned output and every intermediate upscale.
    pub max_output_pixels: u64,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            dpi: 150,
            upscale_factor: 4,
            prewarm_model: "4x-UltraSharp.pth".to_string(),
            max_output_pixels: DEFAULT_MAX_OUTPUT_PIXELS,
        }
    }
}

/// Parallel processing settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessingConfig {
    /// Threads for data-parallel work inside a job.
    /// When absent, defaults to the number of CPU cores.
    /// Values larger than the core count are clamped down.
    pub max_threads: Option<usize>,
}

/// Resolve the effective thread count from config.
///
/// - `None` → use all available cores
/// - `Some(n)` → use `min(n, cores)` (user can constrain down, not up)
pub fn effective_threads(config: &ProcessingConfig) -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    config.max_threads.map(|n| n.min(cores)).unwrap_or(cores)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceConfig {
    /// Place models on an accelerator (enables half precision).
    pub accelerator: bool,
}

// =============================================================================
// Config loading, merging, and validation
// =============================================================================

/// Returns the stock default config as a `toml::Value::Table`.
pub fn stock_defaults_value() -> Result<toml::Value, ConfigError> {
    Ok(toml::Value::try_from(WorkerConfig::default())?)
}

/// Recursively merge `overlay` on top of `base`.
///
/// - Tables are merged key-by-key (overlay keys override base keys).
/// - Non-table values in overlay replace base values entirely.
/// - Keys in base that are not in overlay are preserved.
pub fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                let merged = match base_table.remove(&key) {
                    Some(base_val) => merge_toml(base_val, overlay_val),
                    None => overlay_val,
                };
                base_table.insert(key, merged);
            }
            toml::Value::Table(base_table)
        }
        (_, overlay) => overlay,
    }
}

/// Load a config file as a raw TOML value.
///
/// Returns `Ok(None)` if the file does not exist.
pub fn load_raw_config(path: &Path) -> Result<Option<toml::Value>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)?;
    let value: toml::Value = toml::from_str(&content)?;
    Ok(Some(value))
}

/// Merge an optional overlay onto the stock defaults and deserialize.
pub fn resolve_config(overlay: Option<toml::Value>) -> Result<WorkerConfig, ConfigError> {
    let base = stock_defaults_value()?;
    let merged = match overlay {
        Some(ov) => merge_toml(base, ov),
        None => base,
    };
    Ok(merged.try_into()?)
}

/// Load the worker config: stock defaults, then `path` (if it exists), then
/// the process environment. The result is validated.
pub fn load_config(path: &Path) -> Result<WorkerConfig, ConfigError> {
    let mut config = resolve_config(load_raw_config(path)?)?;
    config.apply_env(|key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

/// Returns a fully-commented stock config file with all keys and explanations.
pub fn stock_config_toml() -> &'static str {
    r##"# Upscale Worker Configuration
# ===========================
# All settings are optional. Remove or comment out any you don't need.
# Values shown below are the defaults.
#
# Environment variables override this file:
#   MODEL_CACHE_DIR, OUTPUT_DIR, GCP_PROJECT_ID, GCP_REGION,
#   DEFAULT_DPI, DEFAULT_UPSCALE_FACTOR
#
# Unknown keys will cause an error.

# Root of the model tree. Expected layout:
#   upscale_models/<name>.pth
#   unet/flux1-dev-Q8_0.gguf
#   vae/ae.sft
#   clip/clip_l.safetensors, clip/t5xxl_fp8_e4m3fn.safetensors
model_cache_dir = "/app/models"

# Default output directory when a job doesn't name one.
output_dir = "/app/results"

# ---------------------------------------------------------------------------
# Remote upscaling (Vertex AI)
# ---------------------------------------------------------------------------
[gcp]
project_id = "artinafti"
region = "us-central1"

# ---------------------------------------------------------------------------
# Job defaults
# ---------------------------------------------------------------------------
[defaults]
# Print density (pixels per inch) for print-size targets.
dpi = 150

# Magnification when no print size is given.
upscale_factor = 4

# Upscale network loaded at startup so the first job starts warm.
prewarm_model = "4x-UltraSharp.pth"

# Largest image (width x height) a job may produce, including intermediate
# upscales. Jobs that would exceed it fail with InvalidConfig.
max_output_pixels = 400000000

# ---------------------------------------------------------------------------
# Processing
# ---------------------------------------------------------------------------
[processing]
# Threads for canvas finalization and pixel conversion.
# Omit or comment out to auto-detect (= number of CPU cores).
# max_threads = 4

# ---------------------------------------------------------------------------
# Device
# ---------------------------------------------------------------------------
[device]
# Place models on an accelerator. Enables half precision where requested.
accelerator = false
"##
}
