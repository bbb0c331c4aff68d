//! Single-slot model cache.
//!
//! Accelerator memory is the scarce resource in this worker: an upscale
//! network is a few hundred megabytes, a diffusion backbone is over ten
//! gigabytes. This module is the only place allowed to hold a long-lived
//! reference to a loaded model, and it holds at most one per resource class.
//!
//! # Design
//!
//! Each [`ResourceClass`] gets a [`ModelSlot`], a small state machine:
//!
//! ```text
//!             acquire(id)                  load ok
//! Unloaded ───────────────▶ Loading(id) ──────────────▶ Loaded(id)
//!     ▲                         │ load failed                 │
//!     └─────────────────────────┘                             │
//!     ▲              acquire(other id): release, reclaim      │
//!     └───────────────────────────────────────────────────────┘
//! ```
//!
//! ## Identity
//!
//! A [`ModelIdentity`] is `name + precision + device`. Asking for the same
//! identity again returns the resident object with no reload; any
//! difference, including a precision change, is a swap.
//!
//! ## Swapping
//!
//! A swap runs the loader's cheap [`Loader::locate`] check *before* touching
//! the resident model, so a typo'd model name never evicts a working one.
//! Only then is the old model dropped and memory reclaimed through
//! [`Reclaim::reclaim_memory`], and the new one loaded. Peak memory is
//! therefore bounded by one model per class plus the one being loaded.
//!
//! ## Failure
//!
//! If the load itself fails after eviction the slot ends `Unloaded`, never
//! holding a partially-initialized model, and the error propagates.
//!
//! ## Deferred initialization
//!
//! Slots start empty. Nothing is loaded until a request names the class, so
//! the heavy diffusion classes cost nothing until the first diffusion job.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::imaging::TileTransform;
use crate::imaging::params::{Device, Precision};
use crate::runtime::{Denoiser, PromptEncoder};

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Model not found: {0}")]
    NotFound(PathBuf),
    #[error("Malformed model {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },
    #[error("IO error loading model: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0} slot is empty after loading")]
    Vacant(ResourceClass),
}

/// Kind of heavy resource. Each class has exactly one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceClass {
    /// Tiled upscale network (ESRGAN-style).
    Upscaler,
    /// Diffusion backbone with its latent decoder.
    Backbone,
    /// Text encoders producing diffusion conditioning.
    PromptEncoder,
}

impl ResourceClass {
    /// Subdirectory of the model root holding this class's primary files.
    pub fn subdir(self) -> &'static str {
        match self {
            ResourceClass::Upscaler => "upscale_models",
            ResourceClass::Backbone => "unet",
            ResourceClass::PromptEncoder => "clip",
        }
    }
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResourceClass::Upscaler => "upscaler",
            ResourceClass::Backbone => "backbone",
            ResourceClass::PromptEncoder => "prompt-encoder",
        })
    }
}

/// What makes two loaded models interchangeable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelIdentity {
    pub name: String,
    pub precision: Precision,
    pub device: Device,
}

impl ModelIdentity {
    pub fn new(name: impl Into<String>, precision: Precision, device: Device) -> Self {
        Self {
            name: name.into(),
            precision,
            device,
        }
    }
}

impl fmt::Display for ModelIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {})", self.name, self.precision, self.device)
    }
}

/// Produces a model for an identity.
pub trait Loader<T> {
    /// Cheap validation (file presence, etc.) run before anything resident
    /// is released.
    fn locate(&self, _identity: &ModelIdentity) -> Result<(), LoadError> {
        Ok(())
    }

    /// Materialize the model.
    fn load(&self, identity: &ModelIdentity) -> Result<T, LoadError>;
}

/// Forced memory reclamation after a model is dropped.
pub trait Reclaim {
    fn reclaim_memory(&self);
}

/// A loaded model together with the identity it was loaded as.
pub struct Resident<T> {
    pub identity: ModelIdentity,
    pub object: T,
}

enum SlotState<T> {
    Unloaded,
    Loading(ModelIdentity),
    Loaded(Resident<T>),
}

/// Counters for one slot (or summed over the cache).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u32,
    pub loads: u32,
    pub releases: u32,
    pub failures: u32,
}

impl CacheStats {
    pub fn hit(&mut self) {
        self.hits += 1;
    }

    pub fn load(&mut self) {
        self.loads += 1;
    }

    pub fn release(&mut self) {
        self.releases += 1;
    }

    pub fn failure(&mut self) {
        self.failures += 1;
    }

    fn merged(self, other: CacheStats) -> CacheStats {
        CacheStats {
            hits: self.hits + other.hits,
            loads: self.loads + other.loads,
            releases: self.releases + other.releases,
            failures: self.failures + other.failures,
        }
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let plural = |n: u32, word: &str| {
            if n == 1 {
                format!("{n} {word}")
            } else {
                format!("{n} {word}s")
            }
        };
        write!(
            f,
            "{}, {}, {} reused",
            plural(self.loads, "load"),
            plural(self.releases, "release"),
            self.hits
        )?;
        if self.failures > 0 {
            write!(f, ", {} failed", self.failures)?;
        }
        Ok(())
    }
}

/// Holds zero or one resident model of a single class.
pub struct ModelSlot<T> {
    class: ResourceClass,
    state: SlotState<T>,
    stats: CacheStats,
}

impl<T> ModelSlot<T> {
    pub fn new(class: ResourceClass) -> Self {
        Self {
            class,
            state: SlotState::Unloaded,
            stats: CacheStats::default(),
        }
    }

    pub fn class(&self) -> ResourceClass {
        self.class
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self.state, SlotState::Loaded(_))
    }

    /// Identity of the resident model, if any.
    pub fn resident_identity(&self) -> Option<&ModelIdentity> {
        match &self.state {
            SlotState::Loaded(r) => Some(&r.identity),
            _ => None,
        }
    }

    /// The resident model, if any, without loading anything.
    pub fn get(&self) -> Option<&T> {
        match &self.state {
            SlotState::Loaded(r) => Some(&r.object),
            _ => None,
        }
    }

    /// Return the model for `identity`, loading it if it isn't resident.
    ///
    /// A different resident model is released (and memory reclaimed) before
    /// the new one is loaded, never after.
    pub fn acquire<R: Reclaim + ?Sized>(
        &mut self,
        identity: &ModelIdentity,
        loader: &dyn Loader<T>,
        reclaim: &R,
    ) -> Result<&T, LoadError> {
        if self.resident_identity() == Some(identity) {
            self.stats.hit();
            debug!(class = %self.class, %identity, "model already resident");
        } else {
            if let Err(e) = loader.locate(identity) {
                self.stats.failure();
                return Err(e);
            }
            self.release(reclaim);

            info!(class = %self.class, %identity, "loading model");
            self.state = SlotState::Loading(identity.clone());
            match loader.load(identity) {
                Ok(object) => {
                    self.stats.load();
                    self.state = SlotState::Loaded(Resident {
                        identity: identity.clone(),
                        object,
                    });
                }
                Err(e) => {
                    self.stats.failure();
                    warn!(class = %self.class, %identity, error = %e, "model load failed");
                    self.state = SlotState::Unloaded;
                    reclaim.reclaim_memory();
                    return Err(e);
                }
            }
        }
        self.get().ok_or(LoadError::Vacant(self.class))
    }

    /// Drop the resident model (if any) and reclaim memory.
    pub fn release<R: Reclaim + ?Sized>(&mut self, reclaim: &R) {
        match std::mem::replace(&mut self.state, SlotState::Unloaded) {
            SlotState::Loaded(resident) => {
                info!(class = %self.class, identity = %resident.identity, "releasing model");
                drop(resident);
                self.stats.release();
                reclaim.reclaim_memory();
            }
            SlotState::Loading(identity) => {
                debug!(class = %self.class, %identity, "abandoning in-flight load");
            }
            SlotState::Unloaded => {}
        }
    }
}

/// All model slots owned by the worker.
pub struct ModelCache {
    pub upscaler: ModelSlot<Box<dyn TileTransform>>,
    pub backbone: ModelSlot<Box<dyn Denoiser>>,
    pub prompt_encoder: ModelSlot<Box<dyn PromptEncoder>>,
}

impl ModelCache {
    pub fn new() -> Self {
        Self {
            upscaler: ModelSlot::new(ResourceClass::Upscaler),
            backbone: ModelSlot::new(ResourceClass::Backbone),
            prompt_encoder: ModelSlot::new(ResourceClass::PromptEncoder),
        }
    }

    /// Counters summed over every slot.
    pub fn stats(&self) -> CacheStats {
        self.upscaler
            .stats()
            .merged(self.backbone.stats())
            .merged(self.prompt_encoder.stats())
    }

    /// Release every resident model.
    pub fn release_all<R: Reclaim + ?Sized>(&mut self, reclaim: &R) {
        self.upscaler.release(reclaim);
        self.backbone.release(reclaim);
        self.prompt_encoder.release(reclaim);
    }
}

impl Default for ModelCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    /// Model stand-in that reports its own drop into a shared log.
    struct Tracked {
        name: String,
        log: Rc<RefCell<Vec<String>>>,
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.log.borrow_mut().push(format!("drop {}", self.name));
        }
    }

    struct TestLoader {
        log: Rc<RefCell<Vec<String>>>,
        missing: Vec<String>,
        broken: Vec<String>,
    }

    impl TestLoader {
        fn new(log: &Rc<RefCell<Vec<String>>>) -> Self {
            Self {
                log: Rc::clone(log),
                missing: Vec::new(),
                broken: Vec::new(),
            }
        }
    }

    impl Loader<Tracked> for TestLoader {
        fn locate(&self, identity: &ModelIdentity) -> Result<(), LoadError> {
            if self.missing.contains(&identity.name) {
                return Err(LoadError::NotFound(PathBuf::from(&identity.name)));
            }
            Ok(())
        }

        fn load(&self, identity: &ModelIdentity) -> Result<Tracked, LoadError> {
            if self.broken.contains(&identity.name) {
                self.log.borrow_mut().push(format!("fail {}", identity.name));
                return Err(LoadError::Malformed {
                    path: PathBuf::from(&identity.name),
                    reason: "truncated".into(),
                });
            }
            // A live instance existing during load would mean two residents.
            let live = self
                .log
                .borrow()
                .iter()
                .filter(|e| e.starts_with("load "))
                .count()
                - self
                    .log
                    .borrow()
                    .iter()
                    .filter(|e| e.starts_with("drop "))
                    .count();
            assert_eq!(live, 0, "loader invoked while another model is resident");
            self.log.borrow_mut().push(format!("load {}", identity.name));
            Ok(Tracked {
                name: identity.name.clone(),
                log: Rc::clone(&self.log),
            })
        }
    }

    #[derive(Default)]
    struct CountingReclaim(Cell<u32>);

    impl Reclaim for CountingReclaim {
        fn reclaim_memory(&self) {
            self.0.set(self.0.get() + 1);
        }
    }

    fn id(name: &str) -> ModelIdentity {
        ModelIdentity::new(name, Precision::Full, Device::Cpu)
    }

    // =========================================================================
    // acquire
    // =========================================================================

    #[test]
    fn same_identity_loads_once() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let loader = TestLoader::new(&log);
        let reclaim = CountingReclaim::default();
        let mut slot = ModelSlot::new(ResourceClass::Upscaler);

        slot.acquire(&id("a"), &loader, &reclaim).unwrap();
        let second = slot.acquire(&id("a"), &loader, &reclaim).unwrap();
        assert_eq!(second.name, "a");

        assert_eq!(*log.borrow(), vec!["load a"]);
        assert_eq!(slot.stats().loads, 1);
        assert_eq!(slot.stats().hits, 1);
        assert_eq!(reclaim.0.get(), 0);
    }

    #[test]
    fn different_identity_releases_then_loads() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let loader = TestLoader::new(&log);
        let reclaim = CountingReclaim::default();
        let mut slot = ModelSlot::new(ResourceClass::Upscaler);

        slot.acquire(&id("a"), &loader, &reclaim).unwrap();
        slot.acquire(&id("b"), &loader, &reclaim).unwrap();

        assert_eq!(*log.borrow(), vec!["load a", "drop a", "load b"]);
        assert_eq!(slot.stats().releases, 1);
        assert_eq!(reclaim.0.get(), 1);
        assert_eq!(slot.resident_identity(), Some(&id("b")));
    }

    #[test]
    fn precision_change_is_a_swap() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let loader = TestLoader::new(&log);
        let reclaim = CountingReclaim::default();
        let mut slot = ModelSlot::new(ResourceClass::Upscaler);

        let half = ModelIdentity::new("a", Precision::Half, Device::Accelerator);
        let full = ModelIdentity::new("a", Precision::Full, Device::Accelerator);
        slot.acquire(&half, &loader, &reclaim).unwrap();
        slot.acquire(&full, &loader, &reclaim).unwrap();

        assert_eq!(*log.borrow(), vec!["load a", "drop a", "load a"]);
    }

    #[test]
    fn missing_file_keeps_prior_resident() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut loader = TestLoader::new(&log);
        loader.missing.push("ghost".into());
        let reclaim = CountingReclaim::default();
        let mut slot = ModelSlot::new(ResourceClass::Upscaler);

        slot.acquire(&id("a"), &loader, &reclaim).unwrap();
        let err = slot.acquire(&id("ghost"), &loader, &reclaim);
        assert!(matches!(err, Err(LoadError::NotFound(_))));

        assert_eq!(slot.resident_identity(), Some(&id("a")));
        assert_eq!(*log.borrow(), vec!["load a"]);
        assert_eq!(slot.stats().failures, 1);
    }

    #[test]
    fn failed_load_leaves_slot_empty() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut loader = TestLoader::new(&log);
        loader.broken.push("bad".into());
        let reclaim = CountingReclaim::default();
        let mut slot = ModelSlot::new(ResourceClass::Backbone);

        slot.acquire(&id("a"), &loader, &reclaim).unwrap();
        let err = slot.acquire(&id("bad"), &loader, &reclaim);
        assert!(matches!(err, Err(LoadError::Malformed { .. })));
        assert!(!slot.is_loaded());
        assert!(slot.get().is_none());
        assert_eq!(*log.borrow(), vec!["load a", "drop a", "fail bad"]);

        // Recovers on the next good request.
        slot.acquire(&id("a"), &loader, &reclaim).unwrap();
        assert!(slot.is_loaded());
    }

    #[test]
    fn slots_start_unloaded() {
        let slot: ModelSlot<Tracked> = ModelSlot::new(ResourceClass::PromptEncoder);
        assert!(!slot.is_loaded());
        assert!(slot.resident_identity().is_none());
    }

    #[test]
    fn release_on_empty_slot_is_noop() {
        let reclaim = CountingReclaim::default();
        let mut slot: ModelSlot<Tracked> = ModelSlot::new(ResourceClass::Upscaler);
        slot.release(&reclaim);
        assert_eq!(reclaim.0.get(), 0);
        assert_eq!(slot.stats().releases, 0);
    }

    // =========================================================================
    // CacheStats
    // =========================================================================

    #[test]
    fn cache_stats_display() {
        let s = CacheStats {
            hits: 5,
            loads: 2,
            releases: 1,
            failures: 0,
        };
        assert_eq!(format!("{}", s), "2 loads, 1 release, 5 reused");
    }

    #[test]
    fn cache_stats_display_with_failures() {
        let s = CacheStats {
            hits: 0,
            loads: 1,
            releases: 0,
            failures: 2,
        };
        assert_eq!(format!("{}", s), "1 load, 0 releases, 0 reused, 2 failed");
    }

    #[test]
    fn resource_class_subdirs() {
        assert_eq!(ResourceClass::Upscaler.subdir(), "upscale_models");
        assert_eq!(ResourceClass::Backbone.subdir(), "unet");
        assert_eq!(ResourceClass::PromptEncoder.subdir(), "clip");
    }
}
