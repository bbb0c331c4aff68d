//! # Upscale Worker
//!
//! A long-lived image upscaling worker. An orchestrator writes jobs to the
//! worker's stdin, one JSON object per line; the worker answers each with
//! exactly one `result` or `error` line on stdout and keeps its expensive
//! models resident between jobs.
//!
//! # Architecture
//!
//! ```text
//! stdin ──► Dispatcher ──► Provider (esrgan | flux | imagen)
//!               │              │
//!               │              ├─ planner: print size → output pixels, crop
//!               │              ├─ tiler + blend: bounded-memory inference
//!               │              └─ ModelCache: one resident model per class
//!               ▼
//!            stdout (status / warning / result / error)
//! ```
//!
//! Large images are never run through a network whole. The image is split
//! into overlapping tiles, each tile is upscaled independently, and the
//! results are feather-blended onto an accumulation canvas so seams vanish.
//! Peak memory is one tile plus the canvas, whatever the input size.
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`dispatch`] | Job loop: parse, route, respond; startup pre-warm |
//! | [`providers`] | The three upscale methods and their job configs |
//! | [`imaging`] | Dimension planning, tiling, blending, image I/O |
//! | [`cache`] | Single-slot model cache per resource class |
//! | [`runtime`] | Inference runtime seam, model loaders, CPU reference runtime |
//! | [`config`] | Worker config: stock TOML defaults, file overlay, env overrides |
//! | [`types`] | Wire types for the job channel |
//! | [`output`] | Protocol line writer and text formatting |
//!
//! # Design Decisions
//!
//! ## Explicit Model Ownership
//!
//! Models are owned by [`cache::ModelCache`] and nothing else. Providers
//! borrow the resident model for the duration of a job. Loading a different
//! identity into a slot releases the previous one first, so at most one model
//! per class is ever resident.
//!
//! ## Strictly Sequential Jobs
//!
//! The job loop handles one line at a time and only reads the next line
//! after the previous response is flushed. Parallelism lives inside a job
//! (rayon over canvas rows and tensor conversion), never across jobs.
//!
//! ## Stdout Is the Protocol
//!
//! Diagnostics go through `tracing` to stderr. Nothing but protocol lines is
//! ever written to stdout.

pub mod cache;
pub mod config;
pub mod dispatch;
pub mod imaging;
pub mod output;
pub mod providers;
pub mod runtime;
pub mod types;

#[cfg(test)]
pub(crate) mod test_helpers;
