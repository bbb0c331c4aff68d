//! Job dispatcher: the worker's main loop.
//!
//! Reads one job per line, routes it to the provider for its method, and
//! writes exactly one `result` or `error` line back before reading the next.
//!
//! ```text
//! Starting → LoadingDefaults → Ready ⇄ Processing
//!                                │
//!                                └─ end of input → release models, return
//! ```
//!
//! Job failures never stop the loop. Only failures of the channel itself
//! (read errors, failed writes) end [`Dispatcher::run`] with an error.

use crate::cache::ModelCache;
use crate::config::WorkerConfig;
use crate::output::{EventSink, format_traceback};
use crate::providers::esrgan::prewarm;
use crate::providers::{
    EsrganProvider, FluxProvider, ImagenProvider, JobContext, Method, Provider, UpscaleError,
    UpscaleOutput,
};
use crate::runtime::ModelRuntime;
use crate::types::{Job, JobResult, JobStatus, Message, UNKNOWN_JOB_ID, job_id_text};
use serde_json::Value;
use std::error::Error;
use std::io::{self, BufRead};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const LOADING_STATUS: &str = "loading_models";
pub const READY_STATUS: &str = "ready";

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Invalid job line: {0}")]
    ParseFailure(#[source] serde_json::Error),
    #[error("Unknown method: {0}")]
    UnknownMethod(String),
}

impl DispatchError {
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::ParseFailure(_) => "ParseFailure",
            DispatchError::UnknownMethod(_) => "UnknownMethod",
        }
    }
}

/// Parse a request line.
///
/// On failure the job id is still recovered when the line is a JSON object
/// carrying a string or numeric `job_id`; otherwise it is [`UNKNOWN_JOB_ID`].
pub fn parse_job(line: &str) -> Result<Job, (String, DispatchError)> {
    let value: Value = serde_json::from_str(line)
        .map_err(|e| (UNKNOWN_JOB_ID.to_string(), DispatchError::ParseFailure(e)))?;
    let job_id = value
        .get("job_id")
        .and_then(job_id_text)
        .unwrap_or_else(|| UNKNOWN_JOB_ID.to_string());
    serde_json::from_value(value).map_err(|e| (job_id, DispatchError::ParseFailure(e)))
}

fn error_message(job_id: &str, kind: &str, err: &dyn Error) -> Message {
    Message::Error {
        job_id: job_id.to_string(),
        error: err.to_string(),
        traceback: format_traceback(kind, err),
    }
}

fn result_message(job_id: String, output: UpscaleOutput) -> Message {
    Message::Result(JobResult {
        job_id,
        output_path: output.output_paths.first().cloned(),
        output_paths: output.output_paths,
        output_width: output.output_width,
        output_height: output.output_height,
        crop_info: output.crop_info,
        processing_time: output.processing_time,
        status: JobStatus::Completed,
    })
}

pub struct Dispatcher<'a> {
    runtime: &'a dyn ModelRuntime,
    config: &'a WorkerConfig,
    cache: ModelCache,
    providers: Vec<Box<dyn Provider>>,
    jobs: u64,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        runtime: &'a dyn ModelRuntime,
        config: &'a WorkerConfig,
        providers: Vec<Box<dyn Provider>>,
    ) -> Self {
        Self {
            runtime,
            config,
            cache: ModelCache::new(),
            providers,
            jobs: 0,
        }
    }

    /// Dispatcher with all three providers, talking HTTPS for imagen.
    pub fn with_default_providers(
        runtime: &'a dyn ModelRuntime,
        config: &'a WorkerConfig,
    ) -> Result<Self, UpscaleError> {
        let providers: Vec<Box<dyn Provider>> = vec![
            Box::new(EsrganProvider),
            Box::new(FluxProvider::default()),
            Box::new(ImagenProvider::http()?),
        ];
        Ok(Self::new(runtime, config, providers))
    }

    pub fn cache(&self) -> &ModelCache {
        &self.cache
    }

    /// Announce loading, pre-warm the default upscaler, announce ready.
    ///
    /// A pre-warm failure is reported as a warning; the worker still starts.
    pub fn startup(&mut self, events: &mut dyn EventSink) -> io::Result<()> {
        events.status(LOADING_STATUS)?;

        // Validated config guarantees a non-empty name.
        let model = self.config.defaults.prewarm_model.as_str();
        match prewarm(
            &mut self.cache,
            self.runtime,
            &self.config.model_cache_dir,
            model,
        ) {
            Ok(()) => info!(model, "default upscaler resident"),
            Err(e) => {
                warn!(model, error = %e, "pre-load failed");
                events.emit(&Message::warning(format!(
                    "Could not pre-load ESRGAN model: {}",
                    e
                )))?;
            }
        }

        events.status(READY_STATUS)
    }

    /// Run until `input` is exhausted.
    pub fn run<R: BufRead>(&mut self, input: R, events: &mut dyn EventSink) -> io::Result<()> {
        self.startup(events)?;

        for line in input.split(b'\n') {
            let line = line?;
            let line = String::from_utf8_lossy(&line);
            if line.trim().is_empty() {
                continue;
            }
            let response = self.handle_line(&line, events)?;
            events.emit(&response)?;
        }

        info!(jobs = self.jobs, cache = %self.cache.stats(), "job channel closed");
        self.cache.release_all(self.runtime);
        Ok(())
    }

    /// Process one non-blank line into its response.
    ///
    /// `Err` only for channel failures raised while the job was running.
    pub fn handle_line(&mut self, line: &str, events: &mut dyn EventSink) -> io::Result<Message> {
        let job = match parse_job(line) {
            Ok(job) => job,
            Err((job_id, e)) => {
                warn!(job_id = job_id.as_str(), error = %e, "rejected job line");
                return Ok(error_message(&job_id, e.kind(), &e));
            }
        };

        let Some(provider) = job
            .method
            .parse::<Method>()
            .ok()
            .and_then(|m| self.providers.iter_mut().find(|p| p.method() == m))
        else {
            let e = DispatchError::UnknownMethod(job.method.clone());
            warn!(
                job_id = job.job_id.as_str(),
                method = job.method.as_str(),
                "unknown method"
            );
            return Ok(error_message(&job.job_id, e.kind(), &e));
        };

        self.jobs += 1;
        let started = Instant::now();
        info!(
            job_id = job.job_id.as_str(),
            method = job.method.as_str(),
            "job started"
        );

        let mut ctx = JobContext {
            cache: &mut self.cache,
            runtime: self.runtime,
            config: self.config,
            events,
        };
        let outcome = provider.upscale(job.config, &mut ctx);
        self.runtime.reclaim_memory();

        match outcome {
            Ok(output) => {
                info!(
                    job_id = job.job_id.as_str(),
                    width = output.output_width,
                    height = output.output_height,
                    elapsed = ?started.elapsed(),
                    "job completed"
                );
                Ok(result_message(job.job_id, output))
            }
            Err(UpscaleError::Channel(e)) => Err(e),
            Err(e) => {
                warn!(
                    job_id = job.job_id.as_str(),
                    kind = e.kind(),
                    error = %e,
                    "job failed"
                );
                debug!(cache = %self.cache.stats(), "after failure");
                Ok(error_message(&job.job_id, e.kind(), &e))
            }
        }
    }
}
