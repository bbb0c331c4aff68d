//! Types exchanged on the job channel.
//!
//! The channel is newline-delimited JSON. Requests arrive as [`Job`];
//! every line the worker writes is one [`Message`], tagged by `type`.

use crate::imaging::CropInfo;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::path::PathBuf;

/// Job id reported when a line couldn't be parsed far enough to find one.
pub const UNKNOWN_JOB_ID: &str = "unknown";

/// One request line: `{"method": ..., "config": {...}, "job_id": ...}`.
///
/// `config` stays untyped here; each provider deserializes its own shape.
#[derive(Debug, Clone, Deserialize)]
pub struct Job {
    #[serde(deserialize_with = "deserialize_job_id")]
    pub job_id: String,
    pub method: String,
    pub config: Value,
}

/// Textual form of a `job_id`: strings as-is, numbers in their JSON form.
pub fn job_id_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn deserialize_job_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let value = Value::deserialize(deserializer)?;
    job_id_text(&value).ok_or_else(|| {
        D::Error::custom(format!("job_id must be a string or number, got {}", value))
    })
}

/// Successful job outcome as written on the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobResult {
    pub job_id: String,
    /// First entry of `output_paths`.
    pub output_path: Option<PathBuf>,
    pub output_paths: Vec<PathBuf>,
    pub output_width: u32,
    pub output_height: u32,
    pub crop_info: Option<CropInfo>,
    /// Wall-clock seconds.
    pub processing_time: f64,
    pub status: JobStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Completed,
}

/// Every line the worker writes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    Status {
        message: String,
    },
    Warning {
        message: String,
    },
    Result(JobResult),
    Error {
        job_id: String,
        error: String,
        traceback: String,
    },
}

impl Message {
    pub fn status(message: impl Into<String>) -> Self {
        Message::Status {
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Message::Warning {
            message: message.into(),
        }
    }
}
