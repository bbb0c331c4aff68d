//! Remote upscaling through the Vertex AI Imagen upscale endpoint.
//!
//! No model is held locally. The source file is sent base64-encoded, the
//! response carries the upscaled PNG the same way, and the worker only
//! resamples it to the planned size.
//!
//! Network and credentials sit behind [`Transport`] and [`TokenSource`] so
//! the request/response handling is testable without either.

use super::{
    CommonConfig, JobContext, Method, Provider, UpscaleError, UpscaleOutput, check_pixel_budget,
    finish_job, parse_config,
};
use crate::imaging::get_dimensions;
use crate::imaging::operations::decode_rgb;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use serde_json::{Value, json};
use std::process::Command;
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub const MODEL_ID: &str = "imagen-4.0-upscale-preview";
pub const DEFAULT_PROMPT: &str = "Upscale the image with high quality and sharp details";

/// Transport timeout for one predict call.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Environment variable holding a ready-made OAuth access token.
pub const ACCESS_TOKEN_ENV: &str = "GOOGLE_OAUTH_ACCESS_TOKEN";

/// Magnification the remote model supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImagenFactor {
    X2,
    X3,
    #[default]
    X4,
}

impl ImagenFactor {
    pub fn as_str(self) -> &'static str {
        match self {
            ImagenFactor::X2 => "x2",
            ImagenFactor::X3 => "x3",
            ImagenFactor::X4 => "x4",
        }
    }

    pub fn scale(self) -> u32 {
        match self {
            ImagenFactor::X2 => 2,
            ImagenFactor::X3 => 3,
            ImagenFactor::X4 => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ImagenConfig {
    #[serde(flatten)]
    pub common: CommonConfig,
    #[serde(default)]
    pub upscale_factor: ImagenFactor,
    #[serde(default = "default_prompt")]
    pub prompt: String,
    #[serde(default)]
    pub gcp_project_id: Option<String>,
    #[serde(default)]
    pub gcp_region: Option<String>,
}

fn default_prompt() -> String {
    DEFAULT_PROMPT.to_string()
}

/// `:predict` URL for the upscale model in `project`/`region`.
pub fn predict_endpoint(project: &str, region: &str) -> String {
    format!(
        "https://{region}-aiplatform.googleapis.com/v1/projects/{project}/locations/{region}/publishers/google/models/{MODEL_ID}:predict"
    )
}

/// Request body for one upscale call.
pub fn request_body(prompt: &str, image_base64: &str, factor: ImagenFactor) -> Value {
    json!({
        "instances": [{
            "prompt": prompt,
            "image": {"bytesBase64Encoded": image_base64},
        }],
        "parameters": {
            "mode": "upscale",
            "upscaleConfig": {"upscaleFactor": factor.as_str()},
            "outputOptions": {"mimeType": "image/png"},
        },
    })
}

/// Raw HTTP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

/// Extract the decoded image bytes from a predict reply.
pub fn parse_predict_response(reply: &HttpReply) -> Result<Vec<u8>, UpscaleError> {
    if reply.status != 200 {
        let message = serde_json::from_str::<Value>(&reply.body)
            .ok()
            .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
            .unwrap_or_else(|| reply.body.clone());
        return Err(UpscaleError::RemoteCall(format!(
            "Imagen API error ({}): {}",
            reply.status, message
        )));
    }

    let value: Value = serde_json::from_str(&reply.body)
        .map_err(|e| UpscaleError::RemoteCall(format!("Invalid API response: {}", e)))?;
    let prediction = value["predictions"]
        .as_array()
        .and_then(|p| p.first())
        .ok_or_else(|| UpscaleError::RemoteCall("No predictions in API response".into()))?;
    let encoded = prediction["bytesBase64Encoded"]
        .as_str()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| UpscaleError::RemoteCall("No image data in prediction".into()))?;

    STANDARD
        .decode(encoded)
        .map_err(|e| UpscaleError::RemoteCall(format!("Invalid image data in prediction: {}", e)))
}

/// Sends an authorized JSON POST.
pub trait Transport {
    fn post_json(&self, url: &str, token: &str, body: &Value) -> Result<HttpReply, UpscaleError>;
}

/// Blocking `reqwest` transport with the predict timeout.
pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, UpscaleError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| UpscaleError::RemoteCall(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn post_json(&self, url: &str, token: &str, body: &Value) -> Result<HttpReply, UpscaleError> {
        let response = self
            .client
            .post(url)
            .bearer_auth(token)
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/json; charset=utf-8",
            )
            .json(body)
            .send()
            .map_err(|e| UpscaleError::RemoteCall(format!("Imagen request failed: {}", e)))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .map_err(|e| UpscaleError::RemoteCall(format!("Imagen response unreadable: {}", e)))?;
        Ok(HttpReply { status, body })
    }
}

/// Supplies bearer tokens for the remote API.
pub trait TokenSource {
    fn access_token(&self) -> Result<String, UpscaleError>;
}

/// Token from [`ACCESS_TOKEN_ENV`], else from
/// `gcloud auth application-default print-access-token`.
#[derive(Debug, Default)]
pub struct GcloudTokens;

impl TokenSource for GcloudTokens {
    fn access_token(&self) -> Result<String, UpscaleError> {
        if let Some(token) = std::env::var(ACCESS_TOKEN_ENV)
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
        {
            return Ok(token);
        }

        let output = Command::new("gcloud")
            .args(["auth", "application-default", "print-access-token"])
            .output()
            .map_err(|e| UpscaleError::RemoteCall(format!("Could not run gcloud: {}", e)))?;
        if !output.status.success() {
            return Err(UpscaleError::RemoteCall(format!(
                "gcloud could not provide credentials: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if token.is_empty() {
            return Err(UpscaleError::RemoteCall(
                "gcloud returned an empty access token".into(),
            ));
        }
        Ok(token)
    }
}

pub struct ImagenProvider {
    transport: Box<dyn Transport>,
    tokens: Box<dyn TokenSource>,
}

impl ImagenProvider {
    pub fn new(transport: Box<dyn Transport>, tokens: Box<dyn TokenSource>) -> Self {
        Self { transport, tokens }
    }

    /// Provider using HTTPS and gcloud credentials.
    pub fn http() -> Result<Self, UpscaleError> {
        Ok(Self::new(
            Box::new(HttpTransport::new()?),
            Box::new(GcloudTokens),
        ))
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.trim().is_empty())
}

impl Provider for ImagenProvider {
    fn method(&self) -> Method {
        Method::Imagen
    }

    fn upscale(
        &mut self,
        config: Value,
        ctx: &mut JobContext<'_>,
    ) -> Result<UpscaleOutput, UpscaleError> {
        let started = Instant::now();
        let job: ImagenConfig = parse_config(config)?;
        job.common.validate()?;
        let input_path = job.common.require_input()?;

        let (width, height) = get_dimensions(input_path)?;
        let scale = f64::from(job.upscale_factor.scale());
        check_pixel_budget(
            "remote output",
            f64::from(width) * scale,
            f64::from(height) * scale,
            ctx.config.defaults.max_output_pixels,
        )?;
        let dims = job.common.plan((width, height), scale, ctx.config)?;

        let project = non_empty(&job.gcp_project_id).unwrap_or(&ctx.config.gcp.project_id);
        let region = non_empty(&job.gcp_region).unwrap_or(&ctx.config.gcp.region);
        let endpoint = predict_endpoint(project, region);

        let image_base64 = STANDARD.encode(std::fs::read(input_path)?);
        let body = request_body(&job.prompt, &image_base64, job.upscale_factor);
        drop(image_base64);

        let token = self.tokens.access_token()?;
        info!(
            input = %input_path.display(),
            factor = job.upscale_factor.as_str(),
            project,
            region,
            "imagen upscale"
        );
        let reply = self.transport.post_json(&endpoint, &token, &body)?;
        debug!(status = reply.status, bytes = reply.body.len(), "imagen reply");

        let bytes = parse_predict_response(&reply)?;
        let upscaled = decode_rgb(&bytes, "imagen response")?;

        finish_job(
            upscaled,
            dims,
            &job.common,
            Method::Imagen,
            ctx.config,
            started,
        )
    }
}
