//! Output formatting for the job channel and the CLI.
//!
//! # Architecture
//!
//! Pure `format_*` functions build the text (no I/O, no side effects) and an
//! [`Emitter`] writes it. Protocol lines go to the job channel, one JSON
//! object per line, flushed immediately so the orchestrator never waits on a
//! buffered response.
//!
//! ```text
//! {"type":"status","message":"loading_models"}
//! {"type":"warning","message":"Could not pre-load ESRGAN model: ..."}
//! {"type":"status","message":"ready"}
//! {"type":"result","job_id":"j1","output_path":"/app/results/a_esrgan.png",...}
//! {"type":"error","job_id":"unknown","error":"...","traceback":"..."}
//! ```

use crate::imaging::{CropDirection, DimensionPlan};
use crate::types::Message;
use std::error::Error;
use std::io::{self, Write};

/// Something that accepts protocol messages mid-job.
pub trait EventSink {
    fn emit(&mut self, message: &Message) -> io::Result<()>;

    fn status(&mut self, message: &str) -> io::Result<()> {
        self.emit(&Message::status(message))
    }
}

/// Serialize a message as one protocol line (no trailing newline).
pub fn format_message(message: &Message) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}

/// Render an error and its source chain, innermost last, tagged with `kind`.
///
/// ```text
/// ResourceLoadFailure: Failed to load model: ...
///   caused by: Model file not found: /app/models/upscale_models/x.pth
/// ```
pub fn format_traceback(kind: &str, err: &dyn Error) -> String {
    let mut out = format!("{}: {}", kind, err);
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(&format!("\n  caused by: {}", cause));
        source = cause.source();
    }
    out
}

/// Human-readable summary of a dimension plan.
pub fn format_plan(plan: &DimensionPlan) -> Vec<String> {
    let mut lines = vec![
        format!(
            "Output: {}x{} px (scale {:.4})",
            plan.output_width_px, plan.output_height_px, plan.scale_factor
        ),
        format!(
            "Print:  {}x{} px",
            plan.final_width_px, plan.final_height_px
        ),
    ];
    match plan.crop_direction {
        CropDirection::None => lines.push("Crop:   none".to_string()),
        direction => {
            let label = match direction {
                CropDirection::Vertical => "vertical",
                _ => "horizontal",
            };
            lines.push(format!(
                "Crop:   {} {} px ({:.2} in)",
                label, plan.crop_amount_px, plan.crop_amount_inches
            ));
        }
    }
    lines.push(format!("Equivalent print: {}", plan.equivalent_print_size));
    lines
}

/// Writes protocol messages as JSON lines.
pub struct Emitter<W: Write> {
    out: W,
}

impl<W: Write> Emitter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> EventSink for Emitter<W> {
    fn emit(&mut self, message: &Message) -> io::Result<()> {
        let line = format_message(message).map_err(io::Error::other)?;
        writeln!(self.out, "{}", line)?;
        self.out.flush()
    }
}
