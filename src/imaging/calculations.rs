//! Pure calculation functions for output dimensions.
//!
//! All functions here are pure and testable without any I/O or images.
//!
//! The print planner answers one question: given a source image and a
//! physical print size at a given density, how many pixels do we need so that
//! trimming the overshoot yields exactly the requested print? The covered
//! dimension matches the print exactly; the other one overshoots and the
//! overshoot is reported as crop metadata for a human to place.

use serde::Serialize;
use thiserror::Error;

/// Aspect ratios closer than this are treated as identical (no crop).
const ASPECT_TOLERANCE: f64 = 0.01;

/// Scale factor used when neither a print target nor a factor is given.
pub const DEFAULT_UPSCALE_FACTOR: u32 = 4;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanError {
    #[error("input dimensions must be positive, got {0}x{1}")]
    EmptyInput(u32, u32),
    #[error("target print size must be positive, got {0}\" x {1}\"")]
    NonPositiveTarget(f64, f64),
    #[error("density must be positive, got {0} dpi")]
    NonPositiveDensity(u32),
}

/// Which dimension overshoots the print and has to be trimmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CropDirection {
    None,
    /// Excess height: the input is relatively taller than the print.
    Vertical,
    /// Excess width: the input is relatively wider than the print.
    Horizontal,
}

/// Full result of planning a print-sized output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DimensionPlan {
    pub output_width_px: u32,
    pub output_height_px: u32,
    /// Print size in pixels after trimming the overshoot.
    pub final_width_px: u32,
    pub final_height_px: u32,
    pub scale_factor: f64,
    pub crop_direction: CropDirection,
    pub crop_amount_px: u32,
    pub crop_amount_inches: f64,
    /// Physical size of the untrimmed output, e.g. `8.0" x 12.50"`.
    pub equivalent_print_size: String,
}

/// Crop metadata attached to a job result when the output overshoots.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CropInfo {
    pub direction: CropDirection,
    pub amount_px: u32,
    pub amount_inches: f64,
}

/// Output size for a job, with or without a print target.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputDimensions {
    pub output_width: u32,
    pub output_height: u32,
    pub scale_factor: f64,
    pub crop_info: Option<CropInfo>,
}

/// Physical print request: width/height in inches at a density.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrintTarget {
    pub width_inches: f64,
    pub height_inches: f64,
    pub dpi: u32,
}

/// A requested print dimension as written in the size label: whole values
/// keep one decimal (`6.0`), others print as given (`6.5`).
fn inches(value: f64) -> String {
    format!("{:?}", value)
}

/// Calculate the scale and output dimensions needed to still cover the print
/// size after cropping to the print's aspect ratio.
///
/// # Examples
/// ```
/// # use upscale_worker::imaging::{calculate_scale_for_crop, CropDirection};
/// // 1000x1000 onto a 4"x6" print at 150 dpi: the square is wider than the
/// // 2:3 print, so height matches (900px) and width overshoots by 300px.
/// let plan = calculate_scale_for_crop(1000, 1000, 4.0, 6.0, 150).unwrap();
/// assert_eq!(plan.crop_direction, CropDirection::Horizontal);
/// assert_eq!((plan.output_width_px, plan.output_height_px), (900, 900));
/// assert_eq!(plan.crop_amount_px, 300);
/// ```
pub fn calculate_scale_for_crop(
    input_width: u32,
    input_height: u32,
    target_width_inches: f64,
    target_height_inches: f64,
    dpi: u32,
) -> Result<DimensionPlan, PlanError> {
    if input_width == 0 || input_height == 0 {
        return Err(PlanError::EmptyInput(input_width, input_height));
    }
    if !(target_width_inches > 0.0 && target_height_inches > 0.0) {
        return Err(PlanError::NonPositiveTarget(
            target_width_inches,
            target_height_inches,
        ));
    }
    if dpi == 0 {
        return Err(PlanError::NonPositiveDensity(dpi));
    }

    let density = dpi as f64;
    let final_width_px = (target_width_inches * density) as u32;
    let final_height_px = (target_height_inches * density) as u32;

    let input_aspect = input_width as f64 / input_height as f64;
    let target_aspect = target_width_inches / target_height_inches;

    if (input_aspect - target_aspect).abs() < ASPECT_TOLERANCE {
        return Ok(DimensionPlan {
            output_width_px: final_width_px,
            output_height_px: final_height_px,
            final_width_px,
            final_height_px,
            scale_factor: final_width_px as f64 / input_width as f64,
            crop_direction: CropDirection::None,
            crop_amount_px: 0,
            crop_amount_inches: 0.0,
            equivalent_print_size: format!(
                "{}\" x {}\"",
                inches(target_width_inches),
                inches(target_height_inches)
            ),
        });
    }

    if input_aspect < target_aspect {
        // Taller: width matches, height overshoots
        let scale_factor = final_width_px as f64 / input_width as f64;
        let output_height_px = (input_height as f64 * scale_factor) as u32;
        let crop_amount_px = output_height_px.saturating_sub(final_height_px);
        Ok(DimensionPlan {
            output_width_px: final_width_px,
            output_height_px,
            final_width_px,
            final_height_px,
            scale_factor,
            crop_direction: CropDirection::Vertical,
            crop_amount_px,
            crop_amount_inches: crop_amount_px as f64 / density,
            equivalent_print_size: format!(
                "{}\" x {:.2}\"",
                inches(target_width_inches),
                output_height_px as f64 / density
            ),
        })
    } else {
        // Wider: height matches, width overshoots
        let scale_factor = final_height_px as f64 / input_height as f64;
        let output_width_px = (input_width as f64 * scale_factor) as u32;
        let crop_amount_px = output_width_px.saturating_sub(final_width_px);
        Ok(DimensionPlan {
            output_width_px,
            output_height_px: final_height_px,
            final_width_px,
            final_height_px,
            scale_factor,
            crop_direction: CropDirection::Horizontal,
            crop_amount_px,
            crop_amount_inches: crop_amount_px as f64 / density,
            equivalent_print_size: format!(
                "{:.2}\" x {}\"",
                output_width_px as f64 / density,
                inches(target_height_inches)
            ),
        })
    }
}

/// Calculate the output size for a job.
///
/// Without a print target the output is simply `input × factor`. With one,
/// the print planner decides and crop metadata is attached only when the
/// output actually overshoots.
pub fn calculate_output_dimensions(
    input: (u32, u32),
    upscale_factor: f64,
    target: Option<PrintTarget>,
) -> Result<OutputDimensions, PlanError> {
    let (input_width, input_height) = input;
    let Some(target) = target else {
        return Ok(OutputDimensions {
            output_width: (input_width as f64 * upscale_factor) as u32,
            output_height: (input_height as f64 * upscale_factor) as u32,
            scale_factor: upscale_factor,
            crop_info: None,
        });
    };

    let plan = calculate_scale_for_crop(
        input_width,
        input_height,
        target.width_inches,
        target.height_inches,
        target.dpi,
    )?;

    let crop_info = (plan.crop_direction != CropDirection::None).then(|| CropInfo {
        direction: plan.crop_direction,
        amount_px: plan.crop_amount_px,
        amount_inches: plan.crop_amount_inches,
    });

    Ok(OutputDimensions {
        output_width: plan.output_width_px,
        output_height: plan.output_height_px,
        scale_factor: plan.scale_factor,
        crop_info,
    })
}
