//! Frame validation utilities for test pattern verification.
//!
//! These checks run on converted frames, so the same assertions cover every
//! raw format a camera can deliver. Useful for integration testing with
//! virtual cameras.

use crate::convert::Frame;
use crate::error::{CameraError, Result};

/// Expected RGB values for SMPTE color bars (8 bars).
///
/// Colors in order: White, Yellow, Cyan, Green, Magenta, Red, Blue, Black
pub const SMPTE_COLOR_BARS: [(u8, u8, u8); 8] = [
    (235, 235, 235), // White
    (235, 235, 11),  // Yellow
    (12, 236, 237),  // Cyan
    (13, 237, 13),   // Green
    (237, 13, 237),  // Magenta
    (238, 14, 13),   // Red
    (15, 15, 239),   // Blue
    (16, 16, 16),    // Black
];

/// Tolerance for RGB color matching (accounts for YUV->RGB conversion errors).
const COLOR_TOLERANCE: u8 = 15;

/// Validates that a frame contains the SMPTE color bar pattern.
///
/// Samples the center of each of the 8 vertical stripes on the middle row.
///
/// # Errors
///
/// Returns `Stream` if a sample falls outside the frame or any bar doesn't
/// match the expected color within tolerance.
pub fn validate_color_bars(frame: &Frame<'_>) -> Result<()> {
    let bar_width = frame.width / 8;
    let center_y = frame.height / 2;

    for (bar_idx, expected_rgb) in (0u32..).zip(SMPTE_COLOR_BARS.iter()) {
        let sample_x = (bar_idx * bar_width) + (bar_width / 2);

        let actual_rgb = frame.pixel_rgb(sample_x, center_y).ok_or_else(|| {
            CameraError::Stream(format!("Failed to get pixel at ({sample_x}, {center_y})"))
        })?;

        if !colors_match(actual_rgb, *expected_rgb, COLOR_TOLERANCE) {
            return Err(CameraError::Stream(format!(
                "Color bar {bar_idx} mismatch at ({sample_x}, {center_y}): \
                 expected RGB{expected_rgb:?}, got RGB{actual_rgb:?}"
            )));
        }
    }

    Ok(())
}

/// Validates that a frame contains a horizontal gradient pattern.
///
/// Luminance along the middle row must not drop by more than rounding noise
/// and must rise by at least 50 across the frame.
///
/// # Errors
///
/// Returns `Stream` if the luminance decreases or the total change is too
/// small (solid color).
pub fn validate_gradient(frame: &Frame<'_>) -> Result<()> {
    let center_y = frame.height / 2;

    let sample_step = 10usize;
    let mut first_luminance: Option<f32> = None;
    let mut prev_luminance: Option<f32> = None;

    for x in (0..frame.width).step_by(sample_step) {
        let (r, g, b) = frame.pixel_rgb(x, center_y).ok_or_else(|| {
            CameraError::Stream(format!("Failed to get pixel at ({x}, {center_y})"))
        })?;

        // Rec. 601 luma
        let luminance = 0.114f32.mul_add(
            f32::from(b),
            0.587f32.mul_add(f32::from(g), 0.299 * f32::from(r)),
        );

        first_luminance.get_or_insert(luminance);
        if let Some(prev) = prev_luminance {
            if luminance < prev - 1.0 {
                return Err(CameraError::Stream(format!(
                    "Gradient not monotonically increasing at x={x}: \
                     luminance {luminance} < previous {prev}"
                )));
            }
        }
        prev_luminance = Some(luminance);
    }

    if let (Some(first), Some(last)) = (first_luminance, prev_luminance) {
        let luminance_change = last - first;
        if luminance_change < 50.0 {
            return Err(CameraError::Stream(format!(
                "Insufficient luminance change for gradient: {luminance_change} \
                 (expected at least 50.0)"
            )));
        }
    }

    Ok(())
}

/// Validates that frame sequence numbers increment by exactly 1.
///
/// # Errors
///
/// Returns `Stream` if `sequences` is empty or has a gap.
pub fn validate_frame_sequence(sequences: &[u64]) -> Result<()> {
    if sequences.is_empty() {
        return Err(CameraError::Stream(
            "Cannot validate empty frame sequence".to_owned(),
        ));
    }

    for (index, pair) in sequences.windows(2).enumerate() {
        if let [prev, curr] = pair {
            if *curr != prev + 1 {
                return Err(CameraError::Stream(format!(
                    "Frame sequence gap at index {}: expected {}, got {curr}",
                    index + 1,
                    prev + 1
                )));
            }
        }
    }

    Ok(())
}

/// Whether all three channels are within `tolerance`.
fn colors_match(actual: (u8, u8, u8), expected: (u8, u8, u8), tolerance: u8) -> bool {
    actual.0.abs_diff(expected.0) <= tolerance
        && actual.1.abs_diff(expected.1) <= tolerance
        && actual.2.abs_diff(expected.2) <= tolerance
}
