//! Frame validation utilities for test pattern verification.
//!
//! This module provides functions to validate that converted output images
//! contain expected test patterns. Useful for integration testing with
//! virtual cameras.

use crate::error::{CameraError, Result};
use crate::output::OutputImage;

/// Expected RGB values for SMPTE color bars (8 bars).
///
/// These are the RGB values resulting from converting the YUV values
/// used by the mock device's color bar pattern.
///
/// Colors in order: White, Yellow, Cyan, Green, Magenta, Red, Blue, Black
const SMPTE_COLOR_BARS: [(u8, u8, u8); 8] = [
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
const COLOR_TOLERANCE: u32 = 15;

fn mismatch(reason: String) -> CameraError {
    CameraError::invalid_value("frame", reason)
}

/// Validates that an RGB image contains the SMPTE color bar pattern.
///
/// Checks 8 vertical stripes at their center positions, verifying that each
/// stripe contains the expected color within a tolerance for YUV-to-RGB
/// conversion inaccuracies.
///
/// # Errors
///
/// Returns `InvalidValue` if:
/// - A sample lies outside the image data
/// - Any color bar doesn't match the expected color within tolerance
pub fn validate_color_bars(image: &OutputImage) -> Result<()> {
    let bar_width = image.width / 8;
    let center_y = image.height / 2;

    for (bar_idx, expected_rgb) in SMPTE_COLOR_BARS.iter().enumerate() {
        // Sample the center of each bar
        #[allow(clippy::cast_possible_truncation)]
        let sample_x = (bar_idx as u32 * bar_width) + (bar_width / 2);

        let actual_rgb = image
            .pixel_at(sample_x, center_y)
            .ok_or_else(|| mismatch(format!("no pixel at ({sample_x}, {center_y})")))?;

        if !colors_match(actual_rgb, *expected_rgb, COLOR_TOLERANCE) {
            return Err(mismatch(format!(
                "color bar {bar_idx} mismatch at ({sample_x}, {center_y}): \
                 expected RGB{expected_rgb:?}, got RGB{actual_rgb:?}"
            )));
        }
    }

    Ok(())
}

/// Validates that an image contains a horizontal gradient pattern.
///
/// Samples a horizontal line at the center of the image and verifies that
/// the luminance increases monotonically from left to right, with a
/// significant overall change (not a solid color). Works for both RGB and
/// grey images.
///
/// # Errors
///
/// Returns `InvalidValue` if:
/// - The luminance doesn't increase monotonically
/// - The total luminance change is too small
pub fn validate_gradient(image: &OutputImage) -> Result<()> {
    let center_y = image.height / 2;
    let sample_step = (image.width / 64).max(1) as usize;

    let mut first: Option<f32> = None;
    let mut prev: Option<f32> = None;

    for x in (0..image.width).step_by(sample_step) {
        let (r, g, b) = image
            .pixel_at(x, center_y)
            .ok_or_else(|| mismatch(format!("no pixel at ({x}, {center_y})")))?;

        // Calculate luminance (Y' in Rec. 601)
        let luminance = 0.114f32.mul_add(
            f32::from(b),
            0.587f32.mul_add(f32::from(g), 0.299 * f32::from(r)),
        );

        if let Some(prev) = prev {
            // Allow small decreases due to rounding
            if luminance < prev - 1.0 {
                return Err(mismatch(format!(
                    "gradient not monotonically increasing at x={x}: \
                     luminance {luminance} < previous {prev}"
                )));
            }
        }
        first.get_or_insert(luminance);
        prev = Some(luminance);
    }

    if let (Some(first), Some(last)) = (first, prev) {
        let change = last - first;
        if change < 50.0 {
            return Err(mismatch(format!(
                "insufficient luminance change for gradient: {change} (expected at least 50.0)"
            )));
        }
    }

    Ok(())
}

/// Validates that images carry incrementing sequence numbers with no gaps.
///
/// # Errors
///
/// Returns `InvalidValue` if the slice is empty or any sequence number
/// doesn't increment by exactly 1 from the previous.
pub fn validate_frame_sequence(images: &[OutputImage]) -> Result<()> {
    if images.is_empty() {
        return Err(mismatch("cannot validate empty frame sequence".to_owned()));
    }

    for (i, pair) in images.windows(2).enumerate() {
        let [prev, curr] = pair else { continue };
        let expected = prev.sequence.wrapping_add(1);
        if curr.sequence != expected {
            return Err(mismatch(format!(
                "frame sequence gap at index {}: expected {expected}, got {}",
                i + 1,
                curr.sequence
            )));
        }
    }

    Ok(())
}

/// Whether two RGB colors match within `tolerance` per channel.
fn colors_match(actual: (u8, u8, u8), expected: (u8, u8, u8), tolerance: u32) -> bool {
    let (ar, ag, ab) = actual;
    let (er, eg, eb) = expected;

    u32::from(ar.abs_diff(er)) <= tolerance
        && u32::from(ag.abs_diff(eg)) <= tolerance
        && u32::from(ab.abs_diff(eb)) <= tolerance
}
