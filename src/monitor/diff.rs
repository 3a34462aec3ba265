//! Pixel-level frame comparison.
//!
//! Decodes PNG frames and reports the fraction of pixels that moved more than
//! the channel tolerance. A dimension mismatch (screen resize) reports 1.0 —
//! fully different.

use anyhow::{Context, Result};

/// Per-channel tolerance on a 0..1 scale: deltas below this are noise.
const CHANNEL_TOLERANCE: f64 = 0.1;

/// Ratio of changed pixels between two PNG frames, in `[0, 1]`.
pub fn pixel_diff_ratio(previous_png: &[u8], current_png: &[u8]) -> Result<f64> {
    let previous = image::load_from_memory(previous_png)
        .context("failed to decode previous frame")?
        .to_rgba8();
    let current = image::load_from_memory(current_png)
        .context("failed to decode current frame")?
        .to_rgba8();

    if previous.dimensions() != current.dimensions() {
        return Ok(1.0);
    }

    let total = (previous.width() as u64 * previous.height() as u64).max(1);
    let tolerance = (CHANNEL_TOLERANCE * 255.0) as i32;

    let mut changed = 0u64;
    for (prev_pixel, cur_pixel) in previous.pixels().zip(current.pixels()) {
        let moved = prev_pixel
            .0
            .iter()
            .zip(cur_pixel.0.iter())
            .take(3) // alpha carries no screen content
            .any(|(a, b)| (*a as i32 - *b as i32).abs() > tolerance);
        if moved {
            changed += 1;
        }
    }

    Ok(changed as f64 / total as f64)
}
