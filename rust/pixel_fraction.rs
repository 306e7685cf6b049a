//! Stain coverage: the share of pixels in which each stain is present.

use crate::color_deconvolution::ColorDeconvolution;
use crate::error::{Result, StainError};
use image::RgbImage;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Per-stain pixel counts over one image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelFractions {
    pub total: u64,
    pub stained: [u64; 3],
}

impl PixelFractions {
    /// Fraction of pixels carrying `stain`; `0` for an empty image.
    pub fn fraction(&self, stain: usize) -> f64 {
        match self.stained.get(stain) {
            Some(&n) if self.total > 0 => n as f64 / self.total as f64,
            _ => 0.0,
        }
    }

    fn merge(mut self, other: Self) -> Self {
        self.total += other.total;
        for (a, b) in self.stained.iter_mut().zip(other.stained) {
            *a += b;
        }
        self
    }
}

/// Count, per declared stain, the pixels whose stain OD sum exceeds
/// `od_threshold`. Rows are classified in parallel.
pub fn pixel_fractions(
    deconvolution: &ColorDeconvolution,
    image: &RgbImage,
    od_threshold: f64,
) -> Result<PixelFractions> {
    if !od_threshold.is_finite() {
        return Err(StainError::InvalidParameter(format!(
            "OD threshold must be finite, got {od_threshold}"
        )));
    }
    let row_len = image.width() as usize * 3;
    if row_len == 0 || image.height() == 0 {
        return Ok(PixelFractions::default());
    }
    let num_stains = deconvolution.num_stains();
    let stains = *deconvolution.stains();
    let row_sums: Vec<f64> = stains.iter().map(|s| s.iter().sum()).collect();

    let counts = image
        .as_raw()
        .par_chunks(row_len)
        .map(|row| {
            let mut counts = PixelFractions::default();
            for p in row.chunks_exact(3) {
                counts.total += 1;
                let saturations = deconvolution.saturations([p[0], p[1], p[2]]);
                for stain in 0..num_stains {
                    if saturations[stain] * row_sums[stain] > od_threshold {
                        counts.stained[stain] += 1;
                    }
                }
            }
            counts
        })
        .reduce(PixelFractions::default, PixelFractions::merge);
    tracing::debug!(total = counts.total, stained = ?counts.stained, "pixel fractions");
    Ok(counts)
}
