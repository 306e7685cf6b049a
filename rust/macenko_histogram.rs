//! Percentile angles of a projected point cloud (Macenko et al., 2009).

use crate::angle_histogram::{angles_to_vectors, vectors_to_angles, AngleHistogram};
use crate::error::{Result, StainError};
use ndarray::{Array2, ArrayView2};

pub const MACENKO_DEFAULT_BINS: usize = 1024;

/// Smallest percentile used; requests at or below zero are raised to it.
pub const MIN_PERCENTILE: f64 = 1e-6;

/// Lower/upper angular bounds of a cloud.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PercentileThresholds {
    pub lower: f64,
    pub upper: f64,
}

impl PercentileThresholds {
    /// The two bounds as unit vectors, one per row (`2 × 2`).
    pub fn to_vectors(&self) -> Array2<f64> {
        angles_to_vectors(&[self.lower, self.upper])
    }
}

/// Angle histogram that locates the `p`-th and `(100 - p)`-th percentile
/// angles.
#[derive(Debug, Clone)]
pub struct MacenkoHistogram {
    histogram: AngleHistogram,
}

impl Default for MacenkoHistogram {
    fn default() -> Self {
        Self {
            histogram: AngleHistogram::with_bins(MACENKO_DEFAULT_BINS)
                .unwrap_or_default(),
        }
    }
}

impl MacenkoHistogram {
    pub fn new(histogram: AngleHistogram) -> Self {
        Self { histogram }
    }

    pub fn histogram(&self) -> &AngleHistogram {
        &self.histogram
    }

    /// Histogram the angles of `points` (`N × 2`), replacing earlier counts.
    pub fn fill_from_points(&mut self, points: ArrayView2<f64>) -> Result<()> {
        let angles = vectors_to_angles(points)?;
        self.histogram.compute(angles.iter());
        Ok(())
    }

    /// Percentile bounds from the current counts.
    ///
    /// `percentile` is in percent and is clamped to `(0, 50]`. Counts are
    /// integrated left to right. When bin `b` is the first whose cumulative
    /// fraction reaches a target, the bound sits at position
    /// `(b - 1) + (target - prev) / (current - prev)`, with `b - 1` floored
    /// at zero.
    pub fn percentile_thresholds(&self, percentile: f64) -> Result<PercentileThresholds> {
        let total = self.histogram.total();
        if total == 0 {
            return Err(StainError::EmptyInput("angle histogram"));
        }
        if percentile.is_nan() {
            return Err(StainError::InvalidParameter(
                "percentile must be a number".to_string(),
            ));
        }
        let p = percentile.clamp(MIN_PERCENTILE, 50.0) / 100.0;
        let lower_target = p;
        let upper_target = 1.0 - p;

        let total = total as f64;
        let mut lower = None;
        let mut upper = None;
        let mut prev_fraction = 0.0;
        let mut cumulative = 0u64;
        for (bin, &count) in self.histogram.counts().iter().enumerate() {
            cumulative += count;
            let fraction = cumulative as f64 / total;
            if lower.is_none() && fraction >= lower_target {
                lower = Some(interpolate(bin, prev_fraction, fraction, lower_target));
            }
            if upper.is_none() && fraction >= upper_target {
                upper = Some(interpolate(bin, prev_fraction, fraction, upper_target));
                break;
            }
            prev_fraction = fraction;
        }

        // Rounding can leave the final fraction a hair below the target.
        let last = self.histogram.bins() as f64;
        let lower = lower.unwrap_or(last);
        let upper = upper.unwrap_or(last);
        Ok(PercentileThresholds {
            lower: self.histogram.bin_to_angle(lower),
            upper: self.histogram.bin_to_angle(upper),
        })
    }

    /// Fill from `points` and return the percentile bounds.
    pub fn compute(&mut self, points: ArrayView2<f64>, percentile: f64) -> Result<PercentileThresholds> {
        self.fill_from_points(points)?;
        let thresholds = self.percentile_thresholds(percentile)?;
        tracing::debug!(
            counted = self.histogram.total(),
            lower = thresholds.lower,
            upper = thresholds.upper,
            percentile,
            "macenko percentile angles"
        );
        Ok(thresholds)
    }
}

/// Fractional bin position where the cumulative fraction hits `target`.
/// `bin` is the crossing bin; `prev` and `current` are the cumulative
/// fractions before and after it.
#[inline]
fn interpolate(bin: usize, prev: f64, current: f64, target: f64) -> f64 {
    let base = bin.saturating_sub(1) as f64;
    let span = current - prev;
    if span <= 0.0 {
        return base;
    }
    base + (target - prev) / span
}
