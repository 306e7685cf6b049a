//! Angles of 2-D projected points and their histogram over a circular range.

use crate::error::{Result, StainError};
use ndarray::{Array1, Array2, ArrayView2};
use std::f64::consts::PI;

/// Angle assigned to a point at the origin, which has no direction.
pub const UNDEFINED_ANGLE: f64 = f64::MAX;

/// Coordinates below this magnitude count as zero when computing angles.
pub const ZERO_VECTOR_TOLERANCE: f64 = 1e-6;

pub const DEFAULT_BINS: usize = 128;
pub const DEFAULT_RANGE: (f64, f64) = (-PI, PI);

#[inline]
pub fn is_undefined(angle: f64) -> bool {
    angle == UNDEFINED_ANGLE || angle.is_nan()
}

/// `atan2(y, x)` for every row of an `N × 2` array.
///
/// Rows where both coordinates are within [`ZERO_VECTOR_TOLERANCE`] of zero
/// get [`UNDEFINED_ANGLE`] so that they can be skipped instead of piling up
/// at angle 0.
pub fn vectors_to_angles(points: ArrayView2<f64>) -> Result<Array1<f64>> {
    if points.ncols() != 2 {
        return Err(StainError::DimensionMismatch(format!(
            "expected N x 2 points, got {:?}",
            points.shape()
        )));
    }
    Ok(points
        .rows()
        .into_iter()
        .map(|row| {
            let (x, y) = (row[0], row[1]);
            if x.abs() < ZERO_VECTOR_TOLERANCE && y.abs() < ZERO_VECTOR_TOLERANCE {
                UNDEFINED_ANGLE
            } else {
                y.atan2(x)
            }
        })
        .collect())
}

/// Unit vectors `(cos θ, sin θ)`, one row per angle.
pub fn angles_to_vectors(angles: &[f64]) -> Array2<f64> {
    let mut out = Array2::zeros((angles.len(), 2));
    for (mut row, &theta) in out.rows_mut().into_iter().zip(angles) {
        row[0] = theta.cos();
        row[1] = theta.sin();
    }
    out
}

/// Uniform-bin histogram of angles over `[min, max)`.
///
/// When the range spans a full turn, angles outside it are wrapped back in,
/// so every defined angle is counted. For a partial range, angles outside it
/// are ignored. Undefined angles are always ignored.
#[derive(Debug, Clone, PartialEq)]
pub struct AngleHistogram {
    range: (f64, f64),
    counts: Vec<u64>,
    total: u64,
}

impl Default for AngleHistogram {
    fn default() -> Self {
        Self {
            range: DEFAULT_RANGE,
            counts: vec![0; DEFAULT_BINS],
            total: 0,
        }
    }
}

impl AngleHistogram {
    pub fn new(bins: usize, range: (f64, f64)) -> Result<Self> {
        if bins == 0 {
            return Err(StainError::InvalidParameter(
                "histogram needs at least one bin".to_string(),
            ));
        }
        let (min, max) = range;
        if !(min.is_finite() && max.is_finite() && max > min) || max - min > 2.0 * PI + 1e-9 {
            return Err(StainError::InvalidParameter(format!(
                "invalid angle range [{min}, {max})"
            )));
        }
        Ok(Self {
            range,
            counts: vec![0; bins],
            total: 0,
        })
    }

    pub fn with_bins(bins: usize) -> Result<Self> {
        Self::new(bins, DEFAULT_RANGE)
    }

    /// Histogram over a full turn centered on `center`.
    pub fn centered(bins: usize, center: f64) -> Result<Self> {
        Self::new(bins, (center - PI, center + PI))
    }

    #[inline]
    pub fn bins(&self) -> usize {
        self.counts.len()
    }

    #[inline]
    pub fn range(&self) -> (f64, f64) {
        self.range
    }

    #[inline]
    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    /// Number of angles counted so far.
    #[inline]
    pub fn total(&self) -> u64 {
        self.total
    }

    #[inline]
    pub fn bin_width(&self) -> f64 {
        (self.range.1 - self.range.0) / self.bins() as f64
    }

    fn is_full_turn(&self) -> bool {
        (self.range.1 - self.range.0 - 2.0 * PI).abs() < 1e-9
    }

    /// Bring `angle` into the histogram range, or `None` if it has no place.
    pub fn wrap(&self, angle: f64) -> Option<f64> {
        if is_undefined(angle) || !angle.is_finite() {
            return None;
        }
        let (min, max) = self.range;
        if self.is_full_turn() {
            let wrapped = min + (angle - min).rem_euclid(2.0 * PI);
            // rem_euclid can round up to exactly the period.
            Some(if wrapped >= max { min } else { wrapped })
        } else if angle >= min && angle < max {
            Some(angle)
        } else {
            None
        }
    }

    /// Bin containing `angle`, if it is counted at all.
    pub fn bin_of(&self, angle: f64) -> Option<usize> {
        let a = self.wrap(angle)?;
        let bin = ((a - self.range.0) / self.bin_width()).floor() as usize;
        Some(bin.min(self.bins() - 1))
    }

    /// Angle at a fractional bin position (`0.0` is the lower range edge).
    #[inline]
    pub fn bin_to_angle(&self, position: f64) -> f64 {
        self.range.0 + position * self.bin_width()
    }

    pub fn clear(&mut self) {
        self.counts.iter_mut().for_each(|c| *c = 0);
        self.total = 0;
    }

    /// Add angles to the histogram.
    pub fn fill<'a, I>(&mut self, angles: I)
    where
        I: IntoIterator<Item = &'a f64>,
    {
        for &angle in angles {
            if let Some(bin) = self.bin_of(angle) {
                self.counts[bin] += 1;
                self.total += 1;
            }
        }
    }

    /// Reset and fill from scratch.
    pub fn compute<'a, I>(&mut self, angles: I)
    where
        I: IntoIterator<Item = &'a f64>,
    {
        self.clear();
        self.fill(angles);
    }
}
