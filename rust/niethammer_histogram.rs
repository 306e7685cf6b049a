//! Two-cluster angular assignment against a fixed threshold angle
//! (Niethammer et al., 2010).
//!
//! Only the single fixed-threshold pass is implemented: points are split once
//! at the reference angle and the threshold is not re-estimated from the
//! resulting clusters.

use crate::angle_histogram::{is_undefined, vectors_to_angles, AngleHistogram, DEFAULT_RANGE};
use crate::error::{Result, StainError};
use ndarray::{Array1, ArrayView2};

/// Default threshold position as a fraction of the histogram range.
/// Over `[-π, π)` this is `+π/2`.
pub const DEFAULT_THRESHOLD_FRACTION: f64 = 0.75;

/// Result of one clustering pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterAssignment {
    /// Cluster per input point: `Some(0)` below the threshold, `Some(1)` at
    /// or above it, `None` for points without a defined angle.
    pub labels: Vec<Option<usize>>,
    pub angles: Array1<f64>,
    pub threshold: f64,
}

impl ClusterAssignment {
    pub fn cluster_size(&self, cluster: usize) -> usize {
        self.labels.iter().filter(|&&l| l == Some(cluster)).count()
    }

    /// Indices of the points in `cluster`.
    pub fn members(&self, cluster: usize) -> Vec<usize> {
        self.labels
            .iter()
            .enumerate()
            .filter(|(_, l)| **l == Some(cluster))
            .map(|(i, _)| i)
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct NiethammerHistogram {
    histogram: AngleHistogram,
    threshold_fraction: f64,
}

impl Default for NiethammerHistogram {
    fn default() -> Self {
        Self {
            histogram: AngleHistogram::default(),
            threshold_fraction: DEFAULT_THRESHOLD_FRACTION,
        }
    }
}

impl NiethammerHistogram {
    pub fn new(bins: usize, range: (f64, f64), threshold_fraction: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&threshold_fraction) {
            return Err(StainError::InvalidParameter(format!(
                "threshold fraction must be in [0, 1], got {threshold_fraction}"
            )));
        }
        Ok(Self {
            histogram: AngleHistogram::new(bins, range)?,
            threshold_fraction,
        })
    }

    pub fn with_bins(bins: usize) -> Result<Self> {
        Self::new(bins, DEFAULT_RANGE, DEFAULT_THRESHOLD_FRACTION)
    }

    pub fn histogram(&self) -> &AngleHistogram {
        &self.histogram
    }

    /// Reference threshold angle: `threshold_fraction` of the way around the
    /// histogram range.
    pub fn reference_threshold(&self) -> f64 {
        let position = self.threshold_fraction * self.histogram.bins() as f64;
        self.histogram.bin_to_angle(position)
    }

    /// Split the angles of `points` (`N × 2`) at the reference threshold.
    ///
    /// Also refreshes the histogram counts, which callers can inspect to see
    /// how the cloud is distributed around the threshold.
    pub fn assign_clusters(&mut self, points: ArrayView2<f64>) -> Result<ClusterAssignment> {
        let angles = vectors_to_angles(points)?;
        self.histogram.compute(angles.iter());
        let threshold = self.reference_threshold();
        let labels = angles
            .iter()
            .map(|&a| {
                if is_undefined(a) {
                    return None;
                }
                let a = self.histogram.wrap(a)?;
                Some(usize::from(a >= threshold))
            })
            .collect();
        let assignment = ClusterAssignment {
            labels,
            angles,
            threshold,
        };
        tracing::debug!(
            threshold,
            first = assignment.cluster_size(0),
            second = assignment.cluster_size(1),
            "niethammer cluster assignment"
        );
        Ok(assignment)
    }
}
