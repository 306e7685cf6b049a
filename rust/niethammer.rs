//! Prior-guided stain vector estimation (Niethammer et al., 2010).
//!
//! Samples are projected onto a plane built from two prior stain vectors and
//! split into two clusters at a fixed reference angle. Each stain vector is
//! the mean direction of its cluster, blended toward its prior.

use crate::angle_histogram::{DEFAULT_BINS, DEFAULT_RANGE};
use crate::basis_transform::{BasisTransform, VectorDirection};
use crate::error::{Result, StainError};
use crate::estimator::{draw_samples, finalize_stain_vectors, SamplingConfig, StainSortOrder};
use crate::niethammer_histogram::{NiethammerHistogram, DEFAULT_THRESHOLD_FRACTION};
use crate::sampler::RandomPixelSampler;
use crate::stain_math::{
    is_zero_row, norm, normalize_array_rows, normalize_vector, StainMatrix, StainVector,
};
use crate::stain_profile::{EOSIN, HEMATOXYLIN};
use crate::tiled_image::TiledImageSource;
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NiethammerConfig {
    pub sampling: SamplingConfig,
    pub priors: [StainVector; 2],
    /// Weight of the prior in the final blend, in `[0, 1]`.
    pub prior_weight: f64,
    /// Reference threshold as a fraction of the angle range.
    pub threshold_fraction: f64,
    pub histogram_bins: usize,
    pub sort_order: StainSortOrder,
}

impl Default for NiethammerConfig {
    fn default() -> Self {
        Self {
            sampling: SamplingConfig::default(),
            priors: [HEMATOXYLIN, EOSIN],
            prior_weight: 0.15,
            threshold_fraction: DEFAULT_THRESHOLD_FRACTION,
            histogram_bins: DEFAULT_BINS,
            sort_order: StainSortOrder::Unsorted,
        }
    }
}

pub fn estimate<S>(
    sampler: &mut RandomPixelSampler,
    source: &S,
    config: &NiethammerConfig,
) -> Result<StainMatrix>
where
    S: TiledImageSource + ?Sized,
{
    if !(0.0..=1.0).contains(&config.prior_weight) {
        return Err(StainError::InvalidParameter(format!(
            "prior weight must be in [0, 1], got {}",
            config.prior_weight
        )));
    }
    let priors = config.priors.map(|p| normalize_vector(&p));
    let basis = prior_basis(&priors)?;
    let samples = draw_samples(sampler, source, &config.sampling)?;
    let projected = basis.project(samples.view(), false)?;

    let mut histogram = NiethammerHistogram::new(
        config.histogram_bins,
        DEFAULT_RANGE,
        config.threshold_fraction,
    )?;
    let assignment = histogram.assign_clusters(projected.view())?;

    let units = normalize_array_rows(&samples);
    let mut vectors = Vec::with_capacity(2);
    for (cluster, prior) in priors.iter().enumerate() {
        let members = assignment.members(cluster);
        let vector = match cluster_direction(units.view(), &members) {
            Some(direction) => blend(&direction, prior, config.prior_weight),
            None => {
                tracing::warn!(cluster, "empty cluster, falling back to prior");
                *prior
            }
        };
        vectors.push(vector);
    }
    Ok(finalize_stain_vectors(&vectors, config.sort_order, false))
}

/// Plane spanned by two unit priors, oriented so that the bisector of the
/// priors lies at `+π/2` and the two priors sit symmetrically on either side
/// of it: the first prior below, the second above.
pub(crate) fn prior_basis(priors: &[StainVector; 2]) -> Result<BasisTransform> {
    let [p1, p2] = priors;
    let diff = [p1[0] - p2[0], p1[1] - p2[1], p1[2] - p2[2]];
    let sum = [p1[0] + p2[0], p1[1] + p2[1], p1[2] + p2[2]];
    if is_zero_row(p1) || is_zero_row(p2) || norm(&diff) < 1e-9 || norm(&sum) < 1e-9 {
        return Err(StainError::InvalidParameter(
            "priors must be two distinct, non-opposite, non-zero vectors".to_string(),
        ));
    }
    let b1 = normalize_vector(&diff);
    let b2 = normalize_vector(&sum);
    let vectors = Array2::from_shape_vec((2, 3), b1.iter().chain(b2.iter()).copied().collect())?;
    BasisTransform::from_basis_vectors(vectors.view(), None, VectorDirection::RowVectors)
}

/// Direction of the mean of the unit rows listed in `members`, or `None` if
/// there are none.
fn cluster_direction(units: ArrayView2<f64>, members: &[usize]) -> Option<StainVector> {
    if members.is_empty() {
        return None;
    }
    let mut acc = [0.0; 3];
    for &i in members {
        let row = units.row(i);
        for k in 0..3 {
            acc[k] += row[k];
        }
    }
    let direction = normalize_vector(&acc);
    (!is_zero_row(&direction)).then_some(direction)
}

fn blend(direction: &StainVector, prior: &StainVector, weight: f64) -> StainVector {
    let mixed = [0, 1, 2].map(|k| (1.0 - weight) * direction[k] + weight * prior[k]);
    normalize_vector(&mixed)
}
