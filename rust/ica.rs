//! Stain vectors by independent component analysis.
//!
//! Samples are centered and whitened in their PCA plane, then symmetric
//! FastICA with the log-cosh contrast finds two independent directions. The
//! corresponding mixing directions, unwhitened and mapped back through the
//! PCA basis, are the stain vectors.

use crate::basis_transform::{BasisTransform, VectorDirection};
use crate::error::{Result, StainError};
use crate::estimator::{draw_samples, finalize_stain_vectors, SamplingConfig, StainSortOrder};
use crate::sampler::RandomPixelSampler;
use crate::stain_math::{StainMatrix, StainVector};
use crate::tiled_image::TiledImageSource;
use nalgebra::{Matrix2, SymmetricEigen};
use ndarray::{Array2, ArrayView2};
use rand::Rng;
use serde::{Deserialize, Serialize};

const MIN_VARIANCE: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IcaConfig {
    pub sampling: SamplingConfig,
    pub max_iterations: usize,
    pub tolerance: f64,
    pub sort_order: StainSortOrder,
}

impl Default for IcaConfig {
    fn default() -> Self {
        Self {
            sampling: SamplingConfig::default(),
            max_iterations: 200,
            tolerance: 1e-6,
            sort_order: StainSortOrder::Unsorted,
        }
    }
}

pub fn estimate<S>(
    sampler: &mut RandomPixelSampler,
    source: &S,
    config: &IcaConfig,
) -> Result<StainMatrix>
where
    S: TiledImageSource + ?Sized,
{
    let samples = draw_samples(sampler, source, &config.sampling)?;
    let basis = BasisTransform::fit_pca(samples.view(), VectorDirection::RowVectors)?;
    let scales = [basis.eigenvalues()[0].sqrt(), basis.eigenvalues()[1].sqrt()];
    if scales.iter().any(|s| !(s * s > MIN_VARIANCE)) {
        return Err(StainError::DegenerateBasis);
    }

    let mut whitened = basis.project(samples.view(), true)?;
    for mut row in whitened.rows_mut() {
        row[0] /= scales[0];
        row[1] /= scales[1];
    }

    let theta: f64 = sampler.rng_mut().gen_range(0.0..std::f64::consts::PI);
    let initial = Matrix2::new(theta.cos(), -theta.sin(), theta.sin(), theta.cos());
    let (unmixing, iterations) =
        fast_ica(whitened.view(), initial, config.max_iterations, config.tolerance);
    tracing::debug!(iterations, "fast ica finished");

    // The unmixing matrix is orthogonal, so its rows are the mixing columns.
    let mut mixing = Array2::zeros((2, 2));
    for j in 0..2 {
        mixing[[j, 0]] = unmixing[(j, 0)] * scales[0];
        mixing[[j, 1]] = unmixing[(j, 1)] * scales[1];
    }
    let back = basis.back_project(mixing.view(), false)?;
    let vectors: Vec<StainVector> = back
        .rows()
        .into_iter()
        .map(|r| [r[0], r[1], r[2]])
        .collect();
    Ok(finalize_stain_vectors(&vectors, config.sort_order, false))
}

/// Symmetric FastICA on whitened `N × 2` data. Returns the unmixing matrix
/// (one component per row) and the iteration count.
pub fn fast_ica(
    data: ArrayView2<f64>,
    initial: Matrix2<f64>,
    max_iterations: usize,
    tolerance: f64,
) -> (Matrix2<f64>, usize) {
    let n = data.nrows().max(1) as f64;
    let mut w = symmetric_decorrelation(&initial);
    let mut iterations = 0;
    while iterations < max_iterations {
        iterations += 1;
        let mut g_x = Matrix2::<f64>::zeros();
        let mut g_prime = [0.0f64; 2];
        for row in data.rows() {
            let x = [row[0], row[1]];
            for i in 0..2 {
                let y = w[(i, 0)] * x[0] + w[(i, 1)] * x[1];
                let g = y.tanh();
                g_x[(i, 0)] += g * x[0];
                g_x[(i, 1)] += g * x[1];
                g_prime[i] += 1.0 - g * g;
            }
        }
        let mut next = g_x / n;
        for i in 0..2 {
            let d = g_prime[i] / n;
            next[(i, 0)] -= d * w[(i, 0)];
            next[(i, 1)] -= d * w[(i, 1)];
        }
        let next = symmetric_decorrelation(&next);

        let change = (next * w.transpose())
            .diagonal()
            .iter()
            .map(|v| (v.abs() - 1.0).abs())
            .fold(0.0, f64::max);
        w = next;
        if change < tolerance {
            break;
        }
    }
    (w, iterations)
}

/// `(W Wᵀ)^{-1/2} W`, which makes the rows of `W` orthonormal.
fn symmetric_decorrelation(w: &Matrix2<f64>) -> Matrix2<f64> {
    let eigen = SymmetricEigen::new(w * w.transpose());
    let inv_sqrt = eigen.eigenvalues.map(|l| 1.0 / l.max(MIN_VARIANCE).sqrt());
    let s = eigen.eigenvectors * Matrix2::from_diagonal(&inv_sqrt) * eigen.eigenvectors.transpose();
    s * w
}
