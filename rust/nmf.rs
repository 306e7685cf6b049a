//! Stain vectors by non-negative matrix factorization.
//!
//! The `N × 3` OD sample matrix is factored as `V ≈ W · H` with `W` (`N × k`)
//! the per-pixel concentrations and `H` (`k × 3`) the stain vectors, using
//! Lee–Seung multiplicative updates.

use crate::error::{Result, StainError};
use crate::estimator::{draw_samples, finalize_stain_vectors, SamplingConfig, StainSortOrder};
use crate::sampler::RandomPixelSampler;
use crate::stain_math::{normalize_vector, StainMatrix, StainVector};
use crate::tiled_image::TiledImageSource;
use ndarray::{Array2, ArrayView2};
use rand::Rng;
use serde::{Deserialize, Serialize};

const EPSILON: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NmfConfig {
    pub sampling: SamplingConfig,
    pub num_stains: usize,
    pub max_iterations: usize,
    /// Stop once the relative reconstruction error changes by less than this.
    pub tolerance: f64,
    /// Starting stain vectors; random when absent.
    pub priors: Option<Vec<StainVector>>,
    pub sort_order: StainSortOrder,
}

impl Default for NmfConfig {
    fn default() -> Self {
        Self {
            sampling: SamplingConfig::default(),
            num_stains: 2,
            max_iterations: 200,
            tolerance: 1e-5,
            priors: None,
            sort_order: StainSortOrder::Unsorted,
        }
    }
}

/// Result of a factorization run.
#[derive(Debug, Clone)]
pub struct Factorization {
    pub w: Array2<f64>,
    pub h: Array2<f64>,
    pub iterations: usize,
    pub relative_error: f64,
}

pub fn estimate<S>(
    sampler: &mut RandomPixelSampler,
    source: &S,
    config: &NmfConfig,
) -> Result<StainMatrix>
where
    S: TiledImageSource + ?Sized,
{
    let k = config.num_stains;
    if !(1..=3).contains(&k) {
        return Err(StainError::InvalidParameter(format!(
            "NMF needs 1 to 3 stains, got {k}"
        )));
    }
    let samples = draw_samples(sampler, source, &config.sampling)?;
    let h0 = match &config.priors {
        Some(priors) => {
            if priors.len() != k {
                return Err(StainError::InvalidParameter(format!(
                    "{} priors given for {k} stains",
                    priors.len()
                )));
            }
            let flat: Vec<f64> = priors
                .iter()
                .flat_map(|p| normalize_vector(p).map(|x| x.abs().max(EPSILON)))
                .collect();
            Array2::from_shape_vec((k, 3), flat)?
        }
        None => random_positive(sampler.rng_mut(), (k, 3), 1.0),
    };
    let scale = samples.mean().unwrap_or(1.0).max(EPSILON);
    let w0 = random_positive(sampler.rng_mut(), (samples.nrows(), k), scale);

    let result = factorize(
        samples.view(),
        w0,
        h0,
        config.max_iterations,
        config.tolerance,
    )?;
    tracing::debug!(
        iterations = result.iterations,
        relative_error = result.relative_error,
        "nmf converged"
    );

    let vectors: Vec<StainVector> = result
        .h
        .rows()
        .into_iter()
        .map(|r| [r[0], r[1], r[2]])
        .collect();
    Ok(finalize_stain_vectors(&vectors, config.sort_order, false))
}

fn random_positive<R: Rng>(rng: &mut R, shape: (usize, usize), scale: f64) -> Array2<f64> {
    Array2::from_shape_fn(shape, |_| rng.gen_range(0.1..1.0) * scale)
}

/// Multiplicative-update NMF from the starting factors `w` and `h`.
pub fn factorize(
    v: ArrayView2<f64>,
    mut w: Array2<f64>,
    mut h: Array2<f64>,
    max_iterations: usize,
    tolerance: f64,
) -> Result<Factorization> {
    if v.iter().any(|&x| x < 0.0 || !x.is_finite()) {
        return Err(StainError::InvalidParameter(
            "NMF input must be finite and non-negative".to_string(),
        ));
    }
    if w.nrows() != v.nrows() || h.ncols() != v.ncols() || w.ncols() != h.nrows() {
        return Err(StainError::DimensionMismatch(format!(
            "V {:?} cannot be factored as W {:?} x H {:?}",
            v.shape(),
            w.shape(),
            h.shape()
        )));
    }
    let v_norm = v.iter().map(|x| x * x).sum::<f64>().sqrt().max(EPSILON);
    let mut previous = f64::INFINITY;
    let mut relative_error = previous;
    let mut iterations = 0;

    while iterations < max_iterations {
        iterations += 1;

        let numerator = w.t().dot(&v);
        let denominator = w.t().dot(&w).dot(&h);
        h.zip_mut_with(&(numerator / (denominator + EPSILON)), |x, &r| *x *= r);

        let numerator = v.dot(&h.t());
        let denominator = w.dot(&h.dot(&h.t()));
        w.zip_mut_with(&(numerator / (denominator + EPSILON)), |x, &r| *x *= r);

        let residual = &v - &w.dot(&h);
        relative_error = residual.iter().map(|x| x * x).sum::<f64>().sqrt() / v_norm;
        if (previous - relative_error).abs() < tolerance {
            break;
        }
        previous = relative_error;
    }

    Ok(Factorization {
        w,
        h,
        iterations,
        relative_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optical_density::od_to_rgb;
    use crate::stain_math::dot;
    use crate::tiled_image::{InMemoryTiledImage, PixelLayout};
    use image::{Rgb, RgbImage};
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn exact_low_rank_matrix_is_reconstructed() {
        let h_true = array![[0.65, 0.70, 0.29], [0.07, 0.99, 0.11]];
        let mut rng = StdRng::seed_from_u64(5);
        let w_true = Array2::from_shape_fn((60, 2), |_| rng.gen_range(0.0..1.0));
        let v = w_true.dot(&h_true);
        let w0 = random_positive(&mut rng, (60, 2), 0.5);
        let h0 = random_positive(&mut rng, (2, 3), 1.0);
        let f = factorize(v.view(), w0, h0, 2000, 1e-12).expect("factorize");
        assert!(f.relative_error < 0.05, "error {}", f.relative_error);
        assert!(f.h.iter().all(|&x| x >= 0.0));
        assert!(f.w.iter().all(|&x| x >= 0.0));
    }

    #[test]
    fn negative_input_is_rejected() {
        let v = array![[1.0, -1.0, 0.0]];
        let r = factorize(v.view(), array![[1.0]], array![[1.0, 1.0, 1.0]], 10, 1e-6);
        assert!(r.is_err());
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let v = array![[1.0, 1.0, 0.0]];
        let r = factorize(v.view(), array![[1.0, 1.0]], array![[1.0, 1.0, 1.0]], 10, 1e-6);
        assert!(matches!(r, Err(StainError::DimensionMismatch(_))));
    }

    #[test]
    fn priors_seed_the_stains_on_a_two_stain_image() {
        let hem = normalize_vector(&[0.65, 0.70, 0.29]);
        let eos = normalize_vector(&[0.07, 0.99, 0.11]);
        let mut rng = StdRng::seed_from_u64(31);
        let img = RgbImage::from_fn(64, 64, |_, _| {
            let a: f64 = rng.gen_range(0.0..1.0);
            let b: f64 = rng.gen_range(0.0..1.0);
            let (a, b) = if a > b { (a, 0.1 * b) } else { (0.1 * a, b) };
            Rgb([0, 1, 2].map(|k| od_to_rgb(a * hem[k] + b * eos[k])))
        });
        let src = InMemoryTiledImage::from_rgb_image(&img, 32, 1, PixelLayout::Interleaved)
            .expect("pyramid");
        let config = NmfConfig {
            sampling: SamplingConfig {
                sample_size: 2000,
                ..SamplingConfig::default()
            },
            priors: Some(vec![[0.6, 0.75, 0.3], [0.1, 0.95, 0.15]]),
            max_iterations: 500,
            tolerance: 1e-9,
            ..NmfConfig::default()
        };
        let m = estimate(&mut RandomPixelSampler::with_seed(6), &src, &config).expect("estimate");
        assert!(dot(&m[0], &hem) > 0.98, "{:?}", m[0]);
        assert!(dot(&m[1], &eos) > 0.98, "{:?}", m[1]);
        assert_eq!(m[2], [0.0; 3]);
    }

    #[test]
    fn stain_count_is_validated() {
        let img = RgbImage::from_pixel(8, 8, Rgb([100, 50, 120]));
        let src = InMemoryTiledImage::from_rgb_image(&img, 8, 1, PixelLayout::Interleaved)
            .expect("pyramid");
        let config = NmfConfig {
            num_stains: 4,
            ..NmfConfig::default()
        };
        assert!(estimate(&mut RandomPixelSampler::with_seed(0), &src, &config).is_err());
    }
}
