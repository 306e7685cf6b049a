//! Macenko stain vector estimation.
//!
//! Sampled OD pixels are projected onto the plane of their two principal
//! axes. The extreme stain directions are the `p`-th and `(100 - p)`-th
//! percentile angles in that plane, mapped back to OD space.

use crate::angle_histogram::AngleHistogram;
use crate::basis_transform::{BasisTransform, VectorDirection};
use crate::error::Result;
use crate::estimator::{draw_samples, finalize_stain_vectors, SamplingConfig, StainSortOrder};
use crate::macenko_histogram::{MacenkoHistogram, MACENKO_DEFAULT_BINS};
use crate::sampler::RandomPixelSampler;
use crate::stain_math::{StainMatrix, StainVector};
use crate::tiled_image::TiledImageSource;
use ndarray::{ArrayView2, Axis};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MacenkoConfig {
    pub sampling: SamplingConfig,
    pub histogram_bins: usize,
    /// Percentile in percent, clamped to `(0, 50]`.
    pub percentile: f64,
    pub sort_order: StainSortOrder,
    /// Fill the third stain with the cross product of the two found.
    pub complement_third: bool,
}

impl Default for MacenkoConfig {
    fn default() -> Self {
        Self {
            sampling: SamplingConfig::default(),
            histogram_bins: MACENKO_DEFAULT_BINS,
            percentile: 1.0,
            sort_order: StainSortOrder::Unsorted,
            complement_third: false,
        }
    }
}

pub fn estimate<S>(
    sampler: &mut RandomPixelSampler,
    source: &S,
    config: &MacenkoConfig,
) -> Result<StainMatrix>
where
    S: TiledImageSource + ?Sized,
{
    let samples = draw_samples(sampler, source, &config.sampling)?;
    let basis = BasisTransform::fit_pca(samples.view(), VectorDirection::RowVectors)?;
    let vectors = percentile_stain_vectors(
        &basis,
        samples.view(),
        config.histogram_bins,
        config.percentile,
    )?;
    Ok(finalize_stain_vectors(
        &vectors,
        config.sort_order,
        config.complement_third,
    ))
}

/// The two percentile directions of `samples` in the plane of `basis`, as
/// OD-space vectors (lower angle first).
///
/// Samples are projected without removing the mean, so angles are measured
/// around the OD origin. The histogram covers a full turn centered on the
/// mean direction of the projected cloud, which keeps a cloud that straddles
/// `±π` in one piece.
pub(crate) fn percentile_stain_vectors(
    basis: &BasisTransform,
    samples: ArrayView2<f64>,
    bins: usize,
    percentile: f64,
) -> Result<Vec<StainVector>> {
    let projected = basis.project(samples, false)?;
    let center = mean_direction(projected.view());
    let mut histogram = MacenkoHistogram::new(AngleHistogram::centered(bins, center)?);
    let thresholds = histogram.compute(projected.view(), percentile)?;
    let back = basis.back_project(thresholds.to_vectors().view(), false)?;
    Ok(back.rows().into_iter().map(|r| [r[0], r[1], r[2]]).collect())
}

/// Angle of the mean of 2-D points; `0` when the mean is at the origin.
pub(crate) fn mean_direction(points: ArrayView2<f64>) -> f64 {
    match points.mean_axis(Axis(0)) {
        Some(m) if m[0] != 0.0 || m[1] != 0.0 => m[1].atan2(m[0]),
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StainError;
    use crate::stain_math::{dot, normalize_vector};
    use crate::tiled_image::{InMemoryTiledImage, PixelLayout};
    use crate::optical_density::od_to_rgb;
    use image::{Rgb, RgbImage};
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const H: StainVector = [0.650, 0.704, 0.286];
    const E: StainVector = [0.072, 0.990, 0.105];

    /// Image mixing two stains with random concentrations, some pixels pure.
    fn two_stain_image(seed: u64) -> RgbImage {
        let mut rng = StdRng::seed_from_u64(seed);
        RgbImage::from_fn(96, 96, |_, _| {
            let kind: f64 = rng.gen();
            let (ch, ce) = if kind < 0.2 {
                (rng.gen_range(0.2..1.0), 0.0)
            } else if kind < 0.4 {
                (0.0, rng.gen_range(0.2..1.0))
            } else {
                (rng.gen_range(0.0..0.8), rng.gen_range(0.0..0.8))
            };
            let px = [0, 1, 2].map(|k| od_to_rgb(ch * H[k] + ce * E[k]));
            Rgb(px)
        })
    }

    #[test]
    fn recovers_two_known_stains() {
        let img = two_stain_image(17);
        let src = InMemoryTiledImage::from_rgb_image(&img, 32, 1, PixelLayout::Interleaved)
            .expect("pyramid");
        let config = MacenkoConfig {
            sampling: SamplingConfig {
                sample_size: 4000,
                seed: Some(3),
                ..SamplingConfig::default()
            },
            sort_order: StainSortOrder::RedDescending,
            ..MacenkoConfig::default()
        };
        let mut sampler = RandomPixelSampler::with_seed(3);
        let m = estimate(&mut sampler, &src, &config).expect("estimate");
        let h = normalize_vector(&H);
        let e = normalize_vector(&E);
        assert!(dot(&m[0], &h) > 0.99, "hematoxylin {:?}", m[0]);
        assert!(dot(&m[1], &e) > 0.99, "eosin {:?}", m[1]);
        assert_eq!(m[2], [0.0; 3]);
    }

    #[test]
    fn blank_image_has_too_few_samples() {
        let img = RgbImage::from_pixel(16, 16, Rgb([255, 255, 255]));
        let src = InMemoryTiledImage::from_rgb_image(&img, 8, 1, PixelLayout::Interleaved)
            .expect("pyramid");
        let mut sampler = RandomPixelSampler::with_seed(1);
        assert!(matches!(
            estimate(&mut sampler, &src, &MacenkoConfig::default()),
            Err(StainError::InsufficientSamples { .. })
        ));
    }

    #[test]
    fn mean_direction_of_points() {
        let pts = array![[1.0, 1.0], [1.0, 1.0]];
        assert!((mean_direction(pts.view()) - std::f64::consts::FRAC_PI_4).abs() < 1e-12);
        let origin = array![[1.0, 0.0], [-1.0, 0.0]];
        assert_eq!(mean_direction(origin.view()), 0.0);
    }
}
