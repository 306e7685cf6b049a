//! Macenko thresholding on the singular-vector plane of the raw OD matrix.
//!
//! Same as [`crate::macenko`] except that the basis comes from the
//! uncentered second moments, so the first axis follows the mean OD
//! direction rather than the direction of largest spread.

use crate::basis_transform::{BasisTransform, VectorDirection};
use crate::error::Result;
use crate::estimator::{draw_samples, finalize_stain_vectors};
use crate::macenko::{percentile_stain_vectors, MacenkoConfig};
use crate::sampler::RandomPixelSampler;
use crate::stain_math::StainMatrix;
use crate::tiled_image::TiledImageSource;

/// The SVD variant takes exactly the Macenko parameters.
pub type SvdConfig = MacenkoConfig;

pub fn estimate<S>(
    sampler: &mut RandomPixelSampler,
    source: &S,
    config: &SvdConfig,
) -> Result<StainMatrix>
where
    S: TiledImageSource + ?Sized,
{
    let samples = draw_samples(sampler, source, &config.sampling)?;
    let basis = BasisTransform::fit_uncentered(samples.view(), VectorDirection::RowVectors)?;
    tracing::debug!(
        singular_values = ?basis.eigenvalues().mapv(f64::sqrt),
        "uncentered basis"
    );
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimator::{SamplingConfig, StainSortOrder};
    use crate::optical_density::od_to_rgb;
    use crate::stain_math::{dot, normalize_vector};
    use crate::tiled_image::{InMemoryTiledImage, PixelLayout};
    use image::{Rgb, RgbImage};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn recovers_hematoxylin_and_dab() {
        let hem = [0.650, 0.704, 0.286];
        let dab = [0.268, 0.570, 0.776];
        let mut rng = StdRng::seed_from_u64(8);
        let img = RgbImage::from_fn(80, 80, |_, _| {
            let (a, b) = match rng.gen_range(0..4) {
                0 => (rng.gen_range(0.3..1.0), 0.0),
                1 => (0.0, rng.gen_range(0.3..1.0)),
                _ => (rng.gen_range(0.0..0.7), rng.gen_range(0.0..0.7)),
            };
            Rgb([0, 1, 2].map(|k| od_to_rgb(a * hem[k] + b * dab[k])))
        });
        let src = InMemoryTiledImage::from_rgb_image(&img, 40, 1, PixelLayout::Planar)
            .expect("pyramid");
        let config = SvdConfig {
            sampling: SamplingConfig {
                sample_size: 3000,
                ..SamplingConfig::default()
            },
            sort_order: StainSortOrder::RedDescending,
            ..SvdConfig::default()
        };
        let m = estimate(&mut RandomPixelSampler::with_seed(2), &src, &config).expect("estimate");
        assert!(dot(&m[0], &normalize_vector(&hem)) > 0.99, "{:?}", m[0]);
        assert!(dot(&m[1], &normalize_vector(&dab)) > 0.99, "{:?}", m[1]);
    }
}
