//! Stain vectors from user-marked regions.
//!
//! Each stain gets a list of rectangles believed to contain only that stain.
//! The stain vector is the normalized mean OD of the non-background pixels
//! inside them.

use crate::error::{Result, StainError};
use crate::sampler::{PixelRegion, RandomPixelSampler, SampleRequest};
use crate::stain_math::{normalize_vector, stain_matrix_from_vectors, StainMatrix, StainVector};
use crate::tiled_image::TiledImageSource;
use ndarray::Axis;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PixelRoiConfig {
    pub level: usize,
    pub focus_plane: Option<usize>,
    pub band: Option<usize>,
    pub od_threshold: f64,
    /// Regions per stain, in stain order.
    pub regions: Vec<Vec<PixelRegion>>,
}

impl Default for PixelRoiConfig {
    fn default() -> Self {
        Self {
            level: 0,
            focus_plane: None,
            band: None,
            od_threshold: 0.15,
            regions: Vec::new(),
        }
    }
}

impl PixelRoiConfig {
    fn request(&self) -> SampleRequest {
        SampleRequest {
            level: self.level,
            focus_plane: self.focus_plane,
            band: self.band,
        }
    }
}

pub fn estimate<S>(
    sampler: &RandomPixelSampler,
    source: &S,
    config: &PixelRoiConfig,
) -> Result<StainMatrix>
where
    S: TiledImageSource + ?Sized,
{
    if config.regions.is_empty() {
        return Err(StainError::EmptyInput("pixel ROI regions"));
    }
    if config.regions.len() > 3 {
        return Err(StainError::InvalidParameter(format!(
            "at most 3 stains can be marked, got {}",
            config.regions.len()
        )));
    }

    let mut vectors = Vec::with_capacity(config.regions.len());
    for (stain, regions) in config.regions.iter().enumerate() {
        let mut sum = [0.0; 3];
        let mut count = 0usize;
        for &region in regions {
            let samples =
                sampler.region_samples(source, region, config.od_threshold, config.request())?;
            let total = samples.sum_axis(Axis(0));
            for k in 0..3 {
                sum[k] += total[k];
            }
            count += samples.nrows();
        }
        let vector: StainVector = if count == 0 {
            tracing::warn!(stain, "no stained pixels in marked regions");
            [0.0; 3]
        } else {
            normalize_vector(&sum.map(|s| s / count as f64))
        };
        tracing::debug!(stain, pixels = count, ?vector, "region stain vector");
        vectors.push(vector);
    }
    Ok(stain_matrix_from_vectors(&vectors))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optical_density::pixel_to_od;
    use crate::stain_math::dot;
    use crate::tiled_image::{InMemoryTiledImage, PixelLayout};
    use image::{Rgb, RgbImage};

    const HEM: [u8; 3] = [90, 80, 160];
    const EOS: [u8; 3] = [230, 60, 190];

    /// Left half hematoxylin, right half eosin, white strip at the bottom.
    fn split_image() -> InMemoryTiledImage {
        let img = RgbImage::from_fn(40, 30, |x, y| {
            if y >= 20 {
                Rgb([255, 255, 255])
            } else if x < 20 {
                Rgb(HEM)
            } else {
                Rgb(EOS)
            }
        });
        InMemoryTiledImage::from_rgb_image(&img, 16, 1, PixelLayout::Interleaved).expect("pyramid")
    }

    fn region(x: u32, y: u32, width: u32, height: u32) -> PixelRegion {
        PixelRegion {
            x,
            y,
            width,
            height,
        }
    }

    #[test]
    fn regions_give_their_stain_color() {
        let config = PixelRoiConfig {
            regions: vec![
                vec![region(2, 2, 10, 10), region(0, 18, 20, 12)],
                vec![region(25, 0, 15, 20)],
            ],
            ..PixelRoiConfig::default()
        };
        let m = estimate(&RandomPixelSampler::with_seed(0), &split_image(), &config)
            .expect("estimate");
        let hem = normalize_vector(&pixel_to_od(HEM));
        let eos = normalize_vector(&pixel_to_od(EOS));
        assert!(dot(&m[0], &hem) > 0.999999);
        assert!(dot(&m[1], &eos) > 0.999999);
        assert_eq!(m[2], [0.0; 3]);
    }

    #[test]
    fn background_only_region_gives_zero_vector() {
        let config = PixelRoiConfig {
            regions: vec![vec![region(0, 0, 10, 10)], vec![region(0, 22, 40, 8)]],
            ..PixelRoiConfig::default()
        };
        let m = estimate(&RandomPixelSampler::with_seed(0), &split_image(), &config)
            .expect("estimate");
        assert_eq!(m[1], [0.0; 3]);
        assert!(m[0].iter().any(|&x| x > 0.0));
    }

    #[test]
    fn empty_first_stain_keeps_its_slot_in_the_profile() {
        use crate::color_deconvolution::{ColorDeconvolution, DeconvolutionConfig};
        use crate::stain_profile::StainProfile;

        let config = PixelRoiConfig {
            regions: vec![vec![region(0, 22, 40, 8)], vec![region(25, 0, 15, 20)]],
            ..PixelRoiConfig::default()
        };
        let m = estimate(&RandomPixelSampler::with_seed(0), &split_image(), &config)
            .expect("estimate");
        assert_eq!(m[0], [0.0; 3]);

        let profile = StainProfile::from_matrix("roi", &m, "PixelROI");
        assert_eq!(profile.num_stains(), 2);
        assert_eq!(profile.stains[0].od, [0.0; 3]);
        assert!(dot(&profile.stains[1].od, &normalize_vector(&pixel_to_od(EOS))) > 0.999999);

        let dec = ColorDeconvolution::from_profile(&profile, DeconvolutionConfig::default())
            .expect("deconvolution");
        assert_eq!(dec.num_stains(), 2);
        let pixel = dec.separate_pixel(EOS);
        for k in 0..3 {
            assert!((pixel[1][k] as i32 - EOS[k] as i32).abs() <= 1, "{pixel:?}");
        }
    }

    #[test]
    fn too_many_or_no_stains_rejected() {
        let sampler = RandomPixelSampler::with_seed(0);
        let src = split_image();
        assert!(estimate(&sampler, &src, &PixelRoiConfig::default()).is_err());
        let config = PixelRoiConfig {
            regions: vec![vec![region(0, 0, 1, 1)]; 4],
            ..PixelRoiConfig::default()
        };
        assert!(estimate(&sampler, &src, &config).is_err());
    }
}
