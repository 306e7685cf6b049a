use crate::error::{Result, StainError};
use crate::float_trait::StainFloat;
use crate::optical_density::{od_image, od_to_pixel, OdLookupTable, RGB_MAX};
use crate::stain_math::{
    fill_empty_rows, invert_3x3, multiply_vector_matrix, StainMatrix,
};
use crate::stain_profile::StainProfile;
use crate::tiled_image::Tile;
use image::{Rgb, RgbImage, RgbaImage};
use ndarray::{Array3, ArrayView3};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// How separated stains are rendered.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeconvolutionConfig {
    /// Pixels whose summed stain OD is not above this are blacked out.
    /// `None` disables thresholding.
    pub threshold: Option<f64>,
    /// Stain returned by [`ColorDeconvolution::display`].
    pub display_stain: usize,
}

/// Per-pixel stain separation with a fixed stain matrix.
///
/// Rows of the matrix are stain OD vectors. Only the first `num_stains` rows
/// are declared. Zero rows are filled with unit vectors before inversion
/// (see [`fill_empty_rows`]). Undeclared slots render black.
#[derive(Debug, Clone)]
pub struct ColorDeconvolution {
    stains: StainMatrix,
    inverse: StainMatrix,
    num_stains: usize,
    config: DeconvolutionConfig,
    lut: OdLookupTable,
}

impl ColorDeconvolution {
    pub fn new(stains: StainMatrix, num_stains: usize, config: DeconvolutionConfig) -> Result<Self> {
        if !(1..=3).contains(&num_stains) {
            return Err(StainError::InvalidParameter(format!(
                "deconvolution needs 1 to 3 stains, got {num_stains}"
            )));
        }
        let mut declared = stains;
        for row in declared.iter_mut().skip(num_stains) {
            *row = [0.0; 3];
        }
        let inverse = invert_3x3(&fill_empty_rows(&declared));
        if inverse.iter().flatten().all(|&x| x == 0.0) {
            tracing::warn!(?declared, "stain matrix is singular, concentrations will be zero");
        }
        Ok(Self {
            stains: declared,
            inverse,
            num_stains,
            config,
            lut: OdLookupTable::new(),
        })
    }

    pub fn from_profile(profile: &StainProfile, config: DeconvolutionConfig) -> Result<Self> {
        profile.validate()?;
        Self::new(profile.stain_matrix(), profile.num_stains(), config)
    }

    pub fn num_stains(&self) -> usize {
        self.num_stains
    }

    pub fn config(&self) -> &DeconvolutionConfig {
        &self.config
    }

    pub fn stains(&self) -> &StainMatrix {
        &self.stains
    }

    /// Non-negative stain saturations of one pixel.
    pub fn saturations(&self, rgb: [u8; 3]) -> [f64; 3] {
        let od = self.lut.pixel_to_od(rgb);
        multiply_vector_matrix(&od, &self.inverse).map(|s| s.max(0.0))
    }

    /// Colors of one pixel rendered in each of the three stain channels.
    pub fn separate_pixel(&self, rgb: [u8; 3]) -> [[u8; 3]; 3] {
        let saturations = self.saturations(rgb);
        let mut out = [[0u8; 3]; 3];
        for (stain, pixel) in out.iter_mut().enumerate().take(self.num_stains) {
            let od = self.stains[stain].map(|v| v * saturations[stain]);
            if self.passes(od[0] + od[1] + od[2]) {
                *pixel = od_to_pixel(od);
            }
        }
        out
    }

    fn passes(&self, od_sum: f64) -> bool {
        self.config.threshold.map_or(true, |t| od_sum > t)
    }

    /// Split `image` into one opaque RGBA image per stain slot.
    ///
    /// With a single declared stain no inversion takes place; see
    /// [`Self::threshold_only`].
    pub fn separate(&self, image: &RgbImage) -> Result<Vec<RgbaImage>> {
        if self.num_stains == 1 {
            return Ok(vec![self.threshold_only(image)?]);
        }
        let (width, height) = image.dimensions();
        let pixels: Vec<[[u8; 3]; 3]> = image
            .as_raw()
            .par_chunks_exact(3)
            .map(|p| self.separate_pixel([p[0], p[1], p[2]]))
            .collect();
        tracing::debug!(width, height, threshold = ?self.config.threshold, "separated stains");
        (0..3)
            .map(|stain| {
                let raw: Vec<u8> = pixels
                    .iter()
                    .flat_map(|p| {
                        let c = p[stain];
                        [c[0], c[1], c[2], u8::MAX]
                    })
                    .collect();
                opaque_image(width, height, raw)
            })
            .collect()
    }

    /// Keep pixels whose OD sum is above the threshold, black out the rest.
    pub fn threshold_only(&self, image: &RgbImage) -> Result<RgbaImage> {
        let (width, height) = image.dimensions();
        let raw: Vec<u8> = image
            .as_raw()
            .par_chunks_exact(3)
            .flat_map_iter(|p| {
                let od = self.lut.pixel_to_od([p[0], p[1], p[2]]);
                let rgb = if self.passes(od[0] + od[1] + od[2]) {
                    [p[0], p[1], p[2]]
                } else {
                    [0, 0, 0]
                };
                [rgb[0], rgb[1], rgb[2], u8::MAX]
            })
            .collect();
        opaque_image(width, height, raw)
    }

    /// The configured display stain, or `image` itself when the selector does
    /// not name a produced channel.
    pub fn display(&self, image: &RgbImage) -> Result<RgbaImage> {
        let mut channels = self.separate(image)?;
        let selector = self.config.display_stain;
        if selector < channels.len() {
            Ok(channels.swap_remove(selector))
        } else {
            tracing::warn!(selector, "invalid display stain, returning source image");
            let raw = image
                .pixels()
                .flat_map(|Rgb(p)| [p[0], p[1], p[2], u8::MAX])
                .collect();
            opaque_image(image.width(), image.height(), raw)
        }
    }

    pub fn separate_tile(&self, tile: &Tile) -> Result<Vec<RgbaImage>> {
        let image = RgbImage::from_fn(tile.width(), tile.height(), |x, y| Rgb(tile.rgb_at(x, y)));
        self.separate(&image)
    }
}

fn opaque_image(width: u32, height: u32, raw: Vec<u8>) -> Result<RgbaImage> {
    RgbaImage::from_raw(width, height, raw).ok_or_else(|| {
        StainError::DimensionMismatch(format!("buffer does not fit a {width}x{height} image"))
    })
}

/// Per-pixel stain concentrations of an OD image.
///
/// `im_od` has shape `(H, W, 3)`; `stain_matrix` holds one stain per row.
/// Zero rows are filled with unit vectors before inversion. Channel `i` of
/// the result is the concentration of stain `i` (not clamped).
pub fn concentrations<F: StainFloat>(
    im_od: ArrayView3<F>,
    stain_matrix: &StainMatrix,
) -> Result<Array3<F>> {
    let (h, w, c) = im_od.dim();
    if c != 3 {
        return Err(StainError::DimensionMismatch(format!(
            "image must have 3 channels, got {c}"
        )));
    }
    let inverse = invert_3x3(&fill_empty_rows(stain_matrix));
    let od_flat = im_od.to_shape((h * w, 3))?;

    let mut data = vec![F::zero(); h * w * 3];
    data.par_chunks_mut(3).enumerate().for_each(|(i, out)| {
        let od = [
            od_flat[[i, 0]].as_f64(),
            od_flat[[i, 1]].as_f64(),
            od_flat[[i, 2]].as_f64(),
        ];
        let conc = multiply_vector_matrix(&od, &inverse);
        for k in 0..3 {
            out[k] = F::cast(conc[k]);
        }
    });
    Ok(Array3::from_shape_vec((h, w, 3), data)?)
}

/// Intensities `(H, W, 3)` in `[0, 255]` to stain concentrations.
pub fn rgb_concentrations<F: StainFloat>(
    im_rgb: ArrayView3<F>,
    stain_matrix: &StainMatrix,
) -> Result<Array3<F>> {
    concentrations(od_image(im_rgb).view(), stain_matrix)
}

/// Rebuild intensities from concentrations: `OD = C · S`, then
/// `I = 255 · 10^(-OD)` clamped to `[0, 255]`.
pub fn reconstruct_rgb<F: StainFloat>(
    concentrations: ArrayView3<F>,
    stain_matrix: &StainMatrix,
) -> Result<Array3<F>> {
    let (h, w, c) = concentrations.dim();
    if c != 3 {
        return Err(StainError::DimensionMismatch(format!(
            "concentrations must have 3 channels, got {c}"
        )));
    }
    let conc_flat = concentrations.to_shape((h * w, 3))?;

    let mut data = vec![F::zero(); h * w * 3];
    data.par_chunks_mut(3).enumerate().for_each(|(i, out)| {
        let conc = [
            conc_flat[[i, 0]].as_f64(),
            conc_flat[[i, 1]].as_f64(),
            conc_flat[[i, 2]].as_f64(),
        ];
        let od = multiply_vector_matrix(&conc, stain_matrix);
        for k in 0..3 {
            out[k] = F::cast((RGB_MAX * 10f64.powf(-od[k])).clamp(0.0, RGB_MAX));
        }
    });
    Ok(Array3::from_shape_vec((h, w, 3), data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optical_density::{od_to_rgb, pixel_to_od};
    use crate::stain_profile::{DAB, EOSIN, HEMATOXYLIN};
    use approx::assert_abs_diff_eq;
    use image::Rgba;
    use ndarray::Array3;

    fn two_stain(threshold: Option<f64>) -> ColorDeconvolution {
        let stains = [[0.650, 0.704, 0.286], [0.268, 0.570, 0.776], [0.0; 3]];
        ColorDeconvolution::new(
            stains,
            2,
            DeconvolutionConfig {
                threshold,
                display_stain: 0,
            },
        )
        .expect("deconvolution")
    }

    #[test]
    fn white_pixel_has_no_stain() {
        let dec = two_stain(None);
        let sat = dec.saturations([255, 255, 255]);
        assert!(sat.iter().all(|s| s.abs() < 1e-5), "{sat:?}");
        let white = RgbImage::from_pixel(1, 1, Rgb([255, 255, 255]));
        let out = dec.separate(&white).expect("separate");
        assert_eq!(out.len(), 3);
        for img in &out[..2] {
            assert_eq!(*img.get_pixel(0, 0), Rgba([255, 255, 255, 255]));
        }
        // The undeclared third slot is black even without a threshold.
        assert_eq!(*out[2].get_pixel(0, 0), Rgba([0, 0, 0, 255]));
        assert_eq!(dec.separate_pixel([90, 60, 150])[2], [0, 0, 0]);
    }

    #[test]
    fn tile_separates_like_the_equivalent_image() {
        use crate::tiled_image::{InMemoryTiledImage, PixelLayout, TileRequest, TiledImageSource};

        let img = RgbImage::from_fn(6, 4, |x, _| {
            let od = HEMATOXYLIN.map(|v| v * (0.1 + 0.1 * x as f64));
            Rgb(od.map(od_to_rgb))
        });
        let dec = two_stain(Some(0.05));
        for layout in [PixelLayout::Interleaved, PixelLayout::Planar] {
            let source = InMemoryTiledImage::from_rgb_image(&img, 8, 1, layout).expect("pyramid");
            let tile = source
                .tile(TileRequest {
                    level: 0,
                    index: 0,
                    focus_plane: 0,
                    band: 0,
                })
                .expect("tile");
            let from_tile = dec.separate_tile(&tile).expect("tile channels");
            let from_image = dec.separate(&img).expect("image channels");
            assert_eq!(from_tile, from_image);
        }
    }

    #[test]
    fn pure_stain_pixel_lands_in_its_channel() {
        let dec = two_stain(Some(0.1));
        let od = HEMATOXYLIN.map(|v| v * 0.8);
        let rgb = od.map(od_to_rgb);
        let sat = dec.saturations(rgb);
        assert_abs_diff_eq!(sat[0], 0.8, epsilon = 0.02);
        assert!(sat[1] < 0.02, "{sat:?}");

        let out = dec.separate_pixel(rgb);
        for k in 0..3 {
            assert!((out[0][k] as i32 - rgb[k] as i32).abs() <= 4, "{out:?}");
        }
        assert_eq!(out[1], [0, 0, 0]);
    }

    #[test]
    fn threshold_blacks_out_background() {
        let dec = two_stain(Some(0.15));
        let out = dec.separate_pixel([250, 250, 250]);
        assert_eq!(out[0], [0, 0, 0]);
        assert_eq!(out[1], [0, 0, 0]);
    }

    #[test]
    fn single_stain_only_thresholds() {
        let dec = ColorDeconvolution::new(
            [DAB, [0.0; 3], [0.0; 3]],
            1,
            DeconvolutionConfig {
                threshold: Some(0.3),
                display_stain: 0,
            },
        )
        .expect("deconvolution");
        let img = RgbImage::from_fn(2, 1, |x, _| {
            if x == 0 {
                Rgb([120, 80, 40])
            } else {
                Rgb([240, 240, 240])
            }
        });
        let out = dec.separate(&img).expect("separate");
        assert_eq!(out.len(), 1);
        assert_eq!(*out[0].get_pixel(0, 0), Rgba([120, 80, 40, 255]));
        assert_eq!(*out[0].get_pixel(1, 0), Rgba([0, 0, 0, 255]));
    }

    #[test]
    fn invalid_display_selector_returns_source() {
        let profile = StainProfile::hematoxylin_eosin();
        let dec = ColorDeconvolution::from_profile(
            &profile,
            DeconvolutionConfig {
                threshold: None,
                display_stain: 7,
            },
        )
        .expect("deconvolution");
        let img = RgbImage::from_pixel(3, 2, Rgb([10, 20, 30]));
        let shown = dec.display(&img).expect("display");
        assert_eq!(*shown.get_pixel(2, 1), Rgba([10, 20, 30, 255]));
    }

    #[test]
    fn array_concentrations_reconstruct_the_image() {
        let stains = [HEMATOXYLIN, EOSIN, DAB];
        let mut rgb = Array3::<f64>::zeros((2, 2, 3));
        let pixels = [[200, 120, 180], [90, 60, 150], [255, 255, 255], [30, 90, 60]];
        for (i, p) in pixels.iter().enumerate() {
            for k in 0..3 {
                rgb[[i / 2, i % 2, k]] = p[k] as f64;
            }
        }
        let conc = rgb_concentrations(rgb.view(), &stains).expect("concentrations");
        let back = reconstruct_rgb(conc.view(), &stains).expect("reconstruct");
        // Full white comes back at 255 * 10^-OD_MIN.
        for (a, b) in back.iter().zip(rgb.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-3);
        }
        let od = pixel_to_od([90, 60, 150]);
        assert_abs_diff_eq!(
            conc[[0, 1, 0]] * HEMATOXYLIN[0] + conc[[0, 1, 1]] * EOSIN[0] + conc[[0, 1, 2]] * DAB[0],
            od[0],
            epsilon = 1e-9
        );
    }

    #[test]
    fn wrong_channel_count_rejected() {
        let im = Array3::<f32>::zeros((2, 2, 4));
        assert!(concentrations(im.view(), &[HEMATOXYLIN, EOSIN, DAB]).is_err());
    }
}
