//! RGB ↔ optical density conversion.
//!
//! `OD = -log10(I / 255)`. The forward transform never returns a value below
//! [`OD_MIN`], so downstream sums and ratios never see zero or negative
//! densities. [`OdLookupTable`] caches the 256 integer levels.

use crate::float_trait::StainFloat;
use ndarray::parallel::prelude::*;
use ndarray::{Array, Array3, ArrayView, ArrayView3, Dimension, Zip};

/// Smallest optical density ever produced by the forward transform.
pub const OD_MIN: f64 = 1e-6;

/// Full-scale intensity of an 8-bit channel.
pub const RGB_MAX: f64 = 255.0;

/// Convert one channel intensity in `[0, 255]` to optical density.
///
/// Intensities `<= 0` are read as the smallest positive level (1), so
/// `rgb_to_od(0.0) == rgb_to_od(1.0)`. Full scale maps exactly to [`OD_MIN`].
#[inline]
pub fn rgb_to_od(color: f64) -> f64 {
    if color >= RGB_MAX {
        return OD_MIN;
    }
    let color = if color <= 0.0 { 1.0 } else { color };
    let od = -(color / RGB_MAX).log10();
    od.max(OD_MIN)
}

/// Convert an optical density back to an 8-bit intensity.
///
/// Densities below [`OD_MIN`] (including NaN) are read as [`OD_MIN`].
#[inline]
pub fn od_to_rgb(od: f64) -> u8 {
    let od = if od >= OD_MIN { od } else { OD_MIN };
    let value = (RGB_MAX * 10f64.powf(-od)).round();
    value.clamp(0.0, RGB_MAX) as u8
}

/// Convert a pixel to its three optical densities.
#[inline]
pub fn pixel_to_od(rgb: [u8; 3]) -> [f64; 3] {
    [
        rgb_to_od(rgb[0] as f64),
        rgb_to_od(rgb[1] as f64),
        rgb_to_od(rgb[2] as f64),
    ]
}

/// Convert three optical densities to a pixel.
#[inline]
pub fn od_to_pixel(od: [f64; 3]) -> [u8; 3] {
    [od_to_rgb(od[0]), od_to_rgb(od[1]), od_to_rgb(od[2])]
}

/// Precomputed forward transform for the 256 integer intensity levels.
///
/// Produces exactly the same values as [`rgb_to_od`] for integer inputs.
#[derive(Debug, Clone)]
pub struct OdLookupTable {
    table: [f64; 256],
}

impl Default for OdLookupTable {
    fn default() -> Self {
        Self::new()
    }
}

impl OdLookupTable {
    pub fn new() -> Self {
        let mut table = [0.0; 256];
        for (level, od) in table.iter_mut().enumerate() {
            *od = rgb_to_od(level as f64);
        }
        Self { table }
    }

    #[inline]
    pub fn od(&self, level: u8) -> f64 {
        self.table[level as usize]
    }

    #[inline]
    pub fn pixel_to_od(&self, rgb: [u8; 3]) -> [f64; 3] {
        [self.od(rgb[0]), self.od(rgb[1]), self.od(rgb[2])]
    }

    /// Approximate inverse by reverse linear scan over the table.
    ///
    /// Returns the brightest level whose density is at least `od`. This is
    /// not an exact inverse of the forward transform: densities that fall
    /// between two table entries snap to the brighter one. Prefer
    /// [`od_to_rgb`] unless the input came out of this table.
    pub fn rgb(&self, od: f64) -> u8 {
        for level in (0..self.table.len()).rev() {
            if self.table[level] >= od {
                return level as u8;
            }
        }
        0
    }
}

/// Convert an array of intensities (any shape) to optical density in parallel.
pub fn od_image<F, D>(rgb: ArrayView<F, D>) -> Array<F, D>
where
    F: StainFloat,
    D: Dimension,
{
    let mut od = rgb.to_owned();
    od.par_iter_mut().for_each(|x| {
        *x = F::cast(rgb_to_od(x.as_f64()));
    });
    od
}

/// Convert an 8-bit `(H, W, C)` image to optical density through a lookup table.
pub fn od_image_u8<F: StainFloat>(rgb: ArrayView3<u8>) -> Array3<F> {
    let lut = OdLookupTable::new();
    let mut od = Array3::<F>::zeros(rgb.raw_dim());
    Zip::from(&mut od)
        .and(&rgb)
        .par_for_each(|out, &level| *out = F::cast(lut.od(level)));
    od
}
