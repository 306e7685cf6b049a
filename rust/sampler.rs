//! Random, duplicate-free pixel sampling over a tiled image.

use crate::error::{Result, StainError};
use crate::optical_density::OdLookupTable;
use crate::tiled_image::{Tile, TileRequest, TiledImageSource};
use ndarray::Array2;
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Which plane of the image to read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleRequest {
    pub level: usize,
    /// `None` uses the source's default focus plane.
    pub focus_plane: Option<usize>,
    /// `None` uses the source's default band.
    pub band: Option<usize>,
}

impl SampleRequest {
    pub fn at_level(level: usize) -> Self {
        Self {
            level,
            ..Self::default()
        }
    }
}

/// Axis-aligned rectangle in level pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Draws optical-density samples from random pixels.
///
/// Each sampler owns its generator; two samplers never share random state.
#[derive(Debug, Clone)]
pub struct RandomPixelSampler {
    rng: StdRng,
    lut: OdLookupTable,
}

impl Default for RandomPixelSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl RandomPixelSampler {
    /// A sampler seeded from system entropy.
    pub fn new() -> Self {
        Self::from_rng(StdRng::from_entropy())
    }

    pub fn with_seed(seed: u64) -> Self {
        Self::from_rng(StdRng::seed_from_u64(seed))
    }

    /// `Some(seed)` gives a reproducible sampler, `None` an entropy-seeded one.
    pub fn from_seed_option(seed: Option<u64>) -> Self {
        match seed {
            Some(seed) => Self::with_seed(seed),
            None => Self::new(),
        }
    }

    pub fn from_rng(rng: StdRng) -> Self {
        Self {
            rng,
            lut: OdLookupTable::new(),
        }
    }

    /// The generator, for estimators that need extra randomness (initial
    /// factors, rotations) drawn from the same stream.
    pub fn rng_mut(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    /// Sample up to `count` pixels on a level and return their optical
    /// densities as an `N × 3` matrix.
    ///
    /// Tiles are chosen uniformly at random for each of the `count` draws;
    /// pixels within one tile are drawn without replacement. A pixel is kept
    /// only if its OD sum is strictly greater than `od_threshold`, so the
    /// result usually has fewer rows than requested.
    pub fn sample<S>(
        &mut self,
        source: &S,
        count: usize,
        od_threshold: f64,
        request: SampleRequest,
    ) -> Result<Array2<f64>>
    where
        S: TiledImageSource + ?Sized,
    {
        let (focus_plane, band) = resolve_request(source, request)?;
        let tile_count = source.tile_count(request.level);
        if tile_count == 0 || count == 0 {
            return Ok(Array2::zeros((0, 3)));
        }

        let mut draws = vec![0usize; tile_count];
        let tile_dist = Uniform::new(0, tile_count);
        for _ in 0..count {
            draws[tile_dist.sample(&mut self.rng)] += 1;
        }

        let mut values: Vec<f64> = Vec::with_capacity(count * 3);
        let mut rejected = 0usize;
        for (index, &n) in draws.iter().enumerate() {
            if n == 0 {
                continue;
            }
            let tile = source.tile(TileRequest {
                level: request.level,
                index,
                focus_plane,
                band,
            })?;
            let area = tile.area();
            if area == 0 {
                continue;
            }
            for pixel in distinct_indices(&mut self.rng, n, area) {
                let od = self.lut.pixel_to_od(tile.rgb(pixel));
                if od[0] + od[1] + od[2] > od_threshold {
                    values.extend_from_slice(&od);
                } else {
                    rejected += 1;
                }
            }
        }

        let rows = values.len() / 3;
        tracing::debug!(
            requested = count,
            kept = rows,
            rejected,
            od_threshold,
            "pixel sampling complete"
        );
        Ok(Array2::from_shape_vec((rows, 3), values)?)
    }

    /// Optical densities of every pixel inside `region` whose OD sum
    /// exceeds `od_threshold`.
    pub fn region_samples<S>(
        &self,
        source: &S,
        region: PixelRegion,
        od_threshold: f64,
        request: SampleRequest,
    ) -> Result<Array2<f64>>
    where
        S: TiledImageSource + ?Sized,
    {
        let (focus_plane, band) = resolve_request(source, request)?;
        let (width, height) = source.level_dimensions(request.level);
        let (tw, th) = source.tile_size(request.level);
        let (cols, _) = source.tile_grid(request.level);
        let x_end = region.x.saturating_add(region.width).min(width);
        let y_end = region.y.saturating_add(region.height).min(height);
        if region.x >= x_end || region.y >= y_end || tw == 0 || th == 0 {
            return Ok(Array2::zeros((0, 3)));
        }

        let mut values = Vec::new();
        for ty in (region.y / th)..=((y_end - 1) / th) {
            for tx in (region.x / tw)..=((x_end - 1) / tw) {
                let tile: Tile = source.tile(TileRequest {
                    level: request.level,
                    index: ty as usize * cols + tx as usize,
                    focus_plane,
                    band,
                })?;
                let (ox, oy) = (tx * tw, ty * th);
                let ys = region.y.max(oy)..y_end.min(oy + tile.height());
                for y in ys {
                    let xs = region.x.max(ox)..x_end.min(ox + tile.width());
                    for x in xs {
                        let od = self.lut.pixel_to_od(tile.rgb_at(x - ox, y - oy));
                        if od[0] + od[1] + od[2] > od_threshold {
                            values.extend_from_slice(&od);
                        }
                    }
                }
            }
        }
        let rows = values.len() / 3;
        Ok(Array2::from_shape_vec((rows, 3), values)?)
    }
}

fn resolve_request<S>(source: &S, request: SampleRequest) -> Result<(usize, usize)>
where
    S: TiledImageSource + ?Sized,
{
    let levels = source.level_count();
    if request.level >= levels {
        return Err(StainError::InvalidLevel {
            level: request.level,
            available: levels,
        });
    }
    let focus_plane = request
        .focus_plane
        .unwrap_or_else(|| source.default_focus_plane());
    if focus_plane >= source.focus_plane_count() {
        return Err(StainError::InvalidFocusPlane {
            plane: focus_plane,
            available: source.focus_plane_count(),
        });
    }
    let band = request.band.unwrap_or_else(|| source.default_band());
    if band >= source.band_count() {
        return Err(StainError::InvalidBand {
            band,
            available: source.band_count(),
        });
    }
    Ok((focus_plane, band))
}

/// Draw up to `n` distinct indices in `0..area` by rejection sampling.
///
/// Each slot gets at most `2 * area` attempts. When a slot runs out of
/// attempts it is dropped, so a tile that is asked for nearly all of its
/// pixels can return fewer than `n`.
pub(crate) fn distinct_indices<R: Rng>(rng: &mut R, n: usize, area: usize) -> Vec<usize> {
    let mut chosen = HashSet::with_capacity(n.min(area));
    let mut order = Vec::with_capacity(n.min(area));
    let max_attempts = 2 * area;
    for _ in 0..n {
        if chosen.len() == area {
            break;
        }
        for _ in 0..max_attempts {
            let candidate = rng.gen_range(0..area);
            if chosen.insert(candidate) {
                order.push(candidate);
                break;
            }
        }
    }
    if order.len() < n {
        tracing::debug!(
            requested = n,
            drawn = order.len(),
            area,
            "tile saturated while drawing distinct pixels"
        );
    }
    order
}
