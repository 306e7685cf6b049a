//! Tiled multi-resolution image access.
//!
//! The estimators only need a handful of queries from a whole-slide image:
//! how many levels and tiles there are, how big a tile is, and the pixels of
//! one tile. [`TiledImageSource`] captures that surface; [`InMemoryTiledImage`]
//! implements it over a decoded raster for tests, the CLI and the Python
//! bindings.

use crate::error::{Result, StainError};
use image::imageops::FilterType;
use image::RgbImage;
use serde::{Deserialize, Serialize};

/// Channel ordering of a tile buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelLayout {
    /// `RGBRGBRGB…`
    Interleaved,
    /// `RRR…GGG…BBB…`
    Planar,
}

/// One tile of 8-bit pixels.
#[derive(Debug, Clone)]
pub struct Tile {
    width: u32,
    height: u32,
    channels: usize,
    layout: PixelLayout,
    data: Vec<u8>,
}

impl Tile {
    pub fn new(
        width: u32,
        height: u32,
        channels: usize,
        layout: PixelLayout,
        data: Vec<u8>,
    ) -> Result<Self> {
        if channels < 3 {
            return Err(StainError::DimensionMismatch(format!(
                "tile needs at least 3 channels, got {channels}"
            )));
        }
        let expected = width as usize * height as usize * channels;
        if data.len() != expected {
            return Err(StainError::DimensionMismatch(format!(
                "tile buffer has {} bytes, expected {expected}",
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            channels,
            layout,
            data,
        })
    }

    /// Copy a rectangle out of an RGB image in the requested layout.
    pub fn from_rgb_region(
        image: &RgbImage,
        x0: u32,
        y0: u32,
        width: u32,
        height: u32,
        layout: PixelLayout,
    ) -> Self {
        let area = width as usize * height as usize;
        let mut data = vec![0u8; area * 3];
        for y in 0..height {
            for x in 0..width {
                let p = image.get_pixel(x0 + x, y0 + y).0;
                let i = y as usize * width as usize + x as usize;
                for c in 0..3 {
                    match layout {
                        PixelLayout::Interleaved => data[i * 3 + c] = p[c],
                        PixelLayout::Planar => data[c * area + i] = p[c],
                    }
                }
            }
        }
        Self {
            width,
            height,
            channels: 3,
            layout,
            data,
        }
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    pub fn area(&self) -> usize {
        self.width as usize * self.height as usize
    }

    #[inline]
    pub fn layout(&self) -> PixelLayout {
        self.layout
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// RGB of the pixel at linear index `index` (row-major).
    #[inline]
    pub fn rgb(&self, index: usize) -> [u8; 3] {
        match self.layout {
            PixelLayout::Interleaved => {
                let base = index * self.channels;
                [self.data[base], self.data[base + 1], self.data[base + 2]]
            }
            PixelLayout::Planar => {
                let plane = self.area();
                [
                    self.data[index],
                    self.data[plane + index],
                    self.data[2 * plane + index],
                ]
            }
        }
    }

    #[inline]
    pub fn rgb_at(&self, x: u32, y: u32) -> [u8; 3] {
        self.rgb(y as usize * self.width as usize + x as usize)
    }
}

/// Which tile to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRequest {
    pub level: usize,
    pub index: usize,
    pub focus_plane: usize,
    pub band: usize,
}

/// Read access to a tiled, multi-resolution image.
///
/// Tiles on a level form a row-major grid of `tile_size` cells; edge tiles
/// may be smaller than the nominal size.
pub trait TiledImageSource {
    fn level_count(&self) -> usize;

    /// Pixel dimensions `(width, height)` of a level.
    fn level_dimensions(&self, level: usize) -> (u32, u32);

    /// Nominal tile size `(width, height)` of a level.
    fn tile_size(&self, level: usize) -> (u32, u32);

    fn tile(&self, request: TileRequest) -> Result<Tile>;

    /// Tile grid `(columns, rows)` of a level.
    fn tile_grid(&self, level: usize) -> (usize, usize) {
        let (w, h) = self.level_dimensions(level);
        let (tw, th) = self.tile_size(level);
        if tw == 0 || th == 0 {
            return (0, 0);
        }
        (w.div_ceil(tw) as usize, h.div_ceil(th) as usize)
    }

    fn tile_count(&self, level: usize) -> usize {
        let (cols, rows) = self.tile_grid(level);
        cols * rows
    }

    fn focus_plane_count(&self) -> usize {
        1
    }

    fn default_focus_plane(&self) -> usize {
        0
    }

    fn band_count(&self) -> usize {
        1
    }

    fn default_band(&self) -> usize {
        0
    }
}

#[derive(Debug, Clone)]
struct Level {
    width: u32,
    height: u32,
    tiles: Vec<Tile>,
}

/// A tile pyramid held in memory.
///
/// Level 0 is the source raster; each further level halves both dimensions.
#[derive(Debug, Clone)]
pub struct InMemoryTiledImage {
    tile_width: u32,
    tile_height: u32,
    levels: Vec<Level>,
}

impl InMemoryTiledImage {
    pub fn from_rgb_image(
        image: &RgbImage,
        tile_size: u32,
        level_count: usize,
        layout: PixelLayout,
    ) -> Result<Self> {
        if tile_size == 0 {
            return Err(StainError::InvalidParameter(
                "tile size must be positive".to_string(),
            ));
        }
        if image.width() == 0 || image.height() == 0 {
            return Err(StainError::EmptyInput("image"));
        }
        let level_count = level_count.max(1);
        let mut levels = Vec::with_capacity(level_count);
        let mut current = image.clone();
        for level in 0..level_count {
            if level > 0 {
                let w = (current.width() / 2).max(1);
                let h = (current.height() / 2).max(1);
                current = image::imageops::resize(&current, w, h, FilterType::Triangle);
            }
            levels.push(Self::tile_level(&current, tile_size, layout));
        }
        Ok(Self {
            tile_width: tile_size,
            tile_height: tile_size,
            levels,
        })
    }

    fn tile_level(image: &RgbImage, tile_size: u32, layout: PixelLayout) -> Level {
        let (w, h) = image.dimensions();
        let mut tiles = Vec::new();
        for ty in (0..h).step_by(tile_size as usize) {
            for tx in (0..w).step_by(tile_size as usize) {
                let tw = tile_size.min(w - tx);
                let th = tile_size.min(h - ty);
                tiles.push(Tile::from_rgb_region(image, tx, ty, tw, th, layout));
            }
        }
        Level {
            width: w,
            height: h,
            tiles,
        }
    }
}

impl TiledImageSource for InMemoryTiledImage {
    fn level_count(&self) -> usize {
        self.levels.len()
    }

    fn level_dimensions(&self, level: usize) -> (u32, u32) {
        self.levels
            .get(level)
            .map(|l| (l.width, l.height))
            .unwrap_or((0, 0))
    }

    fn tile_size(&self, _level: usize) -> (u32, u32) {
        (self.tile_width, self.tile_height)
    }

    fn tile(&self, request: TileRequest) -> Result<Tile> {
        let level = self
            .levels
            .get(request.level)
            .ok_or(StainError::InvalidLevel {
                level: request.level,
                available: self.levels.len(),
            })?;
        level
            .tiles
            .get(request.index)
            .cloned()
            .ok_or(StainError::InvalidTileIndex {
                level: request.level,
                index: request.index,
                available: level.tiles.len(),
            })
    }
}
