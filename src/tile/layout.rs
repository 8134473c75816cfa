//! Horizontal band geometry.
//!
//! An image of height `h` cut with tile height `H` yields `ceil(h / H)`
//! full-width bands. Band `i` covers rows `[i*H, min((i+1)*H, h))`, so the
//! bands partition the image exactly and only the last may be shorter.

use serde::Serialize;

use crate::error::ImageError;

/// Default band height in pixels.
pub const DEFAULT_TILE_HEIGHT: u32 = 1000;

/// Smallest band height accepted from clients.
pub const MIN_TILE_HEIGHT: u32 = 16;

/// Largest band height accepted from clients.
pub const MAX_TILE_HEIGHT: u32 = 16_384;

/// One band of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TileSpec {
    pub index: u32,
    /// First row, inclusive.
    pub top: u32,
    pub height: u32,
    pub width: u32,
}

impl TileSpec {
    /// Row after the last row of this band.
    pub fn bottom(&self) -> u32 {
        self.top + self.height
    }
}

/// Band geometry of one image at one tile height.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileLayout {
    width: u32,
    height: u32,
    tile_height: u32,
}

impl TileLayout {
    pub fn new(width: u32, height: u32, tile_height: u32) -> Result<Self, ImageError> {
        if !(MIN_TILE_HEIGHT..=MAX_TILE_HEIGHT).contains(&tile_height) {
            return Err(ImageError::InvalidTileHeight {
                height: tile_height,
                min: MIN_TILE_HEIGHT,
                max: MAX_TILE_HEIGHT,
            });
        }
        Ok(Self {
            width,
            height,
            tile_height,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn tile_height(&self) -> u32 {
        self.tile_height
    }

    pub fn tile_count(&self) -> u32 {
        self.height.div_ceil(self.tile_height)
    }

    /// Band `index`, or `None` past the last band.
    pub fn tile(&self, index: u32) -> Option<TileSpec> {
        if index >= self.tile_count() {
            return None;
        }
        let top = index * self.tile_height;
        Some(TileSpec {
            index,
            top,
            height: self.tile_height.min(self.height - top),
            width: self.width,
        })
    }

    /// Band `index`, or `TileNotFound` past the last band.
    pub fn require(&self, index: u32) -> Result<TileSpec, ImageError> {
        self.tile(index).ok_or(ImageError::TileNotFound {
            index,
            count: self.tile_count(),
        })
    }

    pub fn tiles(&self) -> impl Iterator<Item = TileSpec> + '_ {
        (0..self.tile_count()).filter_map(|i| self.tile(i))
    }

    /// Band containing pixel row `row`.
    pub fn tile_at_row(&self, row: u32) -> Option<u32> {
        (row < self.height).then(|| row / self.tile_height)
    }
}
