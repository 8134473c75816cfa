//! Messages exchanged between a viewer and the tile store.
//!
//! ```text
//!  ViewportChanged{scroll_top, viewport_height, zoom}
//!         │  range math (visible ± buffer)
//!         ▼
//!  TileRangeRequest{start, end}
//!         │  TileStore::get_range
//!         ▼
//!  TileRangeResponse{tiles, missing}
//! ```
//!
//! Scroll offset and viewport height are in source-image pixels; `zoom` is
//! the display scale relative to those pixels (1.0 shows the source 1:1).

use serde::{Deserialize, Serialize};

use crate::error::ImageError;
use crate::tile::TileArtifact;

fn default_zoom() -> f64 {
    1.0
}

/// The viewer scrolled, resized, or zoomed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ViewportChanged {
    pub scroll_top: f64,
    pub viewport_height: f64,
    #[serde(default = "default_zoom")]
    pub zoom: f64,
}

impl ViewportChanged {
    pub fn new(scroll_top: f64, viewport_height: f64) -> Self {
        Self {
            scroll_top,
            viewport_height,
            zoom: 1.0,
        }
    }

    pub fn with_zoom(mut self, zoom: f64) -> Self {
        self.zoom = zoom;
        self
    }

    pub fn validate(&self) -> Result<(), ImageError> {
        if !self.scroll_top.is_finite() || self.scroll_top < 0.0 {
            return Err(ImageError::InvalidViewport(format!(
                "scroll_top must be a finite, non-negative number (got {})",
                self.scroll_top
            )));
        }
        if !self.viewport_height.is_finite() || self.viewport_height < 0.0 {
            return Err(ImageError::InvalidViewport(format!(
                "viewport_height must be a finite, non-negative number (got {})",
                self.viewport_height
            )));
        }
        if !self.zoom.is_finite() || self.zoom <= 0.0 {
            return Err(ImageError::InvalidViewport(format!(
                "zoom must be a finite, positive number (got {})",
                self.zoom
            )));
        }
        Ok(())
    }

    /// Whether only the zoom differs from `other`.
    pub fn same_region(&self, other: &ViewportChanged) -> bool {
        self.scroll_top == other.scroll_top && self.viewport_height == other.viewport_height
    }

    /// Pixel row at the middle of the viewport.
    pub fn center(&self) -> f64 {
        self.scroll_top + self.viewport_height / 2.0
    }
}

/// An inclusive range of tile indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileRangeRequest {
    pub start: u32,
    pub end: u32,
}

impl TileRangeRequest {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, index: u32) -> bool {
        (self.start..=self.end).contains(&index)
    }

    pub fn len(&self) -> usize {
        (self.end.saturating_sub(self.start) as usize) + 1
    }

    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    pub fn indices(&self) -> impl Iterator<Item = u32> {
        self.start..=self.end
    }
}

/// A tile of a requested range that could not be produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MissingTile {
    pub index: u32,
    pub error: String,
}

/// Materialized tiles of a range, plus the ones that failed.
#[derive(Debug, Clone, Default)]
pub struct TileRangeResponse {
    pub tiles: Vec<TileArtifact>,
    pub missing: Vec<MissingTile>,
}
