//! Tile store.
//!
//! Serves the horizontal bands of a source image by index. Each band is
//! cropped from the decoded source and encoded independently, then cached
//! under (image key, tile height, quality, format, index), so a repeat
//! request is a memory or disk hit.
//!
//! ```text
//!  get_tile(image, H, i)
//!     │
//!     ├─ i >= ceil(height / H) ──────────► TileNotFound
//!     │
//!     └─ Materializer::get_or_create
//!           │ miss
//!           ▼
//!        SourceRegistry::pixels ─► crop rows [i*H, min((i+1)*H, height))
//!                                    ─► ArtifactEncoder::encode
//! ```
//!
//! A band that fails to encode is not remembered as failed; the next request
//! for it tries again. A range request covers at most
//! [`MAX_RANGE_TILES`] bands after clamping.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use super::encoder::{ArtifactEncoder, DEFAULT_TILE_QUALITY};
use super::layout::{TileLayout, TileSpec, DEFAULT_TILE_HEIGHT};
use crate::cache::{ArtifactId, ArtifactOrigin, Materializer};
use crate::error::{EncodeError, ImageError};
use crate::key::OutputFormat;
use crate::source::{SourceImage, SourceRegistry};
use crate::viewport::{MissingTile, TileRangeRequest, TileRangeResponse};

/// Most bands one range request may materialize.
pub const MAX_RANGE_TILES: u32 = 16;

/// One encoded band.
#[derive(Debug, Clone)]
pub struct TileArtifact {
    pub spec: TileSpec,
    pub tile_height: u32,
    pub quality: u8,
    pub format: OutputFormat,
    pub data: Bytes,
    pub origin: ArtifactOrigin,
}

impl TileArtifact {
    pub fn byte_size(&self) -> usize {
        self.data.len()
    }
}

/// Cuts, encodes, and caches bands of source images.
pub struct TileStore {
    sources: Arc<SourceRegistry>,
    materializer: Arc<Materializer>,
    encoder: ArtifactEncoder,
    format: OutputFormat,
    quality: u8,
    tile_height: u32,
    max_range_tiles: u32,
}

impl TileStore {
    pub fn new(sources: Arc<SourceRegistry>, materializer: Arc<Materializer>) -> Self {
        Self {
            sources,
            materializer,
            encoder: ArtifactEncoder::new(),
            format: OutputFormat::Jpeg,
            quality: DEFAULT_TILE_QUALITY,
            tile_height: DEFAULT_TILE_HEIGHT,
            max_range_tiles: MAX_RANGE_TILES,
        }
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Quality used when a request does not name one.
    pub fn with_quality(mut self, quality: u8) -> Self {
        self.quality = quality;
        self
    }

    /// Band height used when a request does not name one.
    pub fn with_tile_height(mut self, tile_height: u32) -> Self {
        self.tile_height = tile_height;
        self
    }

    pub fn with_max_range_tiles(mut self, max_range_tiles: u32) -> Self {
        self.max_range_tiles = max_range_tiles.max(1);
        self
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    pub fn tile_height(&self) -> u32 {
        self.tile_height
    }

    pub fn max_range_tiles(&self) -> u32 {
        self.max_range_tiles
    }

    pub fn layout(&self, image: &SourceImage, tile_height: u32) -> Result<TileLayout, ImageError> {
        TileLayout::new(image.width(), image.height(), tile_height)
    }

    /// Band `index` at the default quality.
    pub async fn get_tile(
        &self,
        image: &SourceImage,
        tile_height: u32,
        index: u32,
    ) -> Result<TileArtifact, ImageError> {
        self.get_tile_at_quality(image, tile_height, index, self.quality)
            .await
    }

    pub async fn get_tile_at_quality(
        &self,
        image: &SourceImage,
        tile_height: u32,
        index: u32,
        quality: u8,
    ) -> Result<TileArtifact, ImageError> {
        if !super::encoder::is_valid_quality(u32::from(quality)) {
            return Err(ImageError::InvalidQuality {
                quality: u32::from(quality),
            });
        }
        let spec = self.layout(image, tile_height)?.require(index)?;
        let id = ArtifactId::tile(*image.key(), tile_height, index, quality, self.format);

        let (data, origin) = self
            .materializer
            .get_or_create(&id, || self.render_tile(image, spec, quality))
            .await?;

        debug!(
            key = %image.key(),
            index,
            tile_height,
            cache_hit = origin.is_cache_hit(),
            "Served tile"
        );
        Ok(TileArtifact {
            spec,
            tile_height,
            quality,
            format: self.format,
            data,
            origin,
        })
    }

    /// Materialize bands `start..=end`. The end is clamped to the last band;
    /// bands that fail are reported in `missing` rather than failing the
    /// whole range. A clamped range longer than the store's limit is
    /// rejected.
    pub async fn get_range(
        &self,
        image: &SourceImage,
        tile_height: u32,
        range: TileRangeRequest,
    ) -> Result<TileRangeResponse, ImageError> {
        let count = self.layout(image, tile_height)?.tile_count();
        if range.start > range.end || range.start >= count {
            return Err(ImageError::InvalidRange {
                start: range.start,
                end: range.end,
                count,
            });
        }

        let end = range.end.min(count - 1);
        if end - range.start >= self.max_range_tiles {
            return Err(ImageError::RangeTooLarge {
                start: range.start,
                end: range.end,
                max: self.max_range_tiles,
            });
        }

        let mut response = TileRangeResponse::default();
        for index in range.start..=end {
            match self.get_tile(image, tile_height, index).await {
                Ok(tile) => response.tiles.push(tile),
                Err(e) => {
                    warn!(key = %image.key(), index, error = %e, "Tile unavailable");
                    response.missing.push(MissingTile {
                        index,
                        error: e.to_string(),
                    });
                }
            }
        }
        Ok(response)
    }

    async fn render_tile(
        &self,
        image: &SourceImage,
        spec: TileSpec,
        quality: u8,
    ) -> Result<Bytes, ImageError> {
        let pixels = self.sources.pixels(image).await?;
        let encoder = self.encoder.clone();
        let format = self.format;

        let encoded = tokio::task::spawn_blocking(move || {
            let band = pixels.crop_imm(0, spec.top, spec.width, spec.height);
            encoder.encode(&band, format, quality)
        })
        .await
        .map_err(|e| EncodeError::Task(e.to_string()))??;
        Ok(encoded)
    }
}

// =============================================================================
// Tests
// =============================================================================
