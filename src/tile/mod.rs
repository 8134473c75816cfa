//! Tile and pyramid layer.
//!
//! Everything derived from a source image lives here: horizontal bands for
//! viewport streaming and downscaled levels for progressive previews.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │              HTTP Handlers              │
//! └──────────┬──────────────────┬───────────┘
//!            │                  │
//!            ▼                  ▼
//! ┌────────────────────┐ ┌──────────────────┐
//! │     TileStore      │ │  PyramidBuilder  │
//! │  TileLayout bands  │ │  LevelSet tiers  │
//! └──────────┬─────────┘ └────────┬─────────┘
//!            │  ArtifactEncoder   │
//!            ▼                    ▼
//! ┌─────────────────────────────────────────┐
//! │   Materializer (memory → disk → build)  │
//! └────────────────────┬────────────────────┘
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │     SourceRegistry (decoded sources)    │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Components
//!
//! - [`TileStore`]: bands by index, cached per tile height and quality
//! - [`PyramidBuilder`]: one artifact per [`PyramidLevel`], never upscaled
//! - [`TileLayout`]: band geometry, `ceil(height / H)` bands
//! - [`LevelSet`]: validated, ordered level definitions
//! - [`ArtifactEncoder`]: JPEG/PNG encode, bounded decode, Lanczos3 downscale

mod encoder;
mod layout;
mod levels;
mod pyramid;
mod store;

pub use encoder::{
    clamp_quality, is_valid_quality, scaled_height, ArtifactEncoder, DEFAULT_MAX_DECODE_BYTES,
    DEFAULT_TILE_QUALITY, JPEG_MAX_DIMENSION, MAX_QUALITY, MIN_QUALITY,
};
pub use layout::{TileLayout, TileSpec, DEFAULT_TILE_HEIGHT, MAX_TILE_HEIGHT, MIN_TILE_HEIGHT};
pub use levels::{LevelSet, PyramidLevel};
pub use pyramid::{LevelArtifact, OmittedLevel, Pyramid, PyramidBuilder};
pub use store::{TileArtifact, TileStore, MAX_RANGE_TILES};
