//! Addresses of artifacts inside an image's cache directory.
//!
//! ```text
//! <cache_root>/<CacheKey>/
//!   meta.json                          source metadata, written last
//!   source.jpg                         the stitched image
//!   levels/<name>_<w>x<h>_q<q>.jpg     pyramid levels
//!   tiles/h<H>-q<Q>-jpg/00000.jpg      tiles for one tile geometry
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use crate::key::{CacheKey, OutputFormat};

/// File name of the per-image metadata document.
pub const METADATA_FILE: &str = "meta.json";

/// What an artifact is, and every parameter that shaped its bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    /// The stitched full-resolution image.
    Source { format: OutputFormat },

    /// A downscaled pyramid level.
    Level {
        name: Arc<str>,
        width: u32,
        height: u32,
        quality: u8,
        format: OutputFormat,
    },

    /// One horizontal band of the source.
    Tile {
        tile_height: u32,
        index: u32,
        quality: u8,
        format: OutputFormat,
    },
}

/// A single artifact of a single image.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactId {
    pub key: CacheKey,
    pub kind: ArtifactKind,
}

impl ArtifactId {
    pub fn source(key: CacheKey, format: OutputFormat) -> Self {
        Self {
            key,
            kind: ArtifactKind::Source { format },
        }
    }

    pub fn level(
        key: CacheKey,
        name: impl Into<Arc<str>>,
        width: u32,
        height: u32,
        quality: u8,
        format: OutputFormat,
    ) -> Self {
        Self {
            key,
            kind: ArtifactKind::Level {
                name: name.into(),
                width,
                height,
                quality,
                format,
            },
        }
    }

    pub fn tile(
        key: CacheKey,
        tile_height: u32,
        index: u32,
        quality: u8,
        format: OutputFormat,
    ) -> Self {
        Self {
            key,
            kind: ArtifactKind::Tile {
                tile_height,
                index,
                quality,
                format,
            },
        }
    }

    /// Path relative to the image directory.
    pub fn relative_path(&self) -> PathBuf {
        match &self.kind {
            ArtifactKind::Source { format } => PathBuf::from(format!("source.{}", format.extension())),
            ArtifactKind::Level {
                name,
                width,
                height,
                quality,
                format,
            } => PathBuf::from("levels").join(format!(
                "{}_{}x{}_q{}.{}",
                name,
                width,
                height,
                quality,
                format.extension()
            )),
            ArtifactKind::Tile {
                tile_height,
                index,
                quality,
                format,
            } => PathBuf::from("tiles")
                .join(format!("h{}-q{}-{}", tile_height, quality, format.extension()))
                .join(format!("{:05}.{}", index, format.extension())),
        }
    }

    pub fn format(&self) -> OutputFormat {
        match &self.kind {
            ArtifactKind::Source { format }
            | ArtifactKind::Level { format, .. }
            | ArtifactKind::Tile { format, .. } => *format,
        }
    }

    pub fn is_source(&self) -> bool {
        matches!(self.kind, ArtifactKind::Source { .. })
    }
}
