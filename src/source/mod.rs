//! Stitched source images.
//!
//! A [`SourceImage`] is the immutable full-resolution bitmap produced by one
//! conversion. It is described by the [`SourceMetadata`] stored next to it;
//! pixels are decoded on demand by the [`SourceRegistry`].

mod registry;

pub use registry::{SourceRegistry, DEFAULT_DECODED_IMAGES};

use serde::{Deserialize, Serialize};

use crate::cache::ArtifactId;
use crate::key::{CacheKey, OutputFormat};

/// Facts about a stored source image, persisted as `meta.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub width: u32,
    pub height: u32,
    /// Format actually stored. Differs from the key's format when JPEG
    /// encoding fell back to PNG.
    pub format: OutputFormat,
    pub byte_size: u64,
    pub page_count: u32,
    /// Name of the uploaded document, for display only.
    #[serde(default)]
    pub original_name: Option<String>,
}

/// Handle to a stored source image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceImage {
    key: CacheKey,
    metadata: SourceMetadata,
}

impl SourceImage {
    pub fn new(key: CacheKey, metadata: SourceMetadata) -> Self {
        Self { key, metadata }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn metadata(&self) -> &SourceMetadata {
        &self.metadata
    }

    pub fn width(&self) -> u32 {
        self.metadata.width
    }

    pub fn height(&self) -> u32 {
        self.metadata.height
    }

    pub fn format(&self) -> OutputFormat {
        self.metadata.format
    }

    /// Quality the source was encoded at, as recorded in its key.
    pub fn quality(&self) -> u8 {
        self.key.quality()
    }

    pub fn artifact_id(&self) -> ArtifactId {
        ArtifactId::source(self.key, self.metadata.format)
    }
}
