//! Source image registry.
//!
//! The registry provides:
//! - lookup of source descriptors from their stored metadata
//! - an LRU of decoded bitmaps, so a burst of tile requests decodes once
//! - singleflight decoding, so concurrent misses share one decode
//!
//! Decoded bitmaps are large (a 2480 x 35000 RGB page stack is ~260 MB), so
//! the LRU is bounded by image count and defaults to two.

use std::num::NonZeroUsize;
use std::sync::Arc;

use bytes::Bytes;
use image::DynamicImage;
use lru::LruCache;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{SourceImage, SourceMetadata};
use crate::cache::{ArtifactStore, Singleflight};
use crate::error::{EncodeError, ImageError};
use crate::key::CacheKey;
use crate::tile::ArtifactEncoder;

/// Default number of decoded source bitmaps kept in memory.
pub const DEFAULT_DECODED_IMAGES: usize = 2;

/// Number of source descriptors kept in memory.
const DESCRIPTOR_CACHE_CAPACITY: usize = 1024;

type DecodeFlight = Result<Arc<DynamicImage>, ImageError>;

/// Resolves cache keys to source images and decodes their pixels.
pub struct SourceRegistry {
    store: Arc<ArtifactStore>,
    encoder: ArtifactEncoder,
    descriptors: RwLock<LruCache<CacheKey, SourceImage>>,
    decoded: RwLock<LruCache<CacheKey, Arc<DynamicImage>>>,
    decodes: Singleflight<CacheKey, DecodeFlight>,
}

impl SourceRegistry {
    pub fn new(store: Arc<ArtifactStore>) -> Self {
        Self::with_capacity(store, ArtifactEncoder::new(), DEFAULT_DECODED_IMAGES)
    }

    pub fn with_capacity(
        store: Arc<ArtifactStore>,
        encoder: ArtifactEncoder,
        decoded_images: usize,
    ) -> Self {
        let descriptors =
            NonZeroUsize::new(DESCRIPTOR_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        let decoded = NonZeroUsize::new(decoded_images).unwrap_or(NonZeroUsize::MIN);
        Self {
            store,
            encoder,
            descriptors: RwLock::new(LruCache::new(descriptors)),
            decoded: RwLock::new(LruCache::new(decoded)),
            decodes: Singleflight::new(),
        }
    }

    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.store
    }

    /// Look up the source image for `key`.
    pub async fn get(&self, key: &CacheKey) -> Result<SourceImage, ImageError> {
        if let Some(image) = self.descriptors.write().await.get(key).cloned() {
            return Ok(image);
        }
        let metadata: SourceMetadata = self
            .store
            .read_metadata(key)
            .await?
            .ok_or_else(|| ImageError::not_found(key))?;
        let image = SourceImage::new(*key, metadata);
        self.descriptors.write().await.put(*key, image.clone());
        Ok(image)
    }

    /// Record a freshly rendered source so the next lookup skips the disk.
    pub async fn register(&self, image: SourceImage) {
        self.descriptors.write().await.put(*image.key(), image);
    }

    /// Encoded bytes of the source artifact.
    pub async fn source_bytes(&self, image: &SourceImage) -> Result<Bytes, ImageError> {
        self.store
            .read(&image.artifact_id())
            .await?
            .ok_or_else(|| ImageError::not_found(image.key()))
    }

    /// Decoded pixels of the source, shared between callers.
    pub async fn pixels(&self, image: &SourceImage) -> Result<Arc<DynamicImage>, ImageError> {
        let key = *image.key();
        if let Some(pixels) = self.decoded.write().await.get(&key).cloned() {
            debug!(key = %key, "Decoded source cache hit");
            return Ok(pixels);
        }

        self.decodes
            .run(key, || async move {
                // Another flight may have filled the cache meanwhile.
                if let Some(pixels) = self.decoded.write().await.get(&key).cloned() {
                    return Ok(pixels);
                }
                let data = self.source_bytes(image).await?;
                let encoder = self.encoder.clone();
                let decoded = tokio::task::spawn_blocking(move || encoder.decode(&data))
                    .await
                    .map_err(|e| EncodeError::Task(e.to_string()))??;
                info!(
                    key = %key,
                    width = decoded.width(),
                    height = decoded.height(),
                    "Decoded source image"
                );
                let pixels = Arc::new(decoded);
                self.decoded.write().await.put(key, pixels.clone());
                Ok(pixels)
            })
            .await
    }

    /// Forget everything held for `key`.
    pub async fn invalidate(&self, key: &CacheKey) {
        self.descriptors.write().await.pop(key);
        self.decoded.write().await.pop(key);
    }

    /// Number of decoded bitmaps currently held.
    pub async fn decoded_count(&self) -> usize {
        self.decoded.read().await.len()
    }
}

// =============================================================================
// Tests
// =============================================================================
