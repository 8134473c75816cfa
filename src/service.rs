//! Image service.
//!
//! Wires the store, caches, renderer, tile store, and pyramid builder
//! together and resolves the string keys the HTTP layer receives.

use std::path::PathBuf;
use std::time::Duration;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::info;

use crate::cache::{
    ArtifactStore, AutoPrune, EvictionPolicy, Materializer, MemoryCache,
    DEFAULT_MEMORY_CACHE_BYTES,
};
use crate::error::{ImageError, StoreError};
use crate::key::{CacheKey, OutputFormat};
use crate::render::{DocumentConverter, RenderService};
use crate::source::{SourceImage, SourceRegistry, DEFAULT_DECODED_IMAGES};
use crate::tile::{
    ArtifactEncoder, LevelSet, PyramidBuilder, TileLayout, TileStore, DEFAULT_MAX_DECODE_BYTES,
    DEFAULT_TILE_HEIGHT, DEFAULT_TILE_QUALITY, MAX_TILE_HEIGHT, MIN_TILE_HEIGHT,
};
use crate::viewport::{
    plan_range, RangePlan, TileFetcher, ViewportChanged, ViewportSession, DEFAULT_VIEWPORT_BUFFER,
};

/// Default minimum time between write-triggered prune passes.
pub const DEFAULT_PRUNE_INTERVAL: Duration = Duration::from_secs(300);

/// Settings for an [`ImageService`].
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub cache_dir: PathBuf,
    pub tile_height: u32,
    pub tile_quality: u8,
    pub tile_format: OutputFormat,
    pub levels: LevelSet,
    pub viewport_buffer: u32,
    pub memory_cache_bytes: usize,
    pub decoded_images: usize,
    pub max_decode_bytes: u64,
    /// Applied after new artifacts are written; unbounded disables pruning.
    pub eviction: EvictionPolicy,
    /// Minimum time between two prune passes.
    pub prune_interval: Duration,
}

impl ServiceConfig {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            tile_height: DEFAULT_TILE_HEIGHT,
            tile_quality: DEFAULT_TILE_QUALITY,
            tile_format: OutputFormat::Jpeg,
            levels: LevelSet::default(),
            viewport_buffer: DEFAULT_VIEWPORT_BUFFER,
            memory_cache_bytes: DEFAULT_MEMORY_CACHE_BYTES,
            decoded_images: DEFAULT_DECODED_IMAGES,
            max_decode_bytes: DEFAULT_MAX_DECODE_BYTES,
            eviction: EvictionPolicy::unbounded(),
            prune_interval: DEFAULT_PRUNE_INTERVAL,
        }
    }
}

/// Everything the API needs, behind one handle.
pub struct ImageService {
    store: Arc<ArtifactStore>,
    memory: Arc<MemoryCache>,
    sources: Arc<SourceRegistry>,
    render: RenderService,
    tiles: TileStore,
    pyramid: PyramidBuilder,
    levels: LevelSet,
    viewport_buffer: u32,
}

impl ImageService {
    /// Open the cache directory and build the service around it.
    pub async fn open(
        config: ServiceConfig,
        converter: Arc<dyn DocumentConverter>,
    ) -> Result<Self, StoreError> {
        let store = Arc::new(ArtifactStore::open(&config.cache_dir).await?);
        let memory = Arc::new(MemoryCache::with_capacity(config.memory_cache_bytes));
        let mut materializer = Materializer::new(store.clone(), memory.clone());
        if !config.eviction.is_unbounded() {
            materializer = materializer
                .with_auto_prune(AutoPrune::new(config.eviction.clone(), config.prune_interval));
        }
        let materializer = Arc::new(materializer);
        let encoder = ArtifactEncoder::with_decode_limit(config.max_decode_bytes);
        let sources = Arc::new(SourceRegistry::with_capacity(
            store.clone(),
            encoder.clone(),
            config.decoded_images,
        ));

        let render = RenderService::new(sources.clone(), converter).with_encoder(encoder);
        let tiles = TileStore::new(sources.clone(), materializer.clone())
            .with_format(config.tile_format)
            .with_quality(config.tile_quality)
            .with_tile_height(config.tile_height);
        let pyramid =
            PyramidBuilder::new(sources.clone(), materializer).with_format(config.tile_format);

        info!(
            cache_dir = %config.cache_dir.display(),
            tile_height = config.tile_height,
            levels = %config.levels,
            "Image service ready"
        );
        Ok(Self {
            store,
            memory,
            sources,
            render,
            tiles,
            pyramid,
            levels: config.levels,
            viewport_buffer: config.viewport_buffer,
        })
    }

    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.store
    }

    pub fn memory(&self) -> &Arc<MemoryCache> {
        &self.memory
    }

    pub fn sources(&self) -> &Arc<SourceRegistry> {
        &self.sources
    }

    pub fn render(&self) -> &RenderService {
        &self.render
    }

    pub fn tiles(&self) -> &TileStore {
        &self.tiles
    }

    pub fn pyramid(&self) -> &PyramidBuilder {
        &self.pyramid
    }

    pub fn levels(&self) -> &LevelSet {
        &self.levels
    }

    pub fn viewport_buffer(&self) -> u32 {
        self.viewport_buffer
    }

    /// Resolve a key taken from a URL.
    pub async fn image(&self, key: &str) -> Result<SourceImage, ImageError> {
        let key: CacheKey = key.parse()?;
        self.sources.get(&key).await
    }

    /// Remove every artifact of `key` from disk and memory.
    ///
    /// Returns `false` when nothing was stored for it.
    pub async fn delete(&self, key: &str) -> Result<bool, ImageError> {
        let key: CacheKey = key.parse()?;
        let removed = self.store.clear_image(&key).await?;
        let dropped = self.memory.remove_image(&key).await;
        self.sources.invalidate(&key).await;
        info!(key = %key, removed, dropped, "Deleted image");
        Ok(removed)
    }

    /// Band layout at the configured tile height.
    pub fn layout(&self, image: &SourceImage) -> Result<TileLayout, ImageError> {
        self.tiles.layout(image, self.tiles.tile_height())
    }

    /// Validate a tile height taken from a request.
    pub fn check_tile_height(&self, tile_height: u32) -> Result<u32, ImageError> {
        if (MIN_TILE_HEIGHT..=MAX_TILE_HEIGHT).contains(&tile_height) {
            Ok(tile_height)
        } else {
            Err(ImageError::InvalidTileHeight {
                height: tile_height,
                min: MIN_TILE_HEIGHT,
                max: MAX_TILE_HEIGHT,
            })
        }
    }

    /// Ranges a viewer at `viewport` should hold. `None` for an image with
    /// no bands.
    pub fn plan_viewport(
        &self,
        image: &SourceImage,
        viewport: &ViewportChanged,
    ) -> Result<Option<RangePlan>, ImageError> {
        viewport.validate()?;
        let layout = self.layout(image)?;
        Ok(plan_range(
            viewport,
            layout.tile_height(),
            layout.tile_count(),
            self.viewport_buffer,
        ))
    }

    /// A fresh viewport session over `image`.
    pub fn session(&self, image: &SourceImage) -> Result<ViewportSession, ImageError> {
        Ok(ViewportSession::new(
            self.layout(image)?,
            self.viewport_buffer,
            self.levels.clone(),
        ))
    }
}

/// Fetches tiles of one image straight from an in-process service.
pub struct LocalTileFetcher {
    service: Arc<ImageService>,
    image: SourceImage,
}

impl LocalTileFetcher {
    pub fn new(service: Arc<ImageService>, image: SourceImage) -> Self {
        Self { service, image }
    }
}

#[async_trait]
impl TileFetcher for LocalTileFetcher {
    async fn fetch_tile(&self, index: u32) -> Result<Bytes, ImageError> {
        let tiles = self.service.tiles();
        let tile = tiles
            .get_tile(&self.image, tiles.tile_height(), index)
            .await?;
        Ok(tile.data)
    }
}
