//! # Long Image Streamer
//!
//! Renders documents (PDF and office files) into one tall stitched image and
//! streams it to viewers without ever sending the whole thing.
//!
//! ## Features
//!
//! - **Document rendering**: pages rasterized at a chosen DPI and stitched vertically
//! - **Content-addressed artifacts**: identical uploads with identical settings reuse one key
//! - **Pyramid levels**: downscaled previews with per-level quality and fallback
//! - **Tile bands**: fixed-height horizontal bands cut lazily and cached on disk and in memory
//! - **Viewport delivery**: visible and buffered band ranges with stale-result discarding
//! - **Eviction**: TTL and byte-cap pruning of derived artifacts
//!
//! ## Architecture
//!
//! - [`key`] - cache keys and content hashing
//! - [`cache`] - artifact store, memory cache, singleflight, eviction
//! - [`source`] - registry of rendered source images
//! - [`render`] - document conversion and stitching
//! - [`tile`] - tile bands, pyramid levels, encoding
//! - [`viewport`] - range math, viewport sessions, fetch scheduling
//! - [`service`] - wiring of the above behind one handle
//! - [`server`] - Axum-based HTTP server and routes
//! - [`config`] - CLI and configuration types
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use long_image_streamer::{create_router, ExternalConverter, ImageService, RouterConfig, ServiceConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ServiceConfig::new("cache");
//!     let service = ImageService::open(config, Arc::new(ExternalConverter::default()))
//!         .await
//!         .unwrap();
//!     let router = create_router(Arc::new(service), RouterConfig::new());
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await.unwrap();
//!     axum::serve(listener, router).await.unwrap();
//! }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod key;
pub mod render;
pub mod server;
pub mod service;
pub mod source;
pub mod tile;
pub mod viewport;

// Re-export commonly used types
pub use cache::{ArtifactId, ArtifactStore, AutoPrune, EvictionPolicy, MemoryCache, PruneReport};
pub use config::{CheckConfig, ClearConfig, Cli, Command, PruneConfig, ServeConfig};
pub use error::{ConversionError, ImageError, KeyError, LevelError, StoreError};
pub use key::{CacheKey, ContentHash, OutputFormat};
pub use render::{
    DocumentConverter, DocumentKind, ExternalConverter, RenderOutcome, RenderParams, RenderService,
    Stitcher, VerticalStitcher,
};
pub use server::{create_router, AppState, RouterConfig};
pub use service::{ImageService, LocalTileFetcher, ServiceConfig};
pub use source::{SourceImage, SourceRegistry};
pub use tile::{LevelSet, PyramidBuilder, PyramidLevel, TileLayout, TileStore};
pub use viewport::{
    FetchScheduler, SchedulerEvent, TileFetcher, ViewportChanged, ViewportSession,
};
