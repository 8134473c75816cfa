//! HTTP server layer.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         HTTP Layer                              │
//! │   POST /documents   GET /images/{key}/tiles/{index}   /view     │
//! │                                                                 │
//! │  ┌─────────────┐  ┌─────────────────┐  ┌─────────────────────┐  │
//! │  │  handlers   │  │     viewer      │  │       routes        │  │
//! │  │ (requests)  │  │ (virtual scroll)│  │   (router config)   │  │
//! │  └─────────────┘  └─────────────────┘  └─────────────────────┘  │
//! └──────────────────────────────┬──────────────────────────────────┘
//!                                ▼
//!                          ImageService
//! ```

pub mod handlers;
pub mod routes;
mod viewer;

pub use handlers::{
    health_handler, tile_handler, viewport_handler, AppState, ErrorResponse, HandlerError,
    HealthResponse, ImageMetadataResponse, LevelDescriptor, PyramidResponse, TileDescriptor,
    TilePathParams, TileQueryParams, TileRangeResponseBody, UploadQueryParams, ViewportResponse,
    X_ARTIFACT_CACHE_HIT, X_PYRAMID_LEVEL, X_TILE_COUNT, X_TILE_HEIGHT, X_TILE_TOP,
};
pub use routes::{create_router, RouterConfig, DEFAULT_MAX_UPLOAD_BYTES};
