//! Router configuration for the image API.
//!
//! # Route Structure
//!
//! ```text
//! /health                              - Health check
//! /documents                  POST     - Upload + render a document
//! /images/{key}               GET      - Image metadata
//! /images/{key}               DELETE   - Remove all artifacts
//! /images/{key}/source        GET      - Full stitched image
//! /images/{key}/pyramid       GET      - Build + describe all levels
//! /images/{key}/levels/{name} GET      - Level blob (falls back lower)
//! /images/{key}/tiles         GET      - Materialize ?start=&end=
//! /images/{key}/tiles/{index} GET      - Tile blob
//! /images/{key}/viewport      POST     - ViewportChanged -> ranges
//! /view/{key}                 GET      - HTML viewer
//! ```
//!
//! # Example
//!
//! ```ignore
//! let service = Arc::new(ImageService::open(config, converter).await?);
//! let router = create_router(service, RouterConfig::new().with_cache_max_age(600));
//!
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await?;
//! axum::serve(listener, router).await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use http::header::CONTENT_TYPE;
use http::{HeaderName, HeaderValue, Method};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use super::handlers::{
    delete_image_handler, health_handler, image_metadata_handler, level_handler, pyramid_handler,
    source_handler, tile_handler, tile_range_handler, upload_handler, viewer_handler,
    viewport_handler, AppState, X_ARTIFACT_CACHE_HIT, X_PYRAMID_LEVEL, X_TILE_COUNT,
    X_TILE_HEIGHT, X_TILE_TOP,
};
use crate::service::ImageService;

/// Default upload limit (256 MiB).
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 256 * 1024 * 1024;

// =============================================================================
// Router Configuration
// =============================================================================

/// Configuration for the HTTP router.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Origins allowed to call the API; `None` admits any origin and an
    /// empty list admits none.
    pub cors_origins: Option<Vec<String>>,

    /// `max-age` sent with every artifact response
    pub cache_max_age: u32,

    /// Wrap the router in `TraceLayer`
    pub enable_tracing: bool,

    /// Largest accepted document upload in bytes
    pub max_upload_bytes: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl RouterConfig {
    /// Any CORS origin, 1 hour max-age, tracing on.
    pub fn new() -> Self {
        Self {
            cors_origins: None,
            cache_max_age: 3600,
            enable_tracing: true,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }

    pub fn with_cors_origins(self, origins: Vec<String>) -> Self {
        Self {
            cors_origins: Some(origins),
            ..self
        }
    }

    pub fn with_cors_any_origin(self) -> Self {
        Self {
            cors_origins: None,
            ..self
        }
    }

    pub fn with_cache_max_age(self, cache_max_age: u32) -> Self {
        Self {
            cache_max_age,
            ..self
        }
    }

    pub fn with_tracing(self, enable_tracing: bool) -> Self {
        Self {
            enable_tracing,
            ..self
        }
    }

    pub fn with_max_upload_bytes(self, max_upload_bytes: usize) -> Self {
        Self {
            max_upload_bytes,
            ..self
        }
    }
}

// =============================================================================
// Router Builder
// =============================================================================

/// Create the application router with CORS and optional request tracing.
pub fn create_router(service: Arc<ImageService>, config: RouterConfig) -> Router {
    let app_state = AppState::with_cache_max_age(service, config.cache_max_age);
    let cors = build_cors_layer(&config);

    let router = Router::new()
        .route("/health", get(health_handler))
        .route(
            "/documents",
            post(upload_handler).layer(DefaultBodyLimit::max(config.max_upload_bytes)),
        )
        .route(
            "/images/{key}",
            get(image_metadata_handler).delete(delete_image_handler),
        )
        .route("/images/{key}/source", get(source_handler))
        .route("/images/{key}/pyramid", get(pyramid_handler))
        .route("/images/{key}/levels/{name}", get(level_handler))
        .route("/images/{key}/tiles", get(tile_range_handler))
        .route("/images/{key}/tiles/{filename}", get(tile_handler))
        .route("/images/{key}/viewport", post(viewport_handler))
        .route("/view/{key}", get(viewer_handler))
        .with_state(app_state)
        .layer(cors);

    if config.enable_tracing {
        router.layer(TraceLayer::new_for_http())
    } else {
        router
    }
}

/// CORS for browser viewers on other origins. Artifact headers are exposed
/// so the viewer can read band geometry.
fn build_cors_layer(config: &RouterConfig) -> CorsLayer {
    let exposed = [
        X_ARTIFACT_CACHE_HIT,
        X_TILE_TOP,
        X_TILE_HEIGHT,
        X_TILE_COUNT,
        X_PYRAMID_LEVEL,
    ]
    .map(HeaderName::from_static);

    let layer = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::HEAD,
            Method::POST,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([CONTENT_TYPE])
        .expose_headers(exposed)
        .max_age(Duration::from_secs(86400));

    match config.cors_origins.as_deref() {
        None => layer.allow_origin(Any),
        Some([]) => layer,
        Some(origins) => layer.allow_origin(parse_origins(origins)),
    }
}

/// Origins that parse as header values; the rest are logged and skipped.
fn parse_origins(origins: &[String]) -> Vec<HeaderValue> {
    origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin.trim()) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::DocumentConverter;
    use crate::service::ServiceConfig;
    use axum::body::Body;
    use http::{Request, StatusCode};
    use std::path::Path;
    use tower::ServiceExt;

    struct NoConverter;

    #[async_trait::async_trait]
    impl DocumentConverter for NoConverter {
        async fn convert(
            &self,
            _path: &Path,
            _dpi: u32,
        ) -> Result<Vec<image::DynamicImage>, crate::error::ConversionError> {
            Err(crate::error::ConversionError::NoPages)
        }
    }

    async fn router(dir: &Path, config: RouterConfig) -> Router {
        let service = ImageService::open(ServiceConfig::new(dir), Arc::new(NoConverter))
            .await
            .unwrap();
        create_router(Arc::new(service), config)
    }

    #[test]
    fn test_router_config_defaults() {
        let config = RouterConfig::default();
        assert_eq!(config.cors_origins, None);
        assert_eq!(config.cache_max_age, 3600);
        assert!(config.enable_tracing);
        assert_eq!(config.max_upload_bytes, DEFAULT_MAX_UPLOAD_BYTES);
    }

    #[test]
    fn test_router_config_builders_keep_other_fields() {
        let config = RouterConfig::new()
            .with_max_upload_bytes(1024)
            .with_cors_origins(vec!["https://viewer.example".to_string()])
            .with_tracing(false)
            .with_cache_max_age(60);

        assert_eq!(config.max_upload_bytes, 1024);
        assert_eq!(config.cache_max_age, 60);
        assert!(!config.enable_tracing);
        assert_eq!(config.cors_origins.as_ref().map(Vec::len), Some(1));
        assert_eq!(config.with_cors_any_origin().cors_origins, None);
    }

    #[test]
    fn test_parse_origins_skips_invalid() {
        let parsed = parse_origins(&[
            "https://viewer.example".to_string(),
            "bad\norigin".to_string(),
        ]);
        assert_eq!(parsed, vec![HeaderValue::from_static("https://viewer.example")]);
    }

    #[tokio::test]
    async fn test_preflight_allows_configured_origin() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(
            dir.path(),
            RouterConfig::new()
                .with_tracing(false)
                .with_cors_origins(vec!["https://viewer.example".to_string()]),
        )
        .await;

        let request = Request::builder()
            .method("OPTIONS")
            .uri("/health")
            .header("origin", "https://viewer.example")
            .header("access-control-request-method", "GET")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(
            response.headers().get("access-control-allow-origin").unwrap(),
            "https://viewer.example"
        );
    }

    #[tokio::test]
    async fn test_upload_body_limit() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(
            dir.path(),
            RouterConfig::new().with_tracing(false).with_max_upload_bytes(16),
        )
        .await;

        let request = Request::builder()
            .method("POST")
            .uri("/documents?filename=a.pdf")
            .body(Body::from(vec![0u8; 64]))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
