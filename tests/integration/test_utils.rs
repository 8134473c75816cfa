//! Test utilities for integration tests.
//!
//! Converters that produce page bitmaps in memory, so no external tools are
//! needed, plus helpers for building a service and router over a temporary
//! cache directory.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use image::{DynamicImage, Rgb, RgbImage};
use tempfile::TempDir;
use tower::ServiceExt;

use long_image_streamer::error::ConversionError;
use long_image_streamer::{
    create_router, DocumentConverter, ImageService, RouterConfig, ServiceConfig,
};

// =============================================================================
// Converters
// =============================================================================

/// Produces fixed-size gradient pages and counts conversions.
pub struct FakeConverter {
    pages: Vec<(u32, u32)>,
    calls: AtomicUsize,
}

impl FakeConverter {
    /// One page per `(width, height)`.
    pub fn new(pages: &[(u32, u32)]) -> Self {
        Self {
            pages: pages.to_vec(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentConverter for FakeConverter {
    async fn convert(&self, path: &Path, _dpi: u32) -> Result<Vec<DynamicImage>, ConversionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert!(path.exists(), "upload should be on disk during conversion");
        Ok(self
            .pages
            .iter()
            .enumerate()
            .map(|(i, &(w, h))| DynamicImage::ImageRgb8(gradient(w, h, i as u8)))
            .collect())
    }
}

/// Behaves like a host without the external tools installed.
pub struct UnavailableConverter;

#[async_trait]
impl DocumentConverter for UnavailableConverter {
    async fn convert(
        &self,
        _path: &Path,
        _dpi: u32,
    ) -> Result<Vec<DynamicImage>, ConversionError> {
        Err(ConversionError::ConverterUnavailable {
            tool: "pdftoppm".to_string(),
            message: "No such file or directory".to_string(),
        })
    }
}

/// A page whose pixels encode their own coordinates.
pub fn gradient(width: u32, height: u32, page: u8) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, page.wrapping_mul(40)])
    })
}

// =============================================================================
// Service Setup
// =============================================================================

/// A service over a fresh cache directory. Keep the `TempDir` alive for the
/// duration of the test.
pub struct TestService {
    pub dir: TempDir,
    pub service: Arc<ImageService>,
}

impl TestService {
    pub async fn new(converter: Arc<dyn DocumentConverter>, tile_height: u32) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ServiceConfig::new(dir.path());
        config.tile_height = tile_height;
        let service = ImageService::open(config, converter).await.unwrap();
        Self {
            dir,
            service: Arc::new(service),
        }
    }

    pub fn router(&self) -> Router {
        create_router(self.service.clone(), RouterConfig::new().with_tracing(false))
    }
}

// =============================================================================
// HTTP Helpers
// =============================================================================

pub async fn send(router: &Router, request: Request<Body>) -> Response<Body> {
    router.clone().oneshot(request).await.unwrap()
}

pub async fn get(router: &Router, uri: &str) -> Response<Body> {
    send(router, Request::builder().uri(uri).body(Body::empty()).unwrap()).await
}

pub async fn upload(router: &Router, filename: &str, document: &'static [u8]) -> Response<Body> {
    let request = Request::builder()
        .method("POST")
        .uri(format!("/documents?filename={}", filename))
        .body(Body::from(document))
        .unwrap();
    send(router, request).await
}

pub async fn post_json(router: &Router, uri: &str, json: serde_json::Value) -> Response<Body> {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(json.to_string()))
        .unwrap();
    send(router, request).await
}

pub async fn body_bytes(response: Response<Body>) -> bytes::Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

/// Upload `document` and return the image key.
pub async fn upload_key(router: &Router, filename: &str, document: &'static [u8]) -> String {
    let response = upload(router, filename, document).await;
    assert!(response.status().is_success(), "upload failed: {}", response.status());
    body_json(response).await["key"].as_str().unwrap().to_string()
}

pub fn is_valid_jpeg(data: &[u8]) -> bool {
    data.len() >= 4 && data[..2] == [0xFF, 0xD8] && data[data.len() - 2..] == [0xFF, 0xD9]
}

pub fn decode(data: &[u8]) -> DynamicImage {
    image::load_from_memory(data).unwrap()
}
