//! HTTP request handlers for the image API.
//!
//! # Endpoints
//!
//! - `POST /documents` - Upload and render a document
//! - `GET /images/{key}` - Image metadata
//! - `GET /images/{key}/tiles/{index}` - One band
//! - `POST /images/{key}/viewport` - Ranges for a viewport
//! - `GET /health` - Health check
//!
//! See [`super::routes`] for the full table.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderName, StatusCode},
    response::{AppendHeaders, Html, IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::error::{ConversionError, ImageError};
use crate::key::{OutputFormat, DEFAULT_DPI};
use crate::render::{RenderParams, DEFAULT_SOURCE_QUALITY};
use crate::service::ImageService;
use crate::source::SourceImage;
use crate::tile::LevelArtifact;
use crate::viewport::{fetch_order, MissingTile, TileRangeRequest, ViewportChanged};

/// Whether the artifact came out of a cache rather than being generated.
pub const X_ARTIFACT_CACHE_HIT: &str = "x-artifact-cache-hit";
/// First source row covered by a tile.
pub const X_TILE_TOP: &str = "x-tile-top";
/// Rows in a tile; the last tile may be shorter than the band height.
pub const X_TILE_HEIGHT: &str = "x-tile-height";
pub const X_TILE_COUNT: &str = "x-tile-count";
/// Level actually served, which may be lower than the one asked for.
pub const X_PYRAMID_LEVEL: &str = "x-pyramid-level";

// =============================================================================
// Application State
// =============================================================================

/// Shared application state, passed to handlers via Axum's State extractor.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ImageService>,

    /// Cache-Control max-age in seconds
    pub cache_max_age: u32,
}

impl AppState {
    pub fn new(service: Arc<ImageService>) -> Self {
        Self {
            service,
            cache_max_age: 3600,
        }
    }

    pub fn with_cache_max_age(service: Arc<ImageService>, cache_max_age: u32) -> Self {
        Self {
            service,
            cache_max_age,
        }
    }

    fn cache_control(&self) -> String {
        format!("public, max-age={}", self.cache_max_age)
    }
}

// =============================================================================
// Request Parameters
// =============================================================================

/// Query parameters for document uploads.
#[derive(Debug, Deserialize)]
pub struct UploadQueryParams {
    /// Original file name; its extension selects the conversion path
    #[serde(default)]
    pub filename: Option<String>,

    #[serde(default)]
    pub dpi: Option<u32>,

    /// `jpeg` or `png`
    #[serde(default)]
    pub format: Option<String>,

    #[serde(default)]
    pub quality: Option<u8>,
}

impl UploadQueryParams {
    fn render_params(&self) -> Result<RenderParams, ConversionError> {
        let format = match &self.format {
            Some(f) => f.parse::<OutputFormat>().map_err(ConversionError::InvalidParams)?,
            None => OutputFormat::Jpeg,
        };
        let params = RenderParams {
            dpi: self.dpi.unwrap_or(DEFAULT_DPI),
            format,
            quality: self.quality.unwrap_or(DEFAULT_SOURCE_QUALITY),
        };
        params.validate()?;
        Ok(params)
    }
}

/// Path parameters for tile requests.
///
/// Extracted from `/images/{key}/tiles/{filename}` where filename is
/// `{index}` or `{index}.{ext}`.
#[derive(Debug, Deserialize)]
pub struct TilePathParams {
    pub key: String,
    pub filename: String,
}

impl TilePathParams {
    /// Parse the index, ignoring any file extension.
    pub fn index(&self) -> Result<u32, ImageError> {
        let stem = self
            .filename
            .split_once('.')
            .map_or(self.filename.as_str(), |(stem, _)| stem);
        stem.parse()
            .map_err(|_| ImageError::InvalidTileIndex(self.filename.clone()))
    }
}

/// Query parameters for tile requests.
#[derive(Debug, Default, Deserialize)]
pub struct TileQueryParams {
    /// Band height (defaults to the configured height)
    #[serde(default)]
    pub tile_height: Option<u32>,

    /// Encoding quality 1-100 (defaults to the configured quality)
    #[serde(default)]
    pub quality: Option<u8>,
}

/// Query parameters for tile range requests.
#[derive(Debug, Deserialize)]
pub struct RangeQueryParams {
    pub start: u32,
    pub end: u32,

    #[serde(default)]
    pub tile_height: Option<u32>,
}

// =============================================================================
// Response Types
// =============================================================================

/// JSON error response returned for all error conditions.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error type identifier (e.g., "not_found", "unsupported_format")
    pub error: String,

    /// Human-readable error message
    pub message: String,

    /// HTTP status code (included for convenience)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            status: None,
        }
    }

    pub fn with_status(
        error: impl Into<String>,
        message: impl Into<String>,
        status: StatusCode,
    ) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            status: Some(status.as_u16()),
        }
    }
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// A configured level and the size it has for one image.
#[derive(Debug, Serialize)]
pub struct LevelDescriptor {
    pub name: String,
    pub max_width: u32,
    pub quality: u8,
    pub width: u32,
    pub height: u32,
}

/// Response from the image metadata and upload endpoints.
#[derive(Debug, Serialize)]
pub struct ImageMetadataResponse {
    pub key: String,
    pub width: u32,
    pub height: u32,
    /// Format the source is stored in
    pub format: OutputFormat,
    pub byte_size: u64,
    pub page_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_name: Option<String>,
    pub tile_height: u32,
    pub tile_count: u32,
    pub levels: Vec<LevelDescriptor>,
}

/// One materialized level.
#[derive(Debug, Serialize)]
pub struct LevelResponse {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub quality: u8,
    pub format: OutputFormat,
    pub byte_size: usize,
    pub reused_source: bool,
    pub cache_hit: bool,
    pub url: String,
}

impl LevelResponse {
    fn new(key: &str, artifact: &LevelArtifact) -> Self {
        Self {
            name: artifact.level.clone(),
            width: artifact.width,
            height: artifact.height,
            quality: artifact.quality,
            format: artifact.format,
            byte_size: artifact.byte_size(),
            reused_source: artifact.reused_source,
            cache_hit: artifact.origin.is_cache_hit(),
            url: format!("/images/{}/levels/{}", key, artifact.level),
        }
    }
}

/// A level that could not be built.
#[derive(Debug, Serialize)]
pub struct OmittedLevelResponse {
    pub name: String,
    pub error: String,
}

/// Response from the pyramid endpoint.
#[derive(Debug, Serialize)]
pub struct PyramidResponse {
    pub key: String,
    pub levels: Vec<LevelResponse>,
    pub omitted: Vec<OmittedLevelResponse>,
}

/// Response from the viewport endpoint.
#[derive(Debug, Serialize)]
pub struct ViewportResponse {
    pub tile_height: u32,
    pub tile_count: u32,
    pub visible: Option<TileRangeRequest>,
    /// Range to fetch (visible plus buffer)
    pub request: Option<TileRangeRequest>,
    /// Range worth keeping; anything outside can be dropped
    pub retain: Option<TileRangeRequest>,
    /// Indices of `request`, nearest the viewport center first
    pub fetch_order: Vec<u32>,
    /// Pyramid level matching the viewport's zoom
    pub level: String,
}

/// One tile of a range response.
#[derive(Debug, Serialize)]
pub struct TileDescriptor {
    pub index: u32,
    pub top: u32,
    pub height: u32,
    pub byte_size: usize,
    pub cache_hit: bool,
    pub url: String,
}

/// Response from the tile range endpoint.
#[derive(Debug, Serialize)]
pub struct TileRangeResponseBody {
    pub tile_height: u32,
    pub tiles: Vec<TileDescriptor>,
    pub missing: Vec<MissingTile>,
}

// =============================================================================
// Error Mapping
// =============================================================================

/// Log by severity and build the JSON error body.
///
/// - 5xx errors are logged at ERROR level
/// - 404s at DEBUG level (common and expected)
/// - other 4xx errors at WARN level
fn error_response(status: StatusCode, error_type: &str, message: String) -> Response {
    if status.is_server_error() {
        error!(
            error_type = error_type,
            status = status.as_u16(),
            "Server error: {}",
            message
        );
    } else if status == StatusCode::NOT_FOUND {
        debug!(
            error_type = error_type,
            status = status.as_u16(),
            "Resource not found: {}",
            message
        );
    } else {
        warn!(
            error_type = error_type,
            status = status.as_u16(),
            "Client error: {}",
            message
        );
    }

    let body = ErrorResponse::with_status(error_type, message, status);
    (status, Json(body)).into_response()
}

impl IntoResponse for ImageError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            ImageError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            ImageError::TileNotFound { .. } => (StatusCode::NOT_FOUND, "tile_not_found"),
            ImageError::UnknownLevel { .. } => (StatusCode::NOT_FOUND, "unknown_level"),
            ImageError::InvalidKey(_) => (StatusCode::BAD_REQUEST, "invalid_key"),
            ImageError::InvalidTileIndex(_) => (StatusCode::BAD_REQUEST, "invalid_tile_index"),
            ImageError::InvalidTileHeight { .. } => {
                (StatusCode::BAD_REQUEST, "invalid_tile_height")
            }
            ImageError::InvalidQuality { .. } => (StatusCode::BAD_REQUEST, "invalid_quality"),
            ImageError::InvalidRange { .. } | ImageError::RangeTooLarge { .. } => {
                (StatusCode::BAD_REQUEST, "invalid_range")
            }
            ImageError::InvalidViewport(_) => (StatusCode::BAD_REQUEST, "invalid_viewport"),
            ImageError::LevelUnavailable { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "level_unavailable")
            }
            ImageError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error"),
            ImageError::Encode(_) => (StatusCode::INTERNAL_SERVER_ERROR, "encode_error"),
        };
        error_response(status, error_type, self.to_string())
    }
}

impl IntoResponse for ConversionError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            ConversionError::UnsupportedFormat { .. } => {
                (StatusCode::UNSUPPORTED_MEDIA_TYPE, "unsupported_format")
            }
            ConversionError::ConverterUnavailable { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "converter_unavailable")
            }
            ConversionError::ConverterFailed { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, "conversion_failed")
            }
            ConversionError::NoPages => (StatusCode::UNPROCESSABLE_ENTITY, "no_pages"),
            ConversionError::Stitch(_) => (StatusCode::UNPROCESSABLE_ENTITY, "stitch_failed"),
            ConversionError::InvalidParams(_) => (StatusCode::BAD_REQUEST, "invalid_params"),
            ConversionError::Encode(_) => (StatusCode::INTERNAL_SERVER_ERROR, "encode_error"),
            ConversionError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error"),
        };
        error_response(status, error_type, self.to_string())
    }
}

/// Error of a handler that can fail in rendering or in image lookup.
pub enum HandlerError {
    Image(ImageError),
    Conversion(ConversionError),
}

impl IntoResponse for HandlerError {
    fn into_response(self) -> Response {
        match self {
            HandlerError::Image(e) => e.into_response(),
            HandlerError::Conversion(e) => e.into_response(),
        }
    }
}

impl From<ImageError> for HandlerError {
    fn from(err: ImageError) -> Self {
        HandlerError::Image(err)
    }
}

impl From<ConversionError> for HandlerError {
    fn from(err: ConversionError) -> Self {
        HandlerError::Conversion(err)
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Blob response with content type, caching, and artifact headers.
fn artifact_response(
    state: &AppState,
    format: OutputFormat,
    data: Bytes,
    cache_hit: bool,
    mut headers: Vec<(HeaderName, String)>,
) -> Response {
    headers.push((header::CONTENT_TYPE, format.mime_type().to_string()));
    headers.push((header::CACHE_CONTROL, state.cache_control()));
    headers.push((
        HeaderName::from_static(X_ARTIFACT_CACHE_HIT),
        cache_hit.to_string(),
    ));
    (StatusCode::OK, AppendHeaders(headers), data).into_response()
}

fn image_metadata(
    state: &AppState,
    image: &SourceImage,
) -> Result<ImageMetadataResponse, ImageError> {
    let layout = state.service.layout(image)?;
    let levels = state
        .service
        .levels()
        .iter()
        .map(|level| {
            let (width, height) = level.target_dimensions(image.width(), image.height());
            LevelDescriptor {
                name: level.name.clone(),
                max_width: level.max_width,
                quality: level.quality,
                width,
                height,
            }
        })
        .collect();
    let metadata = image.metadata();

    Ok(ImageMetadataResponse {
        key: image.key().to_string(),
        width: image.width(),
        height: image.height(),
        format: image.format(),
        byte_size: metadata.byte_size,
        page_count: metadata.page_count,
        original_name: metadata.original_name.clone(),
        tile_height: layout.tile_height(),
        tile_count: layout.tile_count(),
        levels,
    })
}

// =============================================================================
// Handlers
// =============================================================================

/// Handle health check requests.
///
/// `GET /health` returns `{"status": "healthy", "version": "..."}`.
pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Handle document uploads.
///
/// # Endpoint
///
/// `POST /documents?filename=report.pdf&dpi=300&format=jpeg&quality=85`
///
/// The request body is the raw document. Uploading the same bytes with the
/// same parameters again reuses the stored image.
///
/// # Response
///
/// - `201 Created`: image rendered
/// - `200 OK`: identical document already rendered
/// - `400 Bad Request`: invalid parameters
/// - `415 Unsupported Media Type`: unknown extension
/// - `422 Unprocessable Entity`: converter failed or produced no pages
/// - `503 Service Unavailable`: converter not installed
pub async fn upload_handler(
    State(state): State<AppState>,
    Query(query): Query<UploadQueryParams>,
    body: Bytes,
) -> Result<Response, HandlerError> {
    let Some(filename) = query.filename.clone() else {
        return Err(ConversionError::InvalidParams("filename is required".into()).into());
    };
    let params = query.render_params()?;
    if body.is_empty() {
        return Err(ConversionError::InvalidParams("document body is empty".into()).into());
    }

    let outcome = state
        .service
        .render()
        .render(body, &filename, params)
        .await?;
    let metadata = image_metadata(&state, &outcome.image)?;

    let status = if outcome.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(metadata)).into_response())
}

/// `GET /images/{key}`: dimensions, tile count, and level sizes.
pub async fn image_metadata_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<ImageMetadataResponse>, ImageError> {
    let image = state.service.image(&key).await?;
    Ok(Json(image_metadata(&state, &image)?))
}

/// `DELETE /images/{key}`: remove every artifact of the image.
///
/// `204 No Content` on success, `404` when nothing was stored.
pub async fn delete_image_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<StatusCode, ImageError> {
    if state.service.delete(&key).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ImageError::NotFound { key })
    }
}

/// `GET /images/{key}/source`: the full stitched image.
pub async fn source_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Response, ImageError> {
    let image = state.service.image(&key).await?;
    let data = state.service.sources().source_bytes(&image).await?;
    Ok(artifact_response(&state, image.format(), data, true, Vec::new()))
}

/// `GET /images/{key}/pyramid`: build every level and describe them.
///
/// Levels that fail to build are listed under `omitted`.
pub async fn pyramid_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<PyramidResponse>, ImageError> {
    let image = state.service.image(&key).await?;
    let pyramid = state
        .service
        .pyramid()
        .build_pyramid(&image, state.service.levels())
        .await;

    Ok(Json(PyramidResponse {
        levels: pyramid
            .levels()
            .iter()
            .map(|artifact| LevelResponse::new(&key, artifact))
            .collect(),
        omitted: pyramid
            .omitted()
            .iter()
            .map(|o| OmittedLevelResponse {
                name: o.level.clone(),
                error: o.error.clone(),
            })
            .collect(),
        key,
    }))
}

/// `GET /images/{key}/levels/{name}`: one level blob.
///
/// Falls back to the nearest lower level when `name` cannot be built;
/// `X-Pyramid-Level` names the level actually served.
pub async fn level_handler(
    State(state): State<AppState>,
    Path((key, name)): Path<(String, String)>,
) -> Result<Response, ImageError> {
    let image = state.service.image(&key).await?;
    let artifact = state
        .service
        .pyramid()
        .fallback_level(&image, state.service.levels(), &name)
        .await?;

    let headers = vec![
        (HeaderName::from_static(X_PYRAMID_LEVEL), artifact.level.clone()),
        (HeaderName::from_static("x-image-width"), artifact.width.to_string()),
        (HeaderName::from_static("x-image-height"), artifact.height.to_string()),
    ];
    Ok(artifact_response(
        &state,
        artifact.format,
        artifact.data,
        artifact.origin.is_cache_hit(),
        headers,
    ))
}

/// `GET /images/{key}/tiles/{index}`: one band.
///
/// # Query Parameters
///
/// - `tile_height`: band height (default: configured height)
/// - `quality`: 1-100 (default: configured quality)
///
/// # Response
///
/// - `200 OK` with `X-Tile-Top`, `X-Tile-Height`, `X-Tile-Count`
/// - `404 Not Found`: index past the last band
pub async fn tile_handler(
    State(state): State<AppState>,
    Path(params): Path<TilePathParams>,
    Query(query): Query<TileQueryParams>,
) -> Result<Response, ImageError> {
    let index = params.index()?;
    let image = state.service.image(&params.key).await?;
    let tiles = state.service.tiles();
    let tile_height = state
        .service
        .check_tile_height(query.tile_height.unwrap_or(tiles.tile_height()))?;
    let quality = query.quality.unwrap_or(tiles.quality());

    let count = tiles.layout(&image, tile_height)?.tile_count();
    let tile = tiles
        .get_tile_at_quality(&image, tile_height, index, quality)
        .await?;

    let headers = vec![
        (HeaderName::from_static(X_TILE_TOP), tile.spec.top.to_string()),
        (HeaderName::from_static(X_TILE_HEIGHT), tile.spec.height.to_string()),
        (HeaderName::from_static(X_TILE_COUNT), count.to_string()),
    ];
    Ok(artifact_response(
        &state,
        tile.format,
        tile.data,
        tile.origin.is_cache_hit(),
        headers,
    ))
}

/// `GET /images/{key}/tiles?start=&end=`: materialize an inclusive range.
///
/// Tiles that fail are listed under `missing` instead of failing the
/// request.
pub async fn tile_range_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<RangeQueryParams>,
) -> Result<Json<TileRangeResponseBody>, ImageError> {
    let image = state.service.image(&key).await?;
    let tiles = state.service.tiles();
    let tile_height = state
        .service
        .check_tile_height(query.tile_height.unwrap_or(tiles.tile_height()))?;

    let response = tiles
        .get_range(
            &image,
            tile_height,
            TileRangeRequest::new(query.start, query.end),
        )
        .await?;

    let suffix = if tile_height == tiles.tile_height() {
        String::new()
    } else {
        format!("?tile_height={}", tile_height)
    };
    Ok(Json(TileRangeResponseBody {
        tile_height,
        tiles: response
            .tiles
            .iter()
            .map(|t| TileDescriptor {
                index: t.spec.index,
                top: t.spec.top,
                height: t.spec.height,
                byte_size: t.byte_size(),
                cache_hit: t.origin.is_cache_hit(),
                url: format!("/images/{}/tiles/{}{}", key, t.spec.index, suffix),
            })
            .collect(),
        missing: response.missing,
    }))
}

/// `POST /images/{key}/viewport`: turn a `ViewportChanged` into ranges.
///
/// Stateless: the caller keeps its own session and decides what it already
/// holds.
pub async fn viewport_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(viewport): Json<ViewportChanged>,
) -> Result<Json<ViewportResponse>, ImageError> {
    let image = state.service.image(&key).await?;
    let layout = state.service.layout(&image)?;
    let plan = state.service.plan_viewport(&image, &viewport)?;

    let display_width = (f64::from(image.width()) * viewport.zoom).ceil() as u32;
    let level = state.service.levels().for_display_width(display_width);

    Ok(Json(ViewportResponse {
        tile_height: layout.tile_height(),
        tile_count: layout.tile_count(),
        visible: plan.map(|p| p.visible),
        request: plan.map(|p| p.request),
        retain: plan.map(|p| p.retain),
        fetch_order: plan
            .map(|p| fetch_order(p.request, &viewport, layout.tile_height()))
            .unwrap_or_default(),
        level: level.name.clone(),
    }))
}

/// `GET /view/{key}`: HTML virtual-scroll viewer.
pub async fn viewer_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> Result<Html<String>, ImageError> {
    let image = state.service.image(&key).await?;
    let metadata = image_metadata(&state, &image)?;

    let host = headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("localhost:3000");
    let proto = headers
        .get("x-forwarded-proto")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("http");
    let base_url = format!("{}://{}", proto, host);

    Ok(Html(super::viewer::generate_viewer_html(&metadata, &base_url)))
}

// =============================================================================
// Tests
// =============================================================================
