//! API integration tests for uploads, tiles, levels and viewport planning.
//!
//! Tests verify:
//! - Upload rendering, content-addressed reuse, and upload rejections
//! - Tile retrieval with band headers and cache-hit reporting
//! - Range, pyramid, level and viewport endpoints
//! - HTTP response codes for missing and malformed input

use std::sync::Arc;

use axum::http::StatusCode;

use long_image_streamer::{CacheKey, OutputFormat};

use super::test_utils::{
    body_bytes, body_json, decode, get, is_valid_jpeg, post_json, send, upload, upload_key,
    FakeConverter, TestService, UnavailableConverter,
};

/// Two pages stitched to 600x400; at 100 rows per band that is 4 bands.
const PAGES: [(u32, u32); 2] = [(600, 250), (500, 150)];
const DOCUMENT: &[u8] = b"%PDF-1.4 fake document";

async fn setup() -> (TestService, Arc<FakeConverter>) {
    let converter = Arc::new(FakeConverter::new(&PAGES));
    let test = TestService::new(converter.clone(), 100).await;
    (test, converter)
}

fn absent_key() -> String {
    CacheKey::for_document(b"never uploaded", 300, OutputFormat::Jpeg, 85).to_string()
}

// =============================================================================
// Health
// =============================================================================

#[tokio::test]
async fn test_health() {
    let (test, _) = setup().await;
    let response = get(&test.router(), "/health").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "healthy");
}

// =============================================================================
// Uploads
// =============================================================================

#[tokio::test]
async fn test_upload_renders_and_describes_image() {
    let (test, converter) = setup().await;
    let router = test.router();

    let response = upload(&router, "report.pdf", DOCUMENT).await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let json = body_json(response).await;
    assert_eq!(json["width"], 600);
    assert_eq!(json["height"], 400);
    assert_eq!(json["page_count"], 2);
    assert_eq!(json["tile_height"], 100);
    assert_eq!(json["tile_count"], 4);
    assert_eq!(json["original_name"], "report.pdf");
    assert_eq!(json["format"], "jpeg");
    assert_eq!(json["levels"].as_array().unwrap().len(), 4);
    assert_eq!(json["levels"][0]["name"], "instant");
    assert_eq!(json["levels"][0]["width"], 400);
    assert_eq!(converter.calls(), 1);
}

#[tokio::test]
async fn test_same_document_reuses_key() {
    let (test, converter) = setup().await;
    let router = test.router();

    let first = upload(&router, "a.pdf", DOCUMENT).await;
    assert_eq!(first.status(), StatusCode::CREATED);
    let first_key = body_json(first).await["key"].clone();

    // Renaming the file does not change the content key.
    let second = upload(&router, "b.pdf", DOCUMENT).await;
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(body_json(second).await["key"], first_key);
    assert_eq!(converter.calls(), 1);
}

#[tokio::test]
async fn test_different_dpi_is_a_different_image() {
    let (test, converter) = setup().await;
    let router = test.router();

    let a = upload_key(&router, "a.pdf", DOCUMENT).await;
    let response = send(
        &router,
        axum::http::Request::builder()
            .method("POST")
            .uri("/documents?filename=a.pdf&dpi=150")
            .body(axum::body::Body::from(DOCUMENT))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let b = body_json(response).await["key"].as_str().unwrap().to_string();

    assert_ne!(a, b);
    assert!(b.contains("-150dpi-"));
    assert_eq!(converter.calls(), 2);
}

#[tokio::test]
async fn test_upload_rejections() {
    let (test, _) = setup().await;
    let router = test.router();

    let response = upload(&router, "notes.txt", DOCUMENT).await;
    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    assert_eq!(body_json(response).await["error"], "unsupported_format");

    let response = upload(&router, "empty.pdf", b"").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = send(
        &router,
        axum::http::Request::builder()
            .method("POST")
            .uri("/documents")
            .body(axum::body::Body::from(DOCUMENT))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = send(
        &router,
        axum::http::Request::builder()
            .method("POST")
            .uri("/documents?filename=a.pdf&dpi=10")
            .body(axum::body::Body::from(DOCUMENT))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "invalid_params");
}

#[tokio::test]
async fn test_upload_without_converter_is_unavailable() {
    let test = TestService::new(Arc::new(UnavailableConverter), 100).await;
    let response = upload(&test.router(), "a.pdf", DOCUMENT).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(response).await["error"], "converter_unavailable");
}

// =============================================================================
// Image Lookup
// =============================================================================

#[tokio::test]
async fn test_missing_and_malformed_keys() {
    let (test, _) = setup().await;
    let router = test.router();

    let response = get(&router, &format!("/images/{}", absent_key())).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["error"], "not_found");

    let response = get(&router, "/images/not-a-key").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "invalid_key");
}

#[tokio::test]
async fn test_source_is_the_stitched_image() {
    let (test, _) = setup().await;
    let router = test.router();
    let key = upload_key(&router, "a.pdf", DOCUMENT).await;

    let response = get(&router, &format!("/images/{}/source", key)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("content-type").unwrap(), "image/jpeg");

    let image = decode(&body_bytes(response).await);
    assert_eq!((image.width(), image.height()), (600, 400));
}

#[tokio::test]
async fn test_delete_image() {
    let (test, _) = setup().await;
    let router = test.router();
    let key = upload_key(&router, "a.pdf", DOCUMENT).await;
    assert_eq!(
        get(&router, &format!("/images/{}/tiles/0", key)).await.status(),
        StatusCode::OK
    );

    let delete = |uri: String| {
        axum::http::Request::builder()
            .method("DELETE")
            .uri(uri)
            .body(axum::body::Body::empty())
            .unwrap()
    };
    let response = send(&router, delete(format!("/images/{}", key))).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = get(&router, &format!("/images/{}", key)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let response = get(&router, &format!("/images/{}/tiles/0", key)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = send(&router, delete(format!("/images/{}", key))).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// =============================================================================
// Tiles
// =============================================================================

#[tokio::test]
async fn test_tile_retrieval() {
    let (test, _) = setup().await;
    let router = test.router();
    let key = upload_key(&router, "a.pdf", DOCUMENT).await;

    let response = get(&router, &format!("/images/{}/tiles/2", key)).await;
    assert_eq!(response.status(), StatusCode::OK);

    let headers = response.headers();
    assert_eq!(headers.get("content-type").unwrap(), "image/jpeg");
    assert_eq!(headers.get("cache-control").unwrap(), "public, max-age=3600");
    assert_eq!(headers.get("x-tile-top").unwrap(), "200");
    assert_eq!(headers.get("x-tile-height").unwrap(), "100");
    assert_eq!(headers.get("x-tile-count").unwrap(), "4");
    assert_eq!(headers.get("x-artifact-cache-hit").unwrap(), "false");

    let body = body_bytes(response).await;
    assert!(is_valid_jpeg(&body));
    let tile = decode(&body);
    assert_eq!((tile.width(), tile.height()), (600, 100));
}

#[tokio::test]
async fn test_repeat_tile_is_a_cache_hit() {
    let (test, _) = setup().await;
    let router = test.router();
    let key = upload_key(&router, "a.pdf", DOCUMENT).await;
    let uri = format!("/images/{}/tiles/1.jpg", key);

    let first = get(&router, &uri).await;
    assert_eq!(first.headers().get("x-artifact-cache-hit").unwrap(), "false");
    let first_body = body_bytes(first).await;

    let second = get(&router, &uri).await;
    assert_eq!(second.headers().get("x-artifact-cache-hit").unwrap(), "true");
    assert_eq!(body_bytes(second).await, first_body);
}

#[tokio::test]
async fn test_last_tile_is_shorter() {
    let (test, _) = setup().await;
    let router = test.router();
    let key = upload_key(&router, "a.pdf", DOCUMENT).await;

    // 400 rows at 150 per band: 150, 150, 100.
    let response = get(&router, &format!("/images/{}/tiles/2?tile_height=150", key)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("x-tile-top").unwrap(), "300");
    assert_eq!(response.headers().get("x-tile-height").unwrap(), "100");
    assert_eq!(response.headers().get("x-tile-count").unwrap(), "3");

    let tile = decode(&body_bytes(response).await);
    assert_eq!(tile.height(), 100);
}

#[tokio::test]
async fn test_tile_errors() {
    let (test, _) = setup().await;
    let router = test.router();
    let key = upload_key(&router, "a.pdf", DOCUMENT).await;

    let response = get(&router, &format!("/images/{}/tiles/4", key)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["error"], "tile_not_found");

    let response = get(&router, &format!("/images/{}/tiles/abc", key)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = get(&router, &format!("/images/{}/tiles/0?tile_height=1", key)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "invalid_tile_height");

    let response = get(&router, &format!("/images/{}/tiles/0?quality=0", key)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = get(&router, &format!("/images/{}/tiles/0", absent_key())).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_tile_range_clamps_end() {
    let (test, _) = setup().await;
    let router = test.router();
    let key = upload_key(&router, "a.pdf", DOCUMENT).await;

    let response = get(&router, &format!("/images/{}/tiles?start=1&end=10", key)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    let indices: Vec<u64> = json["tiles"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["index"].as_u64().unwrap())
        .collect();
    assert_eq!(indices, vec![1, 2, 3]);
    assert!(json["missing"].as_array().unwrap().is_empty());
    assert_eq!(json["tiles"][0]["url"], format!("/images/{}/tiles/1", key));

    let response = get(&router, &format!("/images/{}/tiles?start=4&end=5", key)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "invalid_range");
}

#[tokio::test]
async fn test_tile_range_rejects_unbounded_request() {
    let (test, _) = setup().await;
    let router = test.router();
    let key = upload_key(&router, "a.pdf", DOCUMENT).await;

    // 16-row bands over 400 rows: 25 bands, more than one range may cover.
    let uri = format!(
        "/images/{}/tiles?start=0&end=4294967295&tile_height=16",
        key
    );
    let response = get(&router, &uri).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "invalid_range");

    let uri = format!("/images/{}/tiles?start=20&end=4294967295&tile_height=16", key);
    let response = get(&router, &uri).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["tiles"].as_array().unwrap().len(), 5);
}

// =============================================================================
// Pyramid
// =============================================================================

#[tokio::test]
async fn test_pyramid_builds_every_level() {
    let (test, _) = setup().await;
    let router = test.router();
    let key = upload_key(&router, "a.pdf", DOCUMENT).await;

    let response = get(&router, &format!("/images/{}/pyramid", key)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;

    let levels = json["levels"].as_array().unwrap();
    assert_eq!(levels.len(), 4);
    assert!(json["omitted"].as_array().unwrap().is_empty());

    // Only "instant" is narrower than the 600px source.
    assert_eq!(levels[0]["name"], "instant");
    assert_eq!(levels[0]["width"], 400);
    assert_eq!(levels[0]["reused_source"], false);
    for level in &levels[1..] {
        assert_eq!(level["width"], 600);
        assert_eq!(level["reused_source"], true);
    }
}

#[tokio::test]
async fn test_level_blob() {
    let (test, _) = setup().await;
    let router = test.router();
    let key = upload_key(&router, "a.pdf", DOCUMENT).await;

    let response = get(&router, &format!("/images/{}/levels/instant", key)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("x-pyramid-level").unwrap(), "instant");
    let level = decode(&body_bytes(response).await);
    assert_eq!(level.width(), 400);
    assert!(level.height() < 400);

    let response = get(&router, &format!("/images/{}/levels/huge", key)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["error"], "unknown_level");
}

// =============================================================================
// Viewport
// =============================================================================

#[tokio::test]
async fn test_viewport_plan() {
    let (test, _) = setup().await;
    let router = test.router();
    let key = upload_key(&router, "a.pdf", DOCUMENT).await;
    let uri = format!("/images/{}/viewport", key);

    let response = post_json(
        &router,
        &uri,
        serde_json::json!({"scroll_top": 150.0, "viewport_height": 60.0}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;

    assert_eq!(json["tile_count"], 4);
    assert_eq!(json["visible"], serde_json::json!({"start": 1, "end": 2}));
    assert_eq!(json["request"], serde_json::json!({"start": 0, "end": 3}));
    let mut order: Vec<u64> = json["fetch_order"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_u64().unwrap())
        .collect();
    // Visible bands come first.
    assert!(order[..2].contains(&1) && order[..2].contains(&2));
    order.sort_unstable();
    assert_eq!(order, vec![0, 1, 2, 3]);
    // 600px shown 1:1 needs the first level at least 600 wide.
    assert_eq!(json["level"], "quick");

    let response = post_json(
        &router,
        &uri,
        serde_json::json!({"scroll_top": 0.0, "viewport_height": 60.0, "zoom": 0.5}),
    )
    .await;
    assert_eq!(body_json(response).await["level"], "instant");
}

#[tokio::test]
async fn test_viewport_rejects_invalid_input() {
    let (test, _) = setup().await;
    let router = test.router();
    let key = upload_key(&router, "a.pdf", DOCUMENT).await;

    let response = post_json(
        &router,
        &format!("/images/{}/viewport", key),
        serde_json::json!({"scroll_top": -10.0, "viewport_height": 60.0}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "invalid_viewport");
}

// =============================================================================
// Viewer
// =============================================================================

#[tokio::test]
async fn test_viewer_page() {
    let (test, _) = setup().await;
    let router = test.router();
    let key = upload_key(&router, "scan.pdf", DOCUMENT).await;

    let response = get(&router, &format!("/view/{}", key)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let html = String::from_utf8(body_bytes(response).await.to_vec()).unwrap();
    assert!(html.contains("scan.pdf"));
    assert!(html.contains(&key));

    let response = get(&router, &format!("/view/{}", absent_key())).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
