//! Artifact store integration tests.
//!
//! Tests verify:
//! - Concurrent requests for one artifact generate it once
//! - Artifacts persist across service restarts
//! - Eviction removes derived artifacts but never sources
//! - Writes leave no temporary files behind

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;

use long_image_streamer::cache::{ArtifactId, ArtifactOrigin};
use long_image_streamer::render::RenderParams;
use long_image_streamer::viewport::TileRangeRequest;
use long_image_streamer::{EvictionPolicy, ImageService, OutputFormat, ServiceConfig};

use super::test_utils::{FakeConverter, TestService, UnavailableConverter};

const PAGES: [(u32, u32); 3] = [(640, 300), (640, 300), (640, 200)];
const DOCUMENT: &[u8] = b"%PDF-1.4 three pages";

async fn join_all<T>(handles: Vec<tokio::task::JoinHandle<T>>) -> Vec<T> {
    let mut out = Vec::with_capacity(handles.len());
    for handle in handles {
        out.push(handle.await.unwrap());
    }
    out
}

async fn rendered(test: &TestService) -> long_image_streamer::SourceImage {
    test.service
        .render()
        .render(Bytes::from_static(DOCUMENT), "doc.pdf", RenderParams::default())
        .await
        .unwrap()
        .image
}

fn files_under(dir: &Path) -> Vec<String> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir).unwrap() {
        let entry = entry.unwrap();
        let path = entry.path();
        if path.is_dir() {
            names.extend(files_under(&path));
        } else {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names
}

#[tokio::test]
async fn test_concurrent_tile_requests_generate_once() {
    let test = TestService::new(Arc::new(FakeConverter::new(&PAGES)), 200).await;
    let image = rendered(&test).await;
    let writes_before = test.service.store().stats().writes;

    let handles = (0..8)
        .map(|_| {
            let service = test.service.clone();
            let image = image.clone();
            tokio::spawn(async move { service.tiles().get_tile(&image, 200, 3).await.unwrap() })
        })
        .collect();
    let tiles = join_all(handles).await;

    assert_eq!(test.service.store().stats().writes - writes_before, 1);
    let generated = tiles
        .iter()
        .filter(|t| t.origin == ArtifactOrigin::Generated)
        .count();
    assert!(generated <= 1);
    assert!(tiles.iter().all(|t| t.data == tiles[0].data));
}

#[tokio::test]
async fn test_concurrent_uploads_convert_once() {
    let converter = Arc::new(FakeConverter::new(&PAGES));
    let test = TestService::new(converter.clone(), 200).await;

    let handles = (0..6)
        .map(|_| {
            let service = test.service.clone();
            tokio::spawn(async move {
                service
                    .render()
                    .render(Bytes::from_static(DOCUMENT), "doc.pdf", RenderParams::default())
                    .await
                    .unwrap()
            })
        })
        .collect();
    let outcomes = join_all(handles).await;

    assert_eq!(converter.calls(), 1);
    let key = *outcomes[0].image.key();
    assert!(outcomes.iter().all(|o| *o.image.key() == key));
}

#[tokio::test]
async fn test_artifacts_survive_restart() {
    let test = TestService::new(Arc::new(FakeConverter::new(&PAGES)), 200).await;
    let image = rendered(&test).await;
    let key = image.key().to_string();
    let first = test.service.tiles().get_tile(&image, 200, 1).await.unwrap();
    assert_eq!(first.origin, ArtifactOrigin::Generated);

    // A fresh service over the same directory, unable to convert anything.
    let mut config = ServiceConfig::new(test.dir.path());
    config.tile_height = 200;
    let reopened = ImageService::open(config, Arc::new(UnavailableConverter))
        .await
        .unwrap();

    let image = reopened.image(&key).await.unwrap();
    assert_eq!((image.width(), image.height()), (640, 800));
    assert_eq!(image.metadata().page_count, 3);

    let again = reopened.tiles().get_tile(&image, 200, 1).await.unwrap();
    assert_eq!(again.origin, ArtifactOrigin::Disk);
    assert_eq!(again.data, first.data);

    // Re-uploading the same document is a lookup, not a conversion.
    let outcome = reopened
        .render()
        .render(Bytes::from_static(DOCUMENT), "doc.pdf", RenderParams::default())
        .await
        .unwrap();
    assert!(!outcome.created);
}

#[tokio::test]
async fn test_prune_by_size_keeps_sources() {
    let test = TestService::new(Arc::new(FakeConverter::new(&PAGES)), 200).await;
    let image = rendered(&test).await;
    let service = &test.service;

    service.tiles().get_range(&image, 200, TileRangeRequest::new(0, 3)).await.unwrap();
    let pyramid = service.pyramid().build_pyramid(&image, service.levels()).await;
    assert!(pyramid.omitted().is_empty());

    let tile = ArtifactId::tile(*image.key(), 200, 0, 90, OutputFormat::Jpeg);
    assert!(service.store().exists(&tile).await);

    let report = service
        .store()
        .prune(&EvictionPolicy::unbounded().with_max_bytes(1))
        .await
        .unwrap();
    assert_eq!(report.images, 1);
    assert!(report.removed >= 4);
    assert!(report.freed_bytes > 0);
    assert!(report.exempt_bytes > 0);
    assert!(!service.store().exists(&tile).await);

    // The source survives, so evicted artifacts come back on demand.
    assert!(service.store().exists(&image.artifact_id()).await);
    service.memory().clear().await;
    let tile = service.tiles().get_tile(&image, 200, 0).await.unwrap();
    assert_eq!(tile.origin, ArtifactOrigin::Generated);
}

#[tokio::test]
async fn test_prune_by_ttl() {
    let test = TestService::new(Arc::new(FakeConverter::new(&PAGES)), 200).await;
    let image = rendered(&test).await;
    test.service.tiles().get_tile(&image, 200, 0).await.unwrap();

    let policy = EvictionPolicy::unbounded().with_ttl(Duration::from_secs(60));

    let report = test.service.store().prune(&policy).await.unwrap();
    assert_eq!(report.removed, 0);

    let later = SystemTime::now() + Duration::from_secs(3600);
    let report = test.service.store().prune_at(&policy, later).await.unwrap();
    assert_eq!(report.removed, 1);
    assert!(test.service.store().exists(&image.artifact_id()).await);
}

#[tokio::test]
async fn test_no_temporary_files_left() {
    let test = TestService::new(Arc::new(FakeConverter::new(&PAGES)), 200).await;
    let image = rendered(&test).await;
    test.service
        .tiles()
        .get_range(&image, 200, TileRangeRequest::new(0, 3))
        .await
        .unwrap();
    test.service
        .pyramid()
        .build_pyramid(&image, test.service.levels())
        .await;

    let names = files_under(test.dir.path());
    assert!(names.iter().any(|n| n == "meta.json"));
    assert!(names.iter().any(|n| n.starts_with("source.")));
    assert!(
        names.iter().all(|n| !n.starts_with(".tmp")),
        "leftover temp files: {:?}",
        names
    );
}
