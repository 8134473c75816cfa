//! Viewport delivery tests against a real image service.
//!
//! Tests verify:
//! - A scheduler fed by a `LocalTileFetcher` holds exactly the requested bands
//! - Scrolling away evicts bands outside the retain window
//! - Delivered band bytes match what the tile endpoint serves

use std::sync::Arc;

use bytes::Bytes;

use long_image_streamer::render::RenderParams;
use long_image_streamer::viewport::SessionState;
use long_image_streamer::{
    FetchScheduler, LocalTileFetcher, SchedulerEvent, SourceImage, ViewportChanged,
};

use super::test_utils::{FakeConverter, TestService};

/// 640x800 at 100 rows per band: 8 bands.
const PAGES: [(u32, u32); 2] = [(640, 500), (640, 300)];

async fn setup() -> (TestService, SourceImage) {
    let test = TestService::new(Arc::new(FakeConverter::new(&PAGES)), 100).await;
    let image = test
        .service
        .render()
        .render(
            Bytes::from_static(b"%PDF-1.4 scroll"),
            "scroll.pdf",
            RenderParams::default(),
        )
        .await
        .unwrap()
        .image;
    (test, image)
}

fn scheduler(test: &TestService, image: &SourceImage) -> FetchScheduler {
    let session = test.service.session(image).unwrap();
    let fetcher = Arc::new(LocalTileFetcher::new(test.service.clone(), image.clone()));
    FetchScheduler::spawn(session, fetcher)
}

#[tokio::test]
async fn test_scheduler_fetches_buffered_range() {
    let (test, image) = setup().await;
    let mut scheduler = scheduler(&test, &image);

    scheduler.report(ViewportChanged::new(350.0, 100.0));
    assert_eq!(scheduler.wait_idle().await, Some(1));

    let session = scheduler.shutdown().await.unwrap();
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(session.visible_range().map(|r| (r.start, r.end)), Some((3, 4)));
    assert_eq!(session.ready_tiles(), vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(session.level(), Some("quick"));

    let served = test.service.tiles().get_tile(&image, 100, 3).await.unwrap();
    assert_eq!(session.tile(3), Some(&served.data));
}

#[tokio::test]
async fn test_scrolling_evicts_outside_retain_window() {
    let (test, image) = setup().await;
    let mut scheduler = scheduler(&test, &image);

    scheduler.report(ViewportChanged::new(350.0, 100.0));
    assert_eq!(scheduler.wait_idle().await, Some(1));

    scheduler.report(ViewportChanged::new(600.0, 100.0));
    let mut evicted = Vec::new();
    let mut fetched = Vec::new();
    loop {
        match scheduler.next_event().await.unwrap() {
            SchedulerEvent::Planned {
                generation: 2,
                fetch,
                evicted: gone,
            } => {
                fetched = fetch;
                evicted = gone;
            }
            SchedulerEvent::Idle { generation: 2 } => break,
            _ => {}
        }
    }

    // Request 4..=7, retain 2..=7: only band 1 goes, only band 7 is new.
    assert_eq!(evicted, vec![1]);
    assert_eq!(fetched, vec![7]);

    let session = scheduler.shutdown().await.unwrap();
    assert_eq!(session.ready_tiles(), vec![2, 3, 4, 5, 6, 7]);
}

#[tokio::test]
async fn test_zoom_out_switches_level_only() {
    let (test, image) = setup().await;
    let mut scheduler = scheduler(&test, &image);

    scheduler.report(ViewportChanged::new(0.0, 200.0));
    assert_eq!(scheduler.wait_idle().await, Some(1));

    scheduler.report(ViewportChanged::new(0.0, 200.0).with_zoom(0.5));
    let event = scheduler.next_event().await.unwrap();
    assert_eq!(
        event,
        SchedulerEvent::LevelChanged {
            level: "instant".to_string()
        }
    );

    let session = scheduler.shutdown().await.unwrap();
    assert_eq!(session.generation(), 1);
    assert_eq!(session.level(), Some("instant"));
}
