//! Per-viewer delivery state machine.
//!
//! ```text
//!            viewport reported
//!   ┌──────┐ ───────────────► ┌────────────────┐
//!   │ Idle │                  │ ComputingRange │
//!   └──────┘ ◄──┐             └───────┬────────┘
//!      ▲        │ nothing missing     │ tiles missing
//!      │        └─────────────────────┤
//!      │ every requested tile         ▼
//!      │ ready or failed     ┌─────────────────┐
//!      └──────────────────── │ FetchingMissing │
//!                            └─────────────────┘
//! ```
//!
//! Each reported viewport that moves the region bumps the generation. A tile
//! is requested under the generation current at the time; its result is
//! applied only if the session still waits for exactly that request. Tiles
//! that fall outside the retain window are dropped from the session (never
//! from the store), so late results for them are discarded.
//!
//! A zoom-only change selects a different pyramid level and leaves the tile
//! range alone.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::Serialize;

use super::protocol::{TileRangeRequest, ViewportChanged};
use super::range::{fetch_order, plan_range, RangePlan};
use crate::error::ImageError;
use crate::tile::{LevelSet, TileLayout};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    ComputingRange,
    FetchingMissing,
}

#[derive(Debug, Clone)]
enum TileSlot {
    Pending { generation: u64 },
    Ready(Bytes),
    Failed(String),
}

/// What the caller should do after a viewport report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchPlan {
    pub generation: u64,
    /// Bands intersecting the viewport.
    pub visible: Option<TileRangeRequest>,
    /// Bands that should be held, visible plus buffer.
    pub request: Option<TileRangeRequest>,
    /// Bands to fetch now, nearest the viewport center first.
    pub fetch: Vec<u32>,
    /// Bands dropped because they left the retain window.
    pub evicted: Vec<u32>,
    /// Set when the pyramid level for the current zoom changed.
    pub level: Option<String>,
}

/// Outcome of a tile arriving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Applied,
    Failed(String),
    /// Stale: the tile is no longer wanted under that generation.
    Discarded,
}

/// Client-side view of one image being scrolled.
#[derive(Debug)]
pub struct ViewportSession {
    layout: TileLayout,
    buffer: u32,
    levels: LevelSet,
    state: SessionState,
    generation: u64,
    viewport: Option<ViewportChanged>,
    plan: Option<RangePlan>,
    slots: BTreeMap<u32, TileSlot>,
    level: Option<String>,
}

impl ViewportSession {
    pub fn new(layout: TileLayout, buffer: u32, levels: LevelSet) -> Self {
        Self {
            layout,
            buffer,
            levels,
            state: SessionState::Idle,
            generation: 0,
            viewport: None,
            plan: None,
            slots: BTreeMap::new(),
            level: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn layout(&self) -> &TileLayout {
        &self.layout
    }

    pub fn visible_range(&self) -> Option<TileRangeRequest> {
        self.plan.map(|p| p.visible)
    }

    pub fn requested_range(&self) -> Option<TileRangeRequest> {
        self.plan.map(|p| p.request)
    }

    /// Pyramid level chosen for the current zoom.
    pub fn level(&self) -> Option<&str> {
        self.level.as_deref()
    }

    /// Bytes of a held band.
    pub fn tile(&self, index: u32) -> Option<&Bytes> {
        match self.slots.get(&index) {
            Some(TileSlot::Ready(data)) => Some(data),
            _ => None,
        }
    }

    /// Why the last fetch of a band failed, until it is requested again.
    pub fn tile_error(&self, index: u32) -> Option<&str> {
        match self.slots.get(&index) {
            Some(TileSlot::Failed(message)) => Some(message),
            _ => None,
        }
    }

    /// Indices of held bands.
    pub fn ready_tiles(&self) -> Vec<u32> {
        self.slots
            .iter()
            .filter(|(_, slot)| matches!(slot, TileSlot::Ready(_)))
            .map(|(index, _)| *index)
            .collect()
    }

    /// Indices still awaiting a result.
    pub fn pending_tiles(&self) -> Vec<u32> {
        self.slots
            .iter()
            .filter(|(_, slot)| matches!(slot, TileSlot::Pending { .. }))
            .map(|(index, _)| *index)
            .collect()
    }

    /// Feed a viewport report through the state machine.
    pub fn on_viewport_changed(&mut self, viewport: ViewportChanged) -> Result<FetchPlan, ImageError> {
        viewport.validate()?;
        let level = self.select_level(viewport.zoom);

        if let Some(previous) = self.viewport {
            if previous.same_region(&viewport) {
                self.viewport = Some(viewport);
                return Ok(FetchPlan {
                    generation: self.generation,
                    visible: self.visible_range(),
                    request: self.requested_range(),
                    level,
                    ..FetchPlan::default()
                });
            }
        }

        self.state = SessionState::ComputingRange;
        self.generation += 1;
        self.viewport = Some(viewport);
        let plan = plan_range(
            &viewport,
            self.layout.tile_height(),
            self.layout.tile_count(),
            self.buffer,
        );
        self.plan = plan;

        let Some(plan) = plan else {
            self.slots.clear();
            self.state = SessionState::Idle;
            return Ok(FetchPlan {
                generation: self.generation,
                level,
                ..FetchPlan::default()
            });
        };

        let evicted: Vec<u32> = self
            .slots
            .keys()
            .copied()
            .filter(|index| !plan.retain.contains(*index))
            .collect();
        for index in &evicted {
            self.slots.remove(index);
        }

        let mut fetch = Vec::new();
        for index in fetch_order(plan.request, &viewport, self.layout.tile_height()) {
            let wanted = match self.slots.get(&index) {
                None | Some(TileSlot::Failed(_)) => true,
                Some(TileSlot::Pending { .. }) | Some(TileSlot::Ready(_)) => false,
            };
            if wanted {
                self.slots.insert(
                    index,
                    TileSlot::Pending {
                        generation: self.generation,
                    },
                );
                fetch.push(index);
            }
        }

        self.update_state();
        Ok(FetchPlan {
            generation: self.generation,
            visible: Some(plan.visible),
            request: Some(plan.request),
            fetch,
            evicted,
            level,
        })
    }

    /// Apply the result of a fetch issued under `generation`.
    pub fn on_tile_arrived(
        &mut self,
        generation: u64,
        index: u32,
        result: Result<Bytes, ImageError>,
    ) -> Delivery {
        let Some(slot) = self.slots.get_mut(&index) else {
            return Delivery::Discarded;
        };
        if !matches!(slot, TileSlot::Pending { generation: g } if *g == generation) {
            return Delivery::Discarded;
        }

        let delivery = match result {
            Ok(data) => {
                *slot = TileSlot::Ready(data);
                Delivery::Applied
            }
            Err(e) => {
                let message = e.to_string();
                *slot = TileSlot::Failed(message.clone());
                Delivery::Failed(message)
            }
        };
        self.update_state();
        delivery
    }

    fn update_state(&mut self) {
        let waiting = self.plan.is_some_and(|plan| {
            self.slots.iter().any(|(index, slot)| {
                plan.request.contains(*index) && matches!(slot, TileSlot::Pending { .. })
            })
        });
        self.state = if waiting {
            SessionState::FetchingMissing
        } else {
            SessionState::Idle
        };
    }

    /// Record the level for `zoom`, returning it if it changed.
    fn select_level(&mut self, zoom: f64) -> Option<String> {
        let display_width = (f64::from(self.layout.width()) * zoom).ceil().min(f64::from(u32::MAX)) as u32;
        let name = &self.levels.for_display_width(display_width).name;
        if self.level.as_deref() == Some(name.as_str()) {
            return None;
        }
        self.level = Some(name.clone());
        self.level.clone()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn session(height: u32) -> ViewportSession {
        let layout = TileLayout::new(2000, height, 1000).unwrap();
        ViewportSession::new(layout, 2, LevelSet::default())
    }

    fn tile_bytes(index: u32) -> Bytes {
        Bytes::from(format!("tile-{}", index))
    }

    #[test]
    fn test_first_report_fetches_buffered_range_center_out() {
        let mut s = session(20_000);
        let plan = s.on_viewport_changed(ViewportChanged::new(1500.0, 600.0)).unwrap();

        assert_eq!(plan.visible, Some(TileRangeRequest::new(1, 2)));
        assert_eq!(plan.request, Some(TileRangeRequest::new(0, 4)));
        assert_eq!(plan.fetch, vec![1, 2, 0, 3, 4]);
        assert!(plan.evicted.is_empty());
        assert_eq!(s.state(), SessionState::FetchingMissing);
        assert_eq!(s.generation(), 1);
    }

    #[test]
    fn test_idle_once_everything_arrives_or_fails() {
        let mut s = session(20_000);
        let plan = s.on_viewport_changed(ViewportChanged::new(0.0, 600.0)).unwrap();
        assert_eq!(plan.fetch, vec![0, 1, 2]);

        assert_eq!(s.on_tile_arrived(1, 0, Ok(tile_bytes(0))), Delivery::Applied);
        assert_eq!(s.state(), SessionState::FetchingMissing);
        assert!(matches!(
            s.on_tile_arrived(1, 1, Err(ImageError::InvalidViewport("x".into()))),
            Delivery::Failed(_)
        ));
        assert_eq!(s.on_tile_arrived(1, 2, Ok(tile_bytes(2))), Delivery::Applied);

        assert_eq!(s.state(), SessionState::Idle);
        assert_eq!(s.ready_tiles(), vec![0, 2]);
        assert_eq!(s.tile(2), Some(&tile_bytes(2)));
    }

    #[test]
    fn test_failed_tile_is_retried_on_next_report() {
        let mut s = session(20_000);
        s.on_viewport_changed(ViewportChanged::new(0.0, 600.0)).unwrap();
        s.on_tile_arrived(1, 0, Ok(tile_bytes(0)));
        s.on_tile_arrived(1, 1, Err(ImageError::InvalidViewport("x".into())));
        s.on_tile_arrived(1, 2, Ok(tile_bytes(2)));
        assert!(s.tile_error(1).is_some_and(|e| e.contains('x')));
        assert_eq!(s.tile_error(0), None);

        let plan = s.on_viewport_changed(ViewportChanged::new(100.0, 600.0)).unwrap();
        assert_eq!(plan.fetch, vec![1]);
        assert_eq!(s.tile_error(1), None);
    }

    #[test]
    fn test_held_tiles_are_not_refetched() {
        let mut s = session(20_000);
        s.on_viewport_changed(ViewportChanged::new(0.0, 600.0)).unwrap();
        for i in 0..3 {
            s.on_tile_arrived(1, i, Ok(tile_bytes(i)));
        }
        let plan = s.on_viewport_changed(ViewportChanged::new(1500.0, 600.0)).unwrap();
        assert_eq!(plan.fetch, vec![3, 4]);
        assert!(plan.evicted.is_empty());
    }

    #[test]
    fn test_far_scroll_evicts_and_discards_stale_results() {
        let mut s = session(100_000);
        s.on_viewport_changed(ViewportChanged::new(0.0, 600.0)).unwrap();
        s.on_tile_arrived(1, 0, Ok(tile_bytes(0)));

        let plan = s.on_viewport_changed(ViewportChanged::new(50_000.0, 600.0)).unwrap();
        assert_eq!(plan.evicted, vec![0, 1, 2]);
        assert_eq!(plan.fetch, vec![50, 49, 51, 48, 52]);

        // Results for the abandoned range arrive late.
        assert_eq!(s.on_tile_arrived(1, 1, Ok(tile_bytes(1))), Delivery::Discarded);
        assert_eq!(s.on_tile_arrived(1, 2, Ok(tile_bytes(2))), Delivery::Discarded);
        assert!(s.ready_tiles().is_empty());
        assert_eq!(s.state(), SessionState::FetchingMissing);
    }

    #[test]
    fn test_three_rapid_reports_only_final_range_survives() {
        let mut s = session(100_000);
        let first = s.on_viewport_changed(ViewportChanged::new(0.0, 600.0)).unwrap();
        let second = s.on_viewport_changed(ViewportChanged::new(30_000.0, 600.0)).unwrap();
        let third = s.on_viewport_changed(ViewportChanged::new(70_000.0, 600.0)).unwrap();

        for (generation, plan) in [(1, &first), (2, &second)] {
            for index in &plan.fetch {
                assert_eq!(
                    s.on_tile_arrived(generation, *index, Ok(tile_bytes(*index))),
                    Delivery::Discarded
                );
            }
        }
        for index in &third.fetch {
            assert_eq!(s.on_tile_arrived(3, *index, Ok(tile_bytes(*index))), Delivery::Applied);
        }
        assert_eq!(s.ready_tiles(), vec![68, 69, 70, 71, 72]);
        assert_eq!(s.state(), SessionState::Idle);
    }

    #[test]
    fn test_pending_tile_survives_overlapping_move() {
        let mut s = session(20_000);
        s.on_viewport_changed(ViewportChanged::new(0.0, 600.0)).unwrap();
        // Tile 2 is still in flight under generation 1 when the view moves.
        let plan = s.on_viewport_changed(ViewportChanged::new(1000.0, 600.0)).unwrap();
        assert_eq!(s.generation(), 2);
        assert!(!plan.fetch.contains(&2));
        assert_eq!(s.on_tile_arrived(1, 2, Ok(tile_bytes(2))), Delivery::Applied);
    }

    #[test]
    fn test_zoom_only_change_keeps_range() {
        let mut s = session(20_000);
        let first = s
            .on_viewport_changed(ViewportChanged::new(1500.0, 600.0).with_zoom(1.0))
            .unwrap();
        assert_eq!(first.level.as_deref(), Some("full"));

        let zoomed = s
            .on_viewport_changed(ViewportChanged::new(1500.0, 600.0).with_zoom(0.1))
            .unwrap();
        assert_eq!(zoomed.level.as_deref(), Some("instant"));
        assert!(zoomed.fetch.is_empty());
        assert!(zoomed.evicted.is_empty());
        assert_eq!(zoomed.generation, first.generation);
        assert_eq!(zoomed.request, first.request);
        assert_eq!(s.level(), Some("instant"));
    }

    #[test]
    fn test_invalid_viewport_leaves_state_alone() {
        let mut s = session(20_000);
        assert!(s.on_viewport_changed(ViewportChanged::new(-5.0, 600.0)).is_err());
        assert_eq!(s.state(), SessionState::Idle);
        assert_eq!(s.generation(), 0);
    }

    #[test]
    fn test_empty_image_goes_straight_to_idle() {
        let mut s = session(0);
        let plan = s.on_viewport_changed(ViewportChanged::new(0.0, 600.0)).unwrap();
        assert!(plan.fetch.is_empty());
        assert_eq!(plan.visible, None);
        assert_eq!(s.state(), SessionState::Idle);
    }
}
