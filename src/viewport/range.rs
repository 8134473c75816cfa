//! Tile range arithmetic.
//!
//! For tile height `H` the visible bands are
//! `floor(scroll_top / H) ..= ceil((scroll_top + viewport_height) / H) - 1`.
//! A buffer of `b` bands on each side gives the range to fetch, and a second
//! margin of `b` around that gives the range worth keeping, so a small scroll
//! back does not immediately drop what was just fetched. Every range is
//! clamped to `[0, tile_count - 1]`.

use super::protocol::{TileRangeRequest, ViewportChanged};

/// Bands fetched beyond each edge of the viewport.
pub const DEFAULT_VIEWPORT_BUFFER: u32 = 2;

/// Ranges derived from one viewport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangePlan {
    pub visible: TileRangeRequest,
    /// Visible range widened by the buffer: what should be fetched.
    pub request: TileRangeRequest,
    /// Request range widened by the buffer again: what may stay held.
    pub retain: TileRangeRequest,
}

/// Bands intersecting the viewport, or `None` for an image with no bands.
pub fn visible_range(
    viewport: &ViewportChanged,
    tile_height: u32,
    tile_count: u32,
) -> Option<TileRangeRequest> {
    if tile_count == 0 || tile_height == 0 {
        return None;
    }
    let last = tile_count - 1;
    let h = f64::from(tile_height);
    let top = viewport.scroll_top.max(0.0);
    let bottom = top + viewport.viewport_height.max(0.0);

    let start = clamp_index((top / h).floor(), last);
    let end = clamp_index((bottom / h).ceil() - 1.0, last).max(start);
    Some(TileRangeRequest::new(start, end))
}

/// `range` widened by `buffer` bands on each side.
pub fn buffered_range(range: TileRangeRequest, buffer: u32, tile_count: u32) -> TileRangeRequest {
    let last = tile_count.saturating_sub(1);
    TileRangeRequest::new(
        range.start.saturating_sub(buffer).min(last),
        range.end.saturating_add(buffer).min(last),
    )
}

pub fn plan_range(
    viewport: &ViewportChanged,
    tile_height: u32,
    tile_count: u32,
    buffer: u32,
) -> Option<RangePlan> {
    let visible = visible_range(viewport, tile_height, tile_count)?;
    let request = buffered_range(visible, buffer, tile_count);
    let retain = buffered_range(request, buffer, tile_count);
    Some(RangePlan {
        visible,
        request,
        retain,
    })
}

/// Indices of `range` ordered by distance from the viewport center, nearest
/// first; ties go to the lower index.
pub fn fetch_order(range: TileRangeRequest, viewport: &ViewportChanged, tile_height: u32) -> Vec<u32> {
    let center = viewport.center();
    let h = f64::from(tile_height);
    let mut indices: Vec<u32> = range.indices().collect();
    indices.sort_by(|a, b| {
        let da = (f64::from(*a) * h + h / 2.0 - center).abs();
        let db = (f64::from(*b) * h + h / 2.0 - center).abs();
        da.total_cmp(&db).then(a.cmp(b))
    });
    indices
}

fn clamp_index(value: f64, last: u32) -> u32 {
    if value <= 0.0 {
        0
    } else if value >= f64::from(last) {
        last
    } else {
        value as u32
    }
}
