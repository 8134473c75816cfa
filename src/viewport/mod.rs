//! Viewport delivery.
//!
//! A viewer reports what it can see; the session turns that into the band
//! range worth holding, and the scheduler fetches the missing bands while
//! dropping answers to questions nobody is asking anymore.
//!
//! # Components
//!
//! - [`ViewportChanged`], [`TileRangeRequest`], [`TileRangeResponse`]: messages
//! - [`plan_range`], [`fetch_order`]: range arithmetic
//! - [`ViewportSession`]: per-viewer state machine with generation tagging
//! - [`FetchScheduler`]: async driver over a [`TileFetcher`]

mod protocol;
mod range;
mod scheduler;
mod session;

pub use protocol::{MissingTile, TileRangeRequest, TileRangeResponse, ViewportChanged};
pub use range::{
    buffered_range, fetch_order, plan_range, visible_range, RangePlan, DEFAULT_VIEWPORT_BUFFER,
};
pub use scheduler::{FetchScheduler, SchedulerEvent, TileFetcher};
pub use session::{Delivery, FetchPlan, SessionState, ViewportSession};
