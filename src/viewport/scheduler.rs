//! Fetch scheduler task.
//!
//! Drives a [`ViewportSession`] from a stream of viewport reports. Reports go
//! through a `watch` channel, so a burst of scroll events collapses into the
//! latest one before the task looks at it. Fetches run concurrently; their
//! results come back through the session, which discards stale ones.
//!
//! ```text
//!  report(vp) ──► watch ──► ┌───────────────────┐ ──► fetch_tile(i) ×N
//!                           │  scheduler task   │
//!  next_event() ◄── mpsc ◄─ │  ViewportSession  │ ◄── results (JoinSet)
//!                           └───────────────────┘
//! ```
//!
//! The task lives exactly as long as its [`FetchScheduler`].

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

use super::protocol::ViewportChanged;
use super::session::{Delivery, SessionState, ViewportSession};
use crate::error::ImageError;

/// Source of tile bytes for a scheduler.
#[async_trait]
pub trait TileFetcher: Send + Sync + 'static {
    async fn fetch_tile(&self, index: u32) -> Result<Bytes, ImageError>;
}

/// Progress reported by the scheduler task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    Planned {
        generation: u64,
        fetch: Vec<u32>,
        evicted: Vec<u32>,
    },
    LevelChanged {
        level: String,
    },
    TileReady {
        generation: u64,
        index: u32,
    },
    TileFailed {
        generation: u64,
        index: u32,
        error: String,
    },
    Discarded {
        generation: u64,
        index: u32,
    },
    /// Every requested tile of `generation` is ready or failed.
    Idle {
        generation: u64,
    },
    Rejected {
        error: String,
    },
}

/// Handle to a running scheduler task.
pub struct FetchScheduler {
    viewports: watch::Sender<Option<ViewportChanged>>,
    events: mpsc::UnboundedReceiver<SchedulerEvent>,
    task: JoinHandle<ViewportSession>,
}

impl FetchScheduler {
    pub fn spawn(session: ViewportSession, fetcher: Arc<dyn TileFetcher>) -> Self {
        let (viewports, viewport_rx) = watch::channel(None);
        let (event_tx, events) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(session, viewport_rx, fetcher, event_tx));
        Self {
            viewports,
            events,
            task,
        }
    }

    /// Report the latest viewport. Replaces any report not yet picked up.
    pub fn report(&self, viewport: ViewportChanged) {
        self.viewports.send_replace(Some(viewport));
    }

    pub async fn next_event(&mut self) -> Option<SchedulerEvent> {
        self.events.recv().await
    }

    /// Wait for the next `Idle` event, returning its generation.
    pub async fn wait_idle(&mut self) -> Option<u64> {
        while let Some(event) = self.events.recv().await {
            if let SchedulerEvent::Idle { generation } = event {
                return Some(generation);
            }
        }
        None
    }

    /// Stop the task and take back the session. In-flight fetches are
    /// abandoned.
    pub async fn shutdown(self) -> Option<ViewportSession> {
        let FetchScheduler {
            viewports, task, ..
        } = self;
        drop(viewports);
        task.await.ok()
    }
}

type FetchResult = (u64, u32, Result<Bytes, ImageError>);

async fn run(
    mut session: ViewportSession,
    mut viewports: watch::Receiver<Option<ViewportChanged>>,
    fetcher: Arc<dyn TileFetcher>,
    events: mpsc::UnboundedSender<SchedulerEvent>,
) -> ViewportSession {
    let mut fetches: JoinSet<FetchResult> = JoinSet::new();

    loop {
        tokio::select! {
            changed = viewports.changed() => {
                if changed.is_err() {
                    break;
                }
                let Some(viewport) = *viewports.borrow_and_update() else {
                    continue;
                };
                on_viewport(&mut session, viewport, &fetcher, &mut fetches, &events);
            }
            Some(joined) = fetches.join_next(), if !fetches.is_empty() => {
                match joined {
                    Ok((generation, index, result)) => {
                        on_result(&mut session, generation, index, result, &events);
                    }
                    Err(e) if e.is_cancelled() => {}
                    Err(e) => warn!(error = %e, "Tile fetch task panicked"),
                }
            }
        }
    }

    fetches.abort_all();
    session
}

fn on_viewport(
    session: &mut ViewportSession,
    viewport: ViewportChanged,
    fetcher: &Arc<dyn TileFetcher>,
    fetches: &mut JoinSet<FetchResult>,
    events: &mpsc::UnboundedSender<SchedulerEvent>,
) {
    let plan = match session.on_viewport_changed(viewport) {
        Ok(plan) => plan,
        Err(e) => {
            let _ = events.send(SchedulerEvent::Rejected {
                error: e.to_string(),
            });
            return;
        }
    };

    if let Some(level) = plan.level.clone() {
        let _ = events.send(SchedulerEvent::LevelChanged { level });
    }
    debug!(
        generation = plan.generation,
        fetch = plan.fetch.len(),
        evicted = plan.evicted.len(),
        "Planned viewport fetch"
    );

    for &index in &plan.fetch {
        let fetcher = fetcher.clone();
        let generation = plan.generation;
        fetches.spawn(async move { (generation, index, fetcher.fetch_tile(index).await) });
    }
    let _ = events.send(SchedulerEvent::Planned {
        generation: plan.generation,
        fetch: plan.fetch,
        evicted: plan.evicted,
    });
    if session.state() == SessionState::Idle {
        let _ = events.send(SchedulerEvent::Idle {
            generation: session.generation(),
        });
    }
}

fn on_result(
    session: &mut ViewportSession,
    generation: u64,
    index: u32,
    result: Result<Bytes, ImageError>,
    events: &mpsc::UnboundedSender<SchedulerEvent>,
) {
    let was_idle = session.state() == SessionState::Idle;
    let event = match session.on_tile_arrived(generation, index, result) {
        Delivery::Applied => SchedulerEvent::TileReady { generation, index },
        Delivery::Failed(error) => SchedulerEvent::TileFailed {
            generation,
            index,
            error,
        },
        Delivery::Discarded => {
            debug!(generation, index, "Discarded stale tile");
            let _ = events.send(SchedulerEvent::Discarded { generation, index });
            return;
        }
    };
    let _ = events.send(event);
    if !was_idle && session.state() == SessionState::Idle {
        let _ = events.send(SchedulerEvent::Idle {
            generation: session.generation(),
        });
    }
}

// =============================================================================
// Tests
// =============================================================================
