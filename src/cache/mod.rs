//! Artifact caching: disk store, memory LRU, and request collapsing.
//!
//! ```text
//!   get_or_create(id, generate)
//!          │
//!          ▼
//!   ┌──────────────┐ hit
//!   │ MemoryCache  │──────────────► bytes
//!   └──────┬───────┘
//!          │ miss
//!          ▼
//!   ┌──────────────┐ hit
//!   │ArtifactStore │──────────────► bytes (promoted to memory)
//!   └──────┬───────┘
//!          │ miss
//!          ▼
//!   ┌──────────────┐
//!   │ Singleflight │  one generate() per id, others wait
//!   └──────┬───────┘
//!          ▼
//!     write to store, promote to memory
//! ```

mod artifact;
mod eviction;
mod memory;
mod singleflight;
mod store;

pub use artifact::{ArtifactId, ArtifactKind, METADATA_FILE};
pub use eviction::{AutoPrune, EvictionPolicy, PruneReport};
pub use memory::{MemoryCache, DEFAULT_MEMORY_CACHE_BYTES};
pub use singleflight::Singleflight;
pub use store::{ArtifactStore, StoreStats, WriteOutcome, ACCESS_PERSIST_INTERVAL};

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::error::ImageError;

/// Where a materialized artifact came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactOrigin {
    Memory,
    Disk,
    Generated,
}

impl ArtifactOrigin {
    pub fn is_cache_hit(&self) -> bool {
        !matches!(self, ArtifactOrigin::Generated)
    }
}

type Flight = Result<(Bytes, ArtifactOrigin), ImageError>;

/// Looks artifacts up through memory and disk, generating them at most once.
pub struct Materializer {
    store: Arc<ArtifactStore>,
    memory: Arc<MemoryCache>,
    flights: Singleflight<ArtifactId, Flight>,
    generated: AtomicU64,
    auto_prune: Option<AutoPrune>,
}

impl Materializer {
    pub fn new(store: Arc<ArtifactStore>, memory: Arc<MemoryCache>) -> Self {
        Self {
            store,
            memory,
            flights: Singleflight::new(),
            generated: AtomicU64::new(0),
            auto_prune: None,
        }
    }

    /// Prune the store after new artifacts are written.
    pub fn with_auto_prune(mut self, auto_prune: AutoPrune) -> Self {
        self.auto_prune = Some(auto_prune);
        self
    }

    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.store
    }

    pub fn memory(&self) -> &Arc<MemoryCache> {
        &self.memory
    }

    /// Number of artifacts this materializer has generated.
    pub fn generated(&self) -> u64 {
        self.generated.load(Ordering::Relaxed)
    }

    /// Find an already materialized artifact.
    pub async fn lookup(
        &self,
        id: &ArtifactId,
    ) -> Result<Option<(Bytes, ArtifactOrigin)>, ImageError> {
        if let Some(data) = self.memory.get(id).await {
            debug!(artifact = ?id.kind, "Memory cache hit");
            self.store.record_access(id).await;
            return Ok(Some((data, ArtifactOrigin::Memory)));
        }
        if let Some(data) = self.store.read(id).await? {
            debug!(artifact = ?id.kind, "Disk cache hit");
            self.memory.put(id.clone(), data.clone()).await;
            return Ok(Some((data, ArtifactOrigin::Disk)));
        }
        Ok(None)
    }

    /// Return the artifact for `id`, running `generate` on a cache miss.
    ///
    /// Concurrent callers for the same id share one `generate` call. A failed
    /// generation is not remembered; the next call tries again.
    pub async fn get_or_create<F, Fut>(
        &self,
        id: &ArtifactId,
        generate: F,
    ) -> Result<(Bytes, ArtifactOrigin), ImageError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes, ImageError>>,
    {
        if let Some(hit) = self.lookup(id).await? {
            return Ok(hit);
        }

        self.flights
            .run(id.clone(), || async move {
                // An earlier flight may have landed between lookup and here.
                if let Some(data) = self.store.read(id).await? {
                    self.memory.put(id.clone(), data.clone()).await;
                    return Ok((data, ArtifactOrigin::Disk));
                }

                let data = generate().await?;
                self.generated.fetch_add(1, Ordering::Relaxed);
                match self.store.write(id, data.clone()).await {
                    Ok(WriteOutcome::Created) => {
                        if let Some(auto_prune) = &self.auto_prune {
                            let _ = auto_prune.after_write(&self.store);
                        }
                    }
                    Ok(WriteOutcome::AlreadyPresent) => {}
                    // Still serve the bytes; the next request regenerates.
                    Err(e) => warn!(artifact = ?id.kind, error = %e, "Failed to persist artifact"),
                }
                self.memory.put(id.clone(), data.clone()).await;
                Ok((data, ArtifactOrigin::Generated))
            })
            .await
    }
}

// =============================================================================
// Tests
// =============================================================================
