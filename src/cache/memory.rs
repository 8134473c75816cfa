//! In-memory LRU of encoded artifacts.
//!
//! Sits in front of the [`ArtifactStore`](super::ArtifactStore) so hot tiles
//! and levels are served without touching the filesystem. Capacity is
//! measured in encoded bytes; the least-recently-used entries are dropped
//! once the total exceeds it. Source images are never cached here.

use std::num::NonZeroUsize;

use bytes::Bytes;
use lru::LruCache;
use tokio::sync::RwLock;

use super::artifact::ArtifactId;
use crate::key::CacheKey;

/// Default capacity: 64 MiB of encoded artifacts.
pub const DEFAULT_MEMORY_CACHE_BYTES: usize = 64 * 1024 * 1024;

/// Upper bound on entry count, independent of byte size.
const DEFAULT_MAX_ENTRIES: usize = 10_000;

struct Entries {
    lru: LruCache<ArtifactId, Bytes>,
    bytes: usize,
}

impl Entries {
    fn evict_to(&mut self, max_bytes: usize) {
        while self.bytes > max_bytes {
            match self.lru.pop_lru() {
                Some((_, evicted)) => self.bytes = self.bytes.saturating_sub(evicted.len()),
                None => break,
            }
        }
    }
}

/// Byte-bounded LRU cache of encoded artifacts, shared across tasks.
pub struct MemoryCache {
    entries: RwLock<Entries>,
    max_bytes: usize,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MEMORY_CACHE_BYTES)
    }

    /// Cache holding at most `max_bytes` of encoded data.
    pub fn with_capacity(max_bytes: usize) -> Self {
        Self::with_capacity_and_entries(max_bytes, DEFAULT_MAX_ENTRIES)
    }

    pub fn with_capacity_and_entries(max_bytes: usize, max_entries: usize) -> Self {
        let max_entries = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: RwLock::new(Entries {
                lru: LruCache::new(max_entries),
                bytes: 0,
            }),
            max_bytes,
        }
    }

    /// Look up an artifact, marking it recently used.
    pub async fn get(&self, id: &ArtifactId) -> Option<Bytes> {
        let mut entries = self.entries.write().await;
        entries.lru.get(id).cloned()
    }

    /// Whether an artifact is cached, without touching LRU order.
    pub async fn contains(&self, id: &ArtifactId) -> bool {
        self.entries.read().await.lru.contains(id)
    }

    /// Insert an artifact, evicting older entries to stay within capacity.
    ///
    /// Artifacts larger than the whole cache are not kept.
    pub async fn put(&self, id: ArtifactId, data: Bytes) {
        if data.len() > self.max_bytes {
            return;
        }
        let mut entries = self.entries.write().await;
        let size = data.len();
        // push() hands back whatever left the cache: the old value for this
        // id, or the LRU entry displaced by the entry-count bound.
        if let Some((_, displaced)) = entries.lru.push(id, data) {
            entries.bytes = entries.bytes.saturating_sub(displaced.len());
        }
        entries.bytes += size;
        entries.evict_to(self.max_bytes);
    }

    pub async fn remove(&self, id: &ArtifactId) -> Option<Bytes> {
        let mut entries = self.entries.write().await;
        let removed = entries.lru.pop(id);
        if let Some(data) = &removed {
            entries.bytes = entries.bytes.saturating_sub(data.len());
        }
        removed
    }

    /// Drop every cached artifact belonging to one image.
    pub async fn remove_image(&self, key: &CacheKey) -> usize {
        let mut entries = self.entries.write().await;
        let doomed: Vec<ArtifactId> = entries
            .lru
            .iter()
            .filter(|(id, _)| id.key == *key)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &doomed {
            if let Some(data) = entries.lru.pop(id) {
                entries.bytes = entries.bytes.saturating_sub(data.len());
            }
        }
        doomed.len()
    }

    pub async fn clear(&self) {
        let mut entries = self.entries.write().await;
        entries.lru.clear();
        entries.bytes = 0;
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.lru.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.lru.is_empty()
    }

    /// Total bytes currently cached.
    pub async fn size(&self) -> usize {
        self.entries.read().await.bytes
    }

    pub fn capacity(&self) -> usize {
        self.max_bytes
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
