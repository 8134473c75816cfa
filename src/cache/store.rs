//! On-disk artifact store.
//!
//! Each rendered image owns one directory under the cache root, named by its
//! [`CacheKey`]. Artifacts are content-addressed by their [`ArtifactId`], so a
//! file that exists is by definition correct: writers never overwrite, and
//! every write goes to a temporary file in the target directory that is then
//! linked into place. Readers therefore see either no file or a complete one.
//!
//! Once written, an artifact's modification time records its last access:
//! disk reads bump it, and memory hits bump it at most once per
//! [`ACCESS_PERSIST_INTERVAL`]. Eviction in a later process, or from the
//! `prune` command, sees the same recency the server saw.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use super::artifact::{ArtifactId, METADATA_FILE};
use crate::error::StoreError;
use crate::key::CacheKey;

/// Name prefix of in-progress writes. Scans skip these.
pub(crate) const TEMP_PREFIX: &str = ".tmp-";

/// Minimum spacing between persisted access times for memory-served hits.
pub const ACCESS_PERSIST_INTERVAL: Duration = Duration::from_secs(60);

/// Result of a store write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The artifact was written by this call.
    Created,
    /// An identical artifact was already present; nothing was written.
    AlreadyPresent,
}

/// Counters for store activity since the store was opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub skipped_writes: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    skipped_writes: AtomicU64,
}

/// Keyed directories of immutable artifacts under one cache root.
pub struct ArtifactStore {
    root: PathBuf,
    /// Last read or write per artifact path, feeding LRU eviction.
    access: Mutex<HashMap<PathBuf, SystemTime>>,
    counters: Counters,
}

impl ArtifactStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| StoreError::io(&root, e))?;
        debug!(root = %root.display(), "Opened artifact store");
        Ok(Self {
            root,
            access: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn image_dir(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.to_string())
    }

    pub fn path_of(&self, id: &ArtifactId) -> PathBuf {
        self.image_dir(&id.key).join(id.relative_path())
    }

    /// Read an artifact. A missing artifact is `Ok(None)`, not an error.
    pub async fn read(&self, id: &ArtifactId) -> Result<Option<Bytes>, StoreError> {
        let path = self.path_of(id);
        let now = SystemTime::now();
        let read_path = path.clone();
        let result = tokio::task::spawn_blocking(move || read_and_mark(&read_path, now))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?;
        match result {
            Ok(data) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                lock(&self.access).insert(path, now);
                Ok(Some(Bytes::from(data)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    /// Note an access served without reading the file, such as a memory
    /// cache hit.
    pub async fn record_access(&self, id: &ArtifactId) {
        let path = self.path_of(id);
        let now = SystemTime::now();
        let stale = {
            let mut access = lock(&self.access);
            let stale = access.get(&path).map_or(true, |last| {
                now.duration_since(*last).unwrap_or(Duration::ZERO) >= ACCESS_PERSIST_INTERVAL
            });
            access.insert(path.clone(), now);
            stale
        };
        if !stale {
            return;
        }
        let marked = path.clone();
        let result = tokio::task::spawn_blocking(move || mark_accessed(&marked, now)).await;
        if let Ok(Err(e)) = result {
            debug!(path = %path.display(), error = %e, "Could not persist access time");
        }
    }

    pub async fn exists(&self, id: &ArtifactId) -> bool {
        tokio::fs::try_exists(self.path_of(id))
            .await
            .unwrap_or(false)
    }

    /// Write an artifact unless it already exists.
    pub async fn write(&self, id: &ArtifactId, data: Bytes) -> Result<WriteOutcome, StoreError> {
        let path = self.path_of(id);
        let size = data.len();
        let outcome = write_new_file(path.clone(), data).await?;
        match outcome {
            WriteOutcome::Created => {
                self.counters.writes.fetch_add(1, Ordering::Relaxed);
                debug!(path = %path.display(), bytes = size, "Stored artifact");
            }
            WriteOutcome::AlreadyPresent => {
                self.counters.skipped_writes.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.touch(path);
        Ok(outcome)
    }

    /// Read the JSON metadata document of an image.
    pub async fn read_metadata<T: DeserializeOwned>(
        &self,
        key: &CacheKey,
    ) -> Result<Option<T>, StoreError> {
        let path = self.image_dir(key).join(METADATA_FILE);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(&path, e)),
        };
        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|e| StoreError::CorruptMetadata {
                path: path.display().to_string(),
                message: e.to_string(),
            })
    }

    /// Write the metadata document of an image. Its presence marks the image
    /// as complete, so it must be written after the source artifact.
    pub async fn write_metadata<T: Serialize>(
        &self,
        key: &CacheKey,
        metadata: &T,
    ) -> Result<WriteOutcome, StoreError> {
        let path = self.image_dir(key).join(METADATA_FILE);
        let data = serde_json::to_vec_pretty(metadata).map_err(|e| StoreError::CorruptMetadata {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        write_new_file(path, Bytes::from(data)).await
    }

    /// Every image directory with a parseable key.
    pub async fn list_images(&self) -> Result<Vec<CacheKey>, StoreError> {
        let mut dir = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| StoreError::io(&self.root, e))?;
        let mut keys = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&self.root, e))?
        {
            if let Some(key) = entry.file_name().to_str().and_then(|n| n.parse().ok()) {
                keys.push(key);
            }
        }
        keys.sort_by_key(|k: &CacheKey| k.to_string());
        Ok(keys)
    }

    /// Remove every artifact of one image, source included.
    ///
    /// Returns `false` when the image had nothing on disk.
    pub async fn clear_image(&self, key: &CacheKey) -> Result<bool, StoreError> {
        let dir = self.image_dir(key);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                lock(&self.access).retain(|path, _| !path.starts_with(&dir));
                info!(key = %key, "Cleared image artifacts");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::io(&dir, e)),
        }
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            skipped_writes: self.counters.skipped_writes.load(Ordering::Relaxed),
        }
    }

    fn touch(&self, path: PathBuf) {
        lock(&self.access).insert(path, SystemTime::now());
    }

    pub(super) fn access_snapshot(&self) -> HashMap<PathBuf, SystemTime> {
        lock(&self.access).clone()
    }

    pub(super) fn forget(&self, paths: &[PathBuf]) {
        let mut access = lock(&self.access);
        for path in paths {
            access.remove(path);
        }
    }
}

/// Read `path` and stamp `now` as its modification time.
fn read_and_mark(path: &Path, now: SystemTime) -> std::io::Result<Vec<u8>> {
    let mut file = std::fs::File::open(path)?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;
    if let Err(e) = file.set_modified(now) {
        debug!(path = %path.display(), error = %e, "Could not persist access time");
    }
    Ok(data)
}

fn mark_accessed(path: &Path, now: SystemTime) -> std::io::Result<()> {
    std::fs::File::open(path)?.set_modified(now)
}

/// Create `path` with `data` atomically, leaving an existing file untouched.
async fn write_new_file(path: PathBuf, data: Bytes) -> Result<WriteOutcome, StoreError> {
    tokio::task::spawn_blocking(move || {
        let parent = path
            .parent()
            .ok_or_else(|| StoreError::Task(format!("{} has no parent", path.display())))?;
        std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        if path.exists() {
            return Ok(WriteOutcome::AlreadyPresent);
        }

        let mut tmp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(parent)
            .map_err(|e| StoreError::io(parent, e))?;
        tmp.write_all(&data)
            .and_then(|_| tmp.flush())
            .map_err(|e| StoreError::io(tmp.path(), e))?;

        match tmp.persist_noclobber(&path) {
            Ok(_) => Ok(WriteOutcome::Created),
            // Lost a race with an identical writer; the temp file is dropped.
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {
                Ok(WriteOutcome::AlreadyPresent)
            }
            Err(e) => Err(StoreError::io(&path, e.error)),
        }
    })
    .await
    .map_err(|e| StoreError::Task(e.to_string()))?
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// Tests
// =============================================================================
