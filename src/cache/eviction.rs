//! Eviction of derived artifacts.
//!
//! Levels and tiles can always be regenerated from the source, so they are
//! the only artifacts eviction touches. Source images and metadata persist
//! until an image is explicitly cleared.
//!
//! Last access is the later of the file's modification time, which the store
//! bumps on access, and any newer access this process has seen.
//!
//! A policy combines two optional bounds:
//! - a TTL on last access, and
//! - a cap on the total bytes of derived artifacts, enforced by removing the
//!   least recently accessed first.
//!
//! The server prunes from the request path: [`AutoPrune`] runs one pass in a
//! short-lived task after a new artifact is written, at most once per
//! interval. Nothing runs while the server is idle.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use serde::Serialize;
use tracing::{info, warn};

use super::artifact::METADATA_FILE;
use super::store::{ArtifactStore, TEMP_PREFIX};
use crate::error::StoreError;
use crate::key::CacheKey;

/// Bounds applied by [`ArtifactStore::prune`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionPolicy {
    /// Remove derived artifacts not accessed for this long.
    pub ttl: Option<Duration>,
    /// Keep the total size of derived artifacts under this many bytes.
    pub max_bytes: Option<u64>,
}

impl EvictionPolicy {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = Some(max_bytes);
        self
    }

    pub fn is_unbounded(&self) -> bool {
        self.ttl.is_none() && self.max_bytes.is_none()
    }
}

/// Summary of one prune pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub images: usize,
    pub scanned: usize,
    pub removed: usize,
    pub freed_bytes: u64,
    pub retained_bytes: u64,
    /// Bytes held by sources and metadata, which are never evicted.
    pub exempt_bytes: u64,
}

#[derive(Debug)]
struct Candidate {
    path: PathBuf,
    size: u64,
    last_access: SystemTime,
}

/// Write-triggered pruning with a minimum spacing between passes.
#[derive(Debug)]
pub struct AutoPrune {
    policy: EvictionPolicy,
    interval: Duration,
    last: Mutex<Option<Instant>>,
    running: Arc<AtomicBool>,
}

impl AutoPrune {
    pub fn new(policy: EvictionPolicy, interval: Duration) -> Self {
        Self {
            policy,
            interval,
            last: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn policy(&self) -> &EvictionPolicy {
        &self.policy
    }

    /// Start a prune pass over `store` if one is due and none is running.
    pub fn after_write(&self, store: &Arc<ArtifactStore>) -> Option<tokio::task::JoinHandle<()>> {
        if self.policy.is_unbounded() || !self.claim(Instant::now()) {
            return None;
        }
        let store = store.clone();
        let policy = self.policy.clone();
        let running = self.running.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = store.prune(&policy).await {
                warn!(error = %e, "Prune after write failed");
            }
            running.store(false, Ordering::Release);
        }))
    }

    fn claim(&self, now: Instant) -> bool {
        let mut last = self.last.lock().unwrap_or_else(|p| p.into_inner());
        if last.is_some_and(|at| now.duration_since(at) < self.interval) {
            return false;
        }
        if self.running.swap(true, Ordering::AcqRel) {
            return false;
        }
        *last = Some(now);
        true
    }
}

impl ArtifactStore {
    /// Apply `policy` to every image in the store.
    pub async fn prune(&self, policy: &EvictionPolicy) -> Result<PruneReport, StoreError> {
        self.prune_at(policy, SystemTime::now()).await
    }

    /// Apply `policy` as if the current time were `now`.
    pub async fn prune_at(
        &self,
        policy: &EvictionPolicy,
        now: SystemTime,
    ) -> Result<PruneReport, StoreError> {
        let root = self.root().to_path_buf();
        let access = self.access_snapshot();
        let policy = policy.clone();

        let (report, removed) =
            tokio::task::spawn_blocking(move || prune_blocking(&root, &access, &policy, now))
                .await
                .map_err(|e| StoreError::Task(e.to_string()))??;

        self.forget(&removed);
        info!(
            images = report.images,
            removed = report.removed,
            freed_bytes = report.freed_bytes,
            retained_bytes = report.retained_bytes,
            "Pruned artifact store"
        );
        Ok(report)
    }
}

fn prune_blocking(
    root: &Path,
    access: &HashMap<PathBuf, SystemTime>,
    policy: &EvictionPolicy,
    now: SystemTime,
) -> Result<(PruneReport, Vec<PathBuf>), StoreError> {
    let mut report = PruneReport::default();
    let mut candidates = Vec::new();

    for entry in std::fs::read_dir(root).map_err(|e| StoreError::io(root, e))? {
        let entry = entry.map_err(|e| StoreError::io(root, e))?;
        let is_image = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.parse::<CacheKey>().is_ok());
        if !is_image || !entry.path().is_dir() {
            continue;
        }
        report.images += 1;
        scan_image(&entry.path(), access, &mut candidates, &mut report)?;
    }
    report.scanned = candidates.len();

    let mut removed = Vec::new();
    let mut retained: Vec<Candidate> = Vec::new();

    for candidate in candidates {
        let expired = policy.ttl.is_some_and(|ttl| {
            now.duration_since(candidate.last_access)
                .unwrap_or(Duration::ZERO)
                >= ttl
        });
        if expired {
            evict(candidate, &mut report, &mut removed);
        } else {
            retained.push(candidate);
        }
    }

    if let Some(max_bytes) = policy.max_bytes {
        retained.sort_by(|a, b| a.last_access.cmp(&b.last_access).then(a.path.cmp(&b.path)));
        let mut total: u64 = retained.iter().map(|c| c.size).sum();
        let mut keep = Vec::with_capacity(retained.len());
        for candidate in retained {
            if total > max_bytes {
                total -= candidate.size;
                evict(candidate, &mut report, &mut removed);
            } else {
                keep.push(candidate);
            }
        }
        retained = keep;
    }

    report.retained_bytes = retained.iter().map(|c| c.size).sum();
    remove_empty_dirs(&removed);
    Ok((report, removed))
}

fn scan_image(
    image_dir: &Path,
    access: &HashMap<PathBuf, SystemTime>,
    candidates: &mut Vec<Candidate>,
    report: &mut PruneReport,
) -> Result<(), StoreError> {
    let mut stack = vec![image_dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir).map_err(|e| StoreError::io(&dir, e))? {
            let entry = entry.map_err(|e| StoreError::io(&dir, e))?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(TEMP_PREFIX) {
                continue;
            }
            let metadata = entry.metadata().map_err(|e| StoreError::io(&path, e))?;
            if metadata.is_dir() {
                stack.push(path);
                continue;
            }

            let top_level = dir == image_dir;
            if top_level && (name == METADATA_FILE || name.starts_with("source.")) {
                report.exempt_bytes += metadata.len();
                continue;
            }

            let written = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            let last_access = access
                .get(&path)
                .copied()
                .map_or(written, |seen| seen.max(written));
            candidates.push(Candidate {
                path,
                size: metadata.len(),
                last_access,
            });
        }
    }
    Ok(())
}

fn evict(candidate: Candidate, report: &mut PruneReport, removed: &mut Vec<PathBuf>) {
    match std::fs::remove_file(&candidate.path) {
        Ok(()) => {
            report.removed += 1;
            report.freed_bytes += candidate.size;
            removed.push(candidate.path);
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            removed.push(candidate.path);
        }
        Err(e) => {
            warn!(path = %candidate.path.display(), error = %e, "Failed to evict artifact");
        }
    }
}

/// Remove tile and level directories left empty by eviction.
fn remove_empty_dirs(removed: &[PathBuf]) {
    let mut dirs: Vec<&Path> = removed.iter().filter_map(|p| p.parent()).collect();
    dirs.sort();
    dirs.dedup();
    // Deepest first so a tiles/h1000-... dir goes before tiles/.
    dirs.sort_by_key(|d| std::cmp::Reverse(d.components().count()));
    for dir in dirs {
        // Fails harmlessly when the directory still has entries.
        if std::fs::remove_dir(dir).is_ok() {
            if let Some(parent) = dir.parent() {
                if parent.file_name().is_some_and(|n| n == "tiles") {
                    let _ = std::fs::remove_dir(parent);
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
