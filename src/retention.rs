//! Time-boxed retention of generated files
//!
//! Every converted output is registered here and deleted once its retention
//! window has elapsed. Deletions run on their own tokio tasks, so they outlive
//! the request that produced the file. Nothing is persisted: files orphaned by
//! a restart are picked up by the age-based sweep instead.

use crate::Result;
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Remove a file, treating "already gone" as success.
///
/// Returns `true` when this call removed the file. Failures are logged and
/// never returned: cleanup is not part of any request's outcome.
pub fn delete_quietly(path: &Path) -> bool {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "Deleted file");
            true
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(path = %path.display(), "File already deleted");
            false
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to delete file");
            false
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionEntry {
    pub path: PathBuf,
    pub registered_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

struct PendingDeletion {
    id: u64,
    entry: RetentionEntry,
    handle: JoinHandle<()>,
}

type Registry = Mutex<HashMap<PathBuf, PendingDeletion>>;

/// A panic while holding the lock leaves the map itself consistent, so keep using it.
fn lock_registry(registry: &Registry) -> MutexGuard<'_, HashMap<PathBuf, PendingDeletion>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory registry of one-shot deferred deletions.
#[derive(Clone, Default)]
pub struct RetentionScheduler {
    pending: Arc<Registry>,
    next_id: Arc<AtomicU64>,
}

impl RetentionScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delete `path` once `after` has elapsed from now.
    ///
    /// Scheduling a path that is already pending replaces the earlier timer, so
    /// each file has at most one entry. Must be called from within a tokio runtime.
    pub fn schedule_deletion(&self, path: PathBuf, after: Duration) -> RetentionEntry {
        let registered_at = Utc::now();
        let expires_at = TimeDelta::from_std(after)
            .ok()
            .and_then(|delta| registered_at.checked_add_signed(delta))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let entry = RetentionEntry {
            path: path.clone(),
            registered_at,
            expires_at,
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        // Hold the lock across the spawn so the task can never observe the
        // registry before its own entry is in it.
        let mut pending = lock_registry(&self.pending);

        let handle = tokio::spawn({
            let registry = Arc::clone(&self.pending);
            let path = path.clone();
            async move {
                tokio::time::sleep(after).await;

                let still_current = {
                    let mut registry = lock_registry(&registry);
                    match registry.get(&path) {
                        Some(current) if current.id == id => {
                            registry.remove(&path);
                            true
                        }
                        _ => false,
                    }
                };

                if still_current && delete_quietly(&path) {
                    info!(path = %path.display(), "Auto-deleted expired file");
                }
            }
        });

        if let Some(previous) = pending.insert(
            path,
            PendingDeletion {
                id,
                entry: entry.clone(),
                handle,
            },
        ) {
            previous.handle.abort();
            debug!(path = %previous.entry.path.display(), "Replaced pending deletion");
        }

        entry
    }

    /// Pending entries, soonest expiry first.
    pub fn pending(&self) -> Vec<RetentionEntry> {
        let mut entries: Vec<RetentionEntry> = lock_registry(&self.pending)
            .values()
            .map(|pending| pending.entry.clone())
            .collect();
        entries.sort_by_key(|entry| entry.expires_at);
        entries
    }

    pub fn contains(&self, path: &Path) -> bool {
        lock_registry(&self.pending).contains_key(path)
    }

    pub fn len(&self) -> usize {
        lock_registry(&self.pending).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Delete regular files in `dir` whose modification time is at least `max_age` ago.
pub fn sweep_expired(dir: &Path, max_age: Duration) -> Result<usize> {
    let now = SystemTime::now();
    let mut deleted = 0;

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(path = %entry.path().display(), error = %e, "Failed to stat file during sweep");
                continue;
            }
        };
        if !metadata.is_file() {
            continue;
        }

        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();

        if age >= max_age && delete_quietly(&entry.path()) {
            deleted += 1;
        }
    }

    Ok(deleted)
}

/// Periodically sweep `dirs` for files older than `max_age`.
pub fn start_sweep_task(
    dirs: Vec<PathBuf>,
    max_age: Duration,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            for dir in &dirs {
                match sweep_expired(dir, max_age) {
                    Ok(0) => {}
                    Ok(count) => info!(dir = %dir.display(), count, "Swept expired files"),
                    Err(e) => warn!(dir = %dir.display(), error = %e, "Sweep failed"),
                }
            }
        }
    })
}
