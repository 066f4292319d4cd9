//! Background deletion of aged-out generations
//!
//! Removing the oldest generation of a cycle can mean deleting millions of
//! directory entries. The [`Reaper`] renames such a directory to a quarantine
//! name (`.reap-<uuid>`) inside the backup root, which takes it out of the slot
//! numbering immediately, and then deletes it on a background task so that the
//! remaining renames and the new clone are not held up.
//!
//! A quarantined directory outlives an interrupted process, so rotation hands
//! any it finds back to the reaper before rolling.
//!
//! Scheduled deletions are fire-and-forget: failures are logged, not returned.
//! [`Reaper::drain`] waits for whatever is still in flight; callers that are
//! about to exit must call it, since a process exit would cut the deletions short.

use crate::error::Result;
use crate::utils::{unique_child, REAP_PREFIX};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Outcome of waiting for scheduled deletions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    /// Deletions that finished successfully
    pub completed: usize,
    /// Deletions that failed
    pub failed: usize,
}

/// Runs recursive deletions on a background runtime
pub struct Reaper {
    runtime: Runtime,
    pending: Vec<(PathBuf, JoinHandle<bool>)>,
}

impl std::fmt::Debug for Reaper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reaper")
            .field("pending", &self.pending.iter().map(|(p, _)| p).collect::<Vec<_>>())
            .finish()
    }
}

impl Reaper {
    /// Create a reaper with its own single-worker runtime
    pub fn new() -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("hardsnap-reaper")
            .enable_all()
            .build()?;
        Ok(Self {
            runtime,
            pending: Vec::new(),
        })
    }

    /// Handle to the background runtime
    pub fn handle(&self) -> Handle {
        self.runtime.handle().clone()
    }

    /// Move `dir` out of the way inside `root` and delete it in the background
    ///
    /// Returns the quarantine path. The rename is synchronous, so when this
    /// returns `dir` no longer exists.
    pub fn quarantine(&mut self, dir: &Path, root: &Path) -> Result<PathBuf> {
        let quarantine = unique_child(root, REAP_PREFIX);
        fs::rename(dir, &quarantine)?;
        debug!("Quarantined {:?} as {:?}", dir, quarantine);
        self.schedule(quarantine.clone());
        Ok(quarantine)
    }

    /// Delete `path` recursively on the background runtime
    pub fn schedule(&mut self, path: PathBuf) {
        let target = path.clone();
        let handle = self.runtime.spawn(async move {
            match tokio::fs::remove_dir_all(&target).await {
                Ok(()) => {
                    debug!("Deleted {:?}", target);
                    true
                }
                Err(e) => {
                    warn!("Background deletion of {:?} failed: {}", target, e);
                    false
                }
            }
        });
        self.pending.push((path, handle));
    }

    /// Whether `path` is already scheduled for deletion
    pub fn is_pending(&self, path: &Path) -> bool {
        self.pending.iter().any(|(p, _)| p == path)
    }

    /// Number of deletions scheduled and not yet drained
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Wait for every scheduled deletion to finish
    pub fn drain(&mut self) -> DrainStats {
        let pending = std::mem::take(&mut self.pending);
        let mut stats = DrainStats::default();
        if pending.is_empty() {
            return stats;
        }

        info!("Waiting for {} background deletions", pending.len());
        for (path, handle) in pending {
            match self.runtime.block_on(handle) {
                Ok(true) => stats.completed += 1,
                Ok(false) => stats.failed += 1,
                Err(e) => {
                    warn!("Deletion task for {:?} did not finish: {}", path, e);
                    stats.failed += 1;
                }
            }
        }
        stats
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            self.drain();
        }
    }
}
