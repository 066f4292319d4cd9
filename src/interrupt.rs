//! Cleanup of temporary paths on termination
//!
//! Rolling a cycle builds the new generation in a staging directory and the
//! metadata store writes records through temporary files. If the process is
//! interrupted, those half-built paths would be left in the backup root. The
//! [`CleanupRegistry`] tracks them while they exist, and the signal listener
//! installed by [`install_signal_cleanup`] removes them before exiting.

use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, warn};

/// Shared set of paths to remove if the process is interrupted
#[derive(Debug, Clone, Default)]
pub struct CleanupRegistry {
    paths: Arc<Mutex<Vec<PathBuf>>>,
}

impl CleanupRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `path` until the returned guard is dropped
    pub fn register(&self, path: &Path) -> CleanupGuard {
        self.paths.lock().push(path.to_path_buf());
        CleanupGuard {
            registry: self.clone(),
            path: path.to_path_buf(),
        }
    }

    /// Paths currently tracked
    pub fn pending(&self) -> Vec<PathBuf> {
        self.paths.lock().clone()
    }

    /// Remove every tracked path from disk, returning how many were removed
    pub fn cleanup(&self) -> usize {
        let paths: Vec<PathBuf> = self.paths.lock().drain(..).collect();
        let mut removed = 0;
        for path in paths {
            let result = match fs::symlink_metadata(&path) {
                Ok(meta) if meta.is_dir() => fs::remove_dir_all(&path),
                Ok(_) => fs::remove_file(&path),
                Err(_) => continue,
            };
            match result {
                Ok(()) => {
                    debug!("Removed temporary path {:?}", path);
                    removed += 1;
                }
                Err(e) => warn!("Failed to remove temporary path {:?}: {}", path, e),
            }
        }
        removed
    }

    fn unregister(&self, path: &Path) {
        let mut paths = self.paths.lock();
        if let Some(pos) = paths.iter().position(|p| p == path) {
            paths.swap_remove(pos);
        }
    }
}

/// Keeps a path registered for cleanup while alive
#[derive(Debug)]
pub struct CleanupGuard {
    registry: CleanupRegistry,
    path: PathBuf,
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        self.registry.unregister(&self.path);
    }
}

/// Remove registered paths and exit when SIGINT or SIGTERM arrives
///
/// Exits with the conventional `128 + signal` status.
pub fn install_signal_cleanup(handle: &Handle, registry: CleanupRegistry) {
    use tokio::signal::unix::{signal, SignalKind};

    handle.spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                return;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to install SIGINT handler: {}", e);
                return;
            }
        };

        let code = tokio::select! {
            _ = sigterm.recv() => 143,
            _ = sigint.recv() => 130,
        };

        let removed = registry.cleanup();
        warn!("Interrupted; removed {} temporary paths", removed);
        std::process::exit(code);
    });
}
