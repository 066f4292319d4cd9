//! Error types for the hardsnap library
//!
//! This module defines every error that snapshot rotation and duplicate
//! reconciliation can raise. Errors fall into three groups:
//!
//! - **Anomalies** that the engines degrade around (a vanished representative,
//!   an unreadable generation record). These are usually logged and never
//!   surface, but [`HardsnapError::is_recoverable`] identifies them when they do.
//! - **Run-fatal** conditions that stop a run immediately because continuing
//!   would risk data loss (cross-device merges, failed relinks, failed rolls).
//! - **Precondition and usage** failures detected before anything is touched.

use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the hardsnap library
pub type Result<T> = std::result::Result<T, HardsnapError>;

/// Main error type for all hardsnap operations
#[derive(Debug, Error)]
pub enum HardsnapError {
    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors reading or writing JSON configuration and reports
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Walk directory error from walkdir crate
    #[error("Walk directory error: {0}")]
    WalkDir(#[from] walkdir::Error),

    /// The "current" snapshot directory does not exist
    #[error("Current snapshot not found: {0:?}")]
    CurrentMissing(PathBuf),

    /// The "current" snapshot exists but cannot be rotated from
    #[error("Current snapshot incomplete at {path:?}: {reason}")]
    SnapshotIncomplete {
        /// Snapshot root
        path: PathBuf,
        /// Why the snapshot is unusable
        reason: String,
    },

    /// A snapshot metadata record is missing or malformed
    #[error("Invalid snapshot record at {path:?}: {reason}")]
    InvalidRecord {
        /// Path of the record file
        path: PathBuf,
        /// What is wrong with it
        reason: String,
    },

    /// A generation directory template could not be parsed
    #[error("Invalid directory template {template:?}: {reason}")]
    InvalidTemplate {
        /// The offending template
        template: String,
        /// Parse failure
        reason: String,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Exclusion pattern parsing error
    #[error("Invalid exclusion pattern: {0}")]
    InvalidPattern(String),

    /// Two byte-identical files live on different devices
    #[error("Cannot link across devices: {kept:?} and {candidate:?}")]
    CrossDevice {
        /// File that would have survived the merge
        kept: PathBuf,
        /// File that would have been relinked
        candidate: PathBuf,
    },

    /// Replacing a path with a hardlink failed mid-merge
    #[error("Failed to relink {path:?} to {target:?}: {source}")]
    RelinkFailed {
        /// Path being replaced
        path: PathBuf,
        /// Surviving inode's path
        target: PathBuf,
        /// Underlying failure
        #[source]
        source: std::io::Error,
    },

    /// A step of a cycle roll failed
    #[error("Roll of cycle '{cycle}' failed while {step}: {source}")]
    RollFailed {
        /// Cycle name
        cycle: String,
        /// Step that failed
        step: &'static str,
        /// Underlying failure
        #[source]
        source: Box<HardsnapError>,
    },

    /// The external mirroring step failed
    #[error("Mirror failed: {0}")]
    Mirror(String),

    /// Command line usage error
    #[error("Usage error: {0}")]
    Usage(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl HardsnapError {
    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        HardsnapError::Internal(msg.into())
    }

    /// Create a configuration error with a custom message
    pub fn config(msg: impl Into<String>) -> Self {
        HardsnapError::InvalidConfiguration(msg.into())
    }

    /// Create a usage error with a custom message
    pub fn usage(msg: impl Into<String>) -> Self {
        HardsnapError::Usage(msg.into())
    }

    /// Create a record error for the given record file
    pub fn record(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        HardsnapError::InvalidRecord {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Wrap an error as the failure of one step of a cycle roll
    pub fn roll(cycle: &str, step: &'static str, source: impl Into<HardsnapError>) -> Self {
        HardsnapError::RollFailed {
            cycle: cycle.to_string(),
            step,
            source: Box::new(source.into()),
        }
    }

    /// Check if this error is an anomaly the engines can degrade around
    pub fn is_recoverable(&self) -> bool {
        matches!(self, HardsnapError::InvalidRecord { .. })
    }

    /// Check if this error aborts a whole run
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            HardsnapError::CrossDevice { .. }
                | HardsnapError::RelinkFailed { .. }
                | HardsnapError::RollFailed { .. }
        )
    }

    /// Process exit status for this error
    ///
    /// `0` is reserved for success, `2` for usage errors and `3` for
    /// cross-device aborts so that callers can tell them apart.
    pub fn exit_code(&self) -> i32 {
        match self {
            HardsnapError::Usage(_) => 2,
            HardsnapError::CrossDevice { .. } => 3,
            HardsnapError::Mirror(_) => 4,
            _ => 1,
        }
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            HardsnapError::CurrentMissing(path) => {
                format!(
                    "No current snapshot at {:?}. Run the mirror step (hardsnap snapshot) before rotating.",
                    path
                )
            }
            HardsnapError::SnapshotIncomplete { path, reason } => {
                format!(
                    "Current snapshot at {:?} is incomplete ({}). Refusing to rotate; re-run the mirror step.",
                    path, reason
                )
            }
            HardsnapError::CrossDevice { kept, candidate } => {
                format!(
                    "{:?} and {:?} are on different filesystems and cannot be hardlinked. \
                     Reconcile each filesystem separately.",
                    kept, candidate
                )
            }
            _ => self.to_string(),
        }
    }
}
