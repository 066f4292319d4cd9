//! Snapshot metadata records
//!
//! Every snapshot tree ("current" and each generation directory) carries a
//! small record file, `.snapshot_record`, with exactly two lines:
//!
//! ```text
//! 2024-05-01_0640
//! 1714545600
//! ```
//!
//! The first line is the human-readable creation label (local time,
//! `%Y-%m-%d_%H%M`), which also becomes the suffix of generation directory
//! names. The second line is the creation instant in seconds since the epoch,
//! which the rotation engine uses for age comparisons.
//!
//! ## Hardlink safety
//!
//! Generations are hardlinked clones of "current", so the record inside
//! generation 1 is the same inode as the record inside "current" until the
//! next refresh. Records are therefore never rewritten in place: [`SnapshotRecord::write`]
//! writes a temporary file and renames it over the old record, giving
//! "current" a new inode and leaving every generation's record untouched.

use crate::error::{HardsnapError, Result};
use crate::interrupt::CleanupRegistry;
use crate::utils;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// File name of the record inside a snapshot root
pub const RECORD_FILE: &str = ".snapshot_record";

/// chrono format of the creation label
pub const LABEL_FORMAT: &str = "%Y-%m-%d_%H%M";

/// Creation record of one snapshot tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// Human-readable creation label
    pub label: String,
    /// Creation instant, seconds since the epoch
    pub created: i64,
}

impl SnapshotRecord {
    /// Record for a snapshot created at `at`
    pub fn new(at: DateTime<Local>) -> Self {
        Self {
            label: at.format(LABEL_FORMAT).to_string(),
            created: at.timestamp(),
        }
    }

    /// Record for a snapshot created now
    pub fn now() -> Self {
        Self::new(Local::now())
    }

    /// Record for a snapshot created at `epoch` seconds
    pub fn from_epoch(epoch: i64) -> Result<Self> {
        let at = utils::local_time(epoch)
            .ok_or_else(|| HardsnapError::internal(format!("Timestamp {} is out of range", epoch)))?;
        Ok(Self::new(at))
    }

    /// Creation instant as local calendar time
    pub fn created_at(&self) -> Option<DateTime<Local>> {
        utils::local_time(self.created)
    }

    /// Path of the record file inside `dir`
    pub fn path(dir: &Path) -> PathBuf {
        dir.join(RECORD_FILE)
    }

    /// Read the record stored in snapshot root `dir`
    pub fn read(dir: &Path) -> Result<Self> {
        let path = Self::path(dir);
        let text = fs::read_to_string(&path).map_err(|e| HardsnapError::record(&path, e.to_string()))?;
        Self::parse(&path, &text)
    }

    /// Parse the two-line record format
    pub fn parse(path: &Path, text: &str) -> Result<Self> {
        let mut lines = text.lines();
        let label = lines
            .next()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .ok_or_else(|| HardsnapError::record(path, "missing creation label"))?;
        if label.contains('/') || label.contains('\0') {
            return Err(HardsnapError::record(path, "label is not usable in a directory name"));
        }

        let epoch = lines
            .next()
            .map(str::trim)
            .ok_or_else(|| HardsnapError::record(path, "missing creation timestamp"))?;
        let created = epoch
            .parse::<i64>()
            .map_err(|_| HardsnapError::record(path, format!("timestamp {:?} is not an integer", epoch)))?;
        if utils::local_time(created).is_none() {
            return Err(HardsnapError::record(path, format!("timestamp {} is out of range", created)));
        }

        Ok(Self {
            label: label.to_string(),
            created,
        })
    }

    /// The on-disk representation
    pub fn render(&self) -> String {
        format!("{}\n{}\n", self.label, self.created)
    }

    /// Atomically write this record into snapshot root `dir`
    pub fn write(&self, dir: &Path) -> Result<()> {
        self.write_inner(dir, None)
    }

    /// Like [`write`](Self::write), removing the temporary file if interrupted
    pub fn write_with_cleanup(&self, dir: &Path, cleanup: &CleanupRegistry) -> Result<()> {
        self.write_inner(dir, Some(cleanup))
    }

    fn write_inner(&self, dir: &Path, cleanup: Option<&CleanupRegistry>) -> Result<()> {
        let mut tmp = tempfile::Builder::new()
            .prefix(".snapshot_record.")
            .tempfile_in(dir)?;
        let _guard = cleanup.map(|c| c.register(tmp.path()));

        tmp.write_all(self.render().as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(Self::path(dir)).map_err(|e| e.error)?;

        debug!("Wrote snapshot record {} into {:?}", self.label, dir);
        Ok(())
    }
}
