//! Core data types used throughout the hardsnap library
//!
//! This module contains the data structures shared by the rotation and
//! reconciliation engines.
//!
//! ## Overview
//!
//! The types in this module represent:
//! - **File identity**: `FileIdentity`, `InodeKey` - what the reconciliation engine
//!   captures for every path it visits
//! - **Policies**: `ScopePolicy`, `PermissionMerge`, `ReconcileOptions` - knobs of a
//!   reconciliation run
//! - **Results**: `ReconcileReport`, `RotationReport`, `RollOutcome`, `CloneStats` -
//!   what each operation did (or would have done in a dry run)
//!
//! ## Examples
//!
//! ```rust
//! use hardsnap::types::{PermissionMerge, ReconcileOptions, ScopePolicy};
//!
//! let options = ReconcileOptions {
//!     dry_run: true,
//!     scope: ScopePolicy::DifferentTop,
//!     permission_merge: PermissionMerge::Union,
//!     ..Default::default()
//! };
//! assert_eq!(options.size_floor, 10240);
//! ```

use filetime::FileTime;
use serde::{Deserialize, Serialize};
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;

/// Default minimum size of files considered for reconciliation
pub const DEFAULT_SIZE_FLOOR: u64 = 10240;

/// Identifies one storage inode: the key of a hardlink group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InodeKey {
    /// Device id (`st_dev`)
    pub dev: u64,
    /// Inode number (`st_ino`)
    pub ino: u64,
}

/// Identity of a file as captured when a path is stat'ed
///
/// Two files are only candidate duplicates when their sizes match; equality is
/// always confirmed with a full content comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileIdentity {
    /// Device id
    pub dev: u64,
    /// Inode number
    pub ino: u64,
    /// Logical size in bytes
    pub size: u64,
    /// Number of hardlinks to the inode
    pub nlink: u64,
    /// Permission bits (`mode & 0o7777`)
    pub mode: u32,
    /// Allocated 512-byte blocks
    pub blocks: u64,
    /// Last modification time
    pub mtime: FileTime,
    /// Last access time
    pub atime: FileTime,
}

impl FileIdentity {
    /// Capture the identity from already fetched metadata
    pub fn from_metadata(meta: &fs::Metadata) -> Self {
        Self {
            dev: meta.dev(),
            ino: meta.ino(),
            size: meta.len(),
            nlink: meta.nlink(),
            mode: meta.mode() & 0o7777,
            blocks: meta.blocks(),
            mtime: FileTime::from_last_modification_time(meta),
            atime: FileTime::from_last_access_time(meta),
        }
    }

    /// The hardlink group this file belongs to
    pub fn inode_key(&self) -> InodeKey {
        InodeKey {
            dev: self.dev,
            ino: self.ino,
        }
    }

    /// Bytes actually allocated on disk for this inode
    pub fn allocated_bytes(&self) -> u64 {
        self.blocks * 512
    }
}

/// Restricts which files may be merged with each other
///
/// The "top" of a file is the first directory level beneath the input it was
/// found under, so with `/backup` as input, `/backup/day_01_x/...` and
/// `/backup/day_02_y/...` have different tops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScopePolicy {
    /// Merge regardless of location
    #[default]
    Any,
    /// Only merge files under the same top-level subtree
    SameTop,
    /// Only merge files under different top-level subtrees
    DifferentTop,
}

impl ScopePolicy {
    /// Whether two files with the given tops may be merged
    pub fn allows<T: PartialEq>(&self, a: &T, b: &T) -> bool {
        match self {
            ScopePolicy::Any => true,
            ScopePolicy::SameTop => a == b,
            ScopePolicy::DifferentTop => a != b,
        }
    }
}

/// How the surviving file's permission bits are chosen after a merge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionMerge {
    /// Permissions of whichever side was modified last
    #[default]
    NewerWins,
    /// Bitwise OR of both sides' permissions
    Union,
}

impl PermissionMerge {
    /// Resolve the merged permission bits of `kept` and `other`
    ///
    /// Ties on modification time keep `kept`'s bits.
    pub fn resolve(&self, kept: &FileIdentity, other: &FileIdentity) -> u32 {
        match self {
            PermissionMerge::NewerWins => {
                if other.mtime > kept.mtime {
                    other.mode
                } else {
                    kept.mode
                }
            }
            PermissionMerge::Union => kept.mode | other.mode,
        }
    }
}

/// Options for a reconciliation run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileOptions {
    /// Detect and report only; never touch the filesystem
    pub dry_run: bool,
    /// Files smaller than this many bytes are ignored
    pub size_floor: u64,
    /// Which pairs of files may be merged
    pub scope: ScopePolicy,
    /// How permissions are reconciled
    pub permission_merge: PermissionMerge,
    /// Additional glob patterns to exclude
    pub excludes: Vec<String>,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            size_floor: DEFAULT_SIZE_FLOOR,
            scope: ScopePolicy::Any,
            permission_merge: PermissionMerge::NewerWins,
            excludes: Vec::new(),
        }
    }
}

/// One merge performed (or planned, in a dry run)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconcileAction {
    /// Path whose inode survived
    pub kept: PathBuf,
    /// Paths re-pointed at the surviving inode
    pub relinked: Vec<PathBuf>,
    /// Bytes freed by this merge
    pub bytes_reclaimed: u64,
}

/// Summary of a reconciliation run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Whether the run was a dry run
    pub dry_run: bool,
    /// Regular files visited
    pub files_visited: usize,
    /// Files ignored for being below the size floor
    pub files_below_floor: usize,
    /// Files ignored by exclusion patterns
    pub files_excluded: usize,
    /// Files found to already share a known inode
    pub already_linked: usize,
    /// Full content comparisons performed
    pub comparisons: usize,
    /// Hardlink groups merged
    pub merges: usize,
    /// Paths replaced by hardlinks
    pub links_created: usize,
    /// Disk space reclaimed in bytes
    pub bytes_reclaimed: u64,
    /// Representatives that disappeared during the scan
    pub vanished: usize,
    /// Merges in the order they happened
    pub actions: Vec<ReconcileAction>,
    /// Non-fatal anomalies
    pub anomalies: Vec<String>,
    /// Wall-clock time in milliseconds
    pub duration_ms: u64,
}

impl ReconcileReport {
    /// Whether the run changed (or would change) anything
    pub fn has_changes(&self) -> bool {
        self.merges > 0
    }
}

/// Progress snapshot handed to reconciliation progress callbacks
#[derive(Debug, Clone)]
pub struct ReconcileProgress {
    /// Files visited so far
    pub files_visited: usize,
    /// Merges so far
    pub merges: usize,
    /// Bytes reclaimed so far
    pub bytes_reclaimed: u64,
    /// File currently being examined
    pub current_path: PathBuf,
}

/// Statistics from a hardlinked clone
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloneStats {
    /// Directories recreated
    pub directories: usize,
    /// Hardlinks created
    pub hardlinks: usize,
    /// Symbolic links recreated
    pub symlinks: usize,
}

/// What a single roll of one cycle did
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollOutcome {
    /// Generation directories quarantined for background deletion
    pub deleted: Vec<PathBuf>,
    /// Generation directories shifted up one slot
    pub shifted: usize,
    /// The new generation 1 directory
    pub created: PathBuf,
    /// Clone statistics of the new generation
    pub clone: CloneStats,
}

/// Why a cycle rolled
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "reason")]
pub enum RollReason {
    /// The calendar field matched the cycle's preference
    Preference {
        /// Value of the calendar field
        value: u32,
    },
    /// Generation 1 was at least the forced interval old
    Forced {
        /// Age in the cycle's unit
        age: f64,
    },
    /// The cycle had no generation 1 yet
    NoGeneration,
    /// Generation 1's record could not be read
    UnreadableRecord,
}

/// Decision taken for one cycle during rotation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "decision")]
pub enum CycleDecision {
    /// The cycle rolled
    Rolled {
        /// Trigger
        #[serde(flatten)]
        reason: RollReason,
    },
    /// The cycle was evaluated and left alone
    Kept {
        /// Age of generation 1 in the cycle's unit
        age: f64,
    },
    /// A gating cycle above did not roll, so this one was not evaluated
    Skipped,
}

/// Per-cycle entry of a rotation report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleOutcome {
    /// Cycle name
    pub cycle: String,
    /// Decision taken
    pub decision: CycleDecision,
    /// Calendar field value of the current snapshot (unset when skipped)
    pub time_field: Option<u32>,
    /// Details of the roll, if one happened
    pub roll: Option<RollOutcome>,
}

/// Summary of one rotation pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RotationReport {
    /// Label of the current snapshot that was rotated in
    pub current_label: String,
    /// One entry per configured cycle, in evaluation order
    pub cycles: Vec<CycleOutcome>,
    /// Non-fatal anomalies (unreadable records and the like)
    pub anomalies: Vec<String>,
    /// Reconciliation run before rotation, when enabled
    pub reconcile: Option<ReconcileReport>,
    /// Directories of interrupted runs scheduled for deletion
    #[serde(default)]
    pub swept: Vec<PathBuf>,
    /// Wall-clock time in milliseconds
    pub duration_ms: u64,
}

impl RotationReport {
    /// Names of the cycles that rolled
    pub fn rolled(&self) -> Vec<&str> {
        self.cycles
            .iter()
            .filter(|c| matches!(c.decision, CycleDecision::Rolled { .. }))
            .map(|c| c.cycle.as_str())
            .collect()
    }

    /// Whether the pass changed nothing
    pub fn is_noop(&self) -> bool {
        self.rolled().is_empty()
    }
}
