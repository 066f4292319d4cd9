//! # hardsnap - Hardlinked snapshot rotation
//!
//! Space-efficient, point-in-time snapshots of a mirrored file tree, kept in
//! hourly, daily, weekly and monthly generations that share unchanged files
//! through hardlinks.
//!
//! ## Overview
//!
//! A backup root holds one "current" tree, refreshed by an external mirror
//! (rsync over ssh), and any number of generation directories. hardsnap:
//! - Decides after each refresh which cycles are due and rolls them
//! - Rolls a cycle by aging its generations one slot and cloning "current"
//!   into a new generation 1 with hardlinks (only directories are copied)
//! - Deletes aged-out generations in the background
//! - Repairs hardlink sharing broken by renames, merging byte-identical files
//!   back into one inode and reporting the reclaimed space
//!
//! ## Architecture
//!
//! - **Snapshot records**: every snapshot tree carries `.snapshot_record`
//!   with its creation label and epoch seconds ([`record`])
//! - **Cycle table**: immutable, ordered cycle definitions with their
//!   calendar preference and forced interval ([`cycle`])
//! - **Cycle roller**: delete oldest, shift, clone ([`roller`])
//! - **Rotation engine**: the per-cycle decision and gating ([`rotation`])
//! - **Reconciler**: size index, hardlink group cache and byte comparison
//!   ([`reconcile`])
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hardsnap::{RotationEngineBuilder, RsyncMirror};
//! use chrono::Local;
//!
//! # fn main() -> hardsnap::Result<()> {
//! let mut engine = RotationEngineBuilder::new().build("/backup/web1")?;
//!
//! // Refresh "current", stamp it and rotate
//! let mirror = RsyncMirror::new("backup@web1:/srv");
//! let report = engine.snapshot(&mirror, Local::now())?;
//! println!("rolled {:?}", report.rolled());
//!
//! // Let background deletions finish before exiting
//! engine.wait_for_deletions();
//! # Ok(())
//! # }
//! ```
//!
//! ### Reconciling duplicates
//!
//! ```rust,no_run
//! use hardsnap::{PermissionMerge, ReconcileOptions, Reconciler, ScopePolicy};
//! use std::path::PathBuf;
//!
//! # fn main() -> hardsnap::Result<()> {
//! let options = ReconcileOptions {
//!     dry_run: true,
//!     scope: ScopePolicy::DifferentTop,
//!     permission_merge: PermissionMerge::Union,
//!     ..Default::default()
//! };
//! let report = Reconciler::new(options)?.run(vec![PathBuf::from("/backup/web1")])?;
//! println!("{} merges would reclaim {} bytes", report.merges, report.bytes_reclaimed);
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency
//!
//! Both engines run single-threaded, one pass at a time. The only background
//! work is deletion of quarantined generations. There is no locking: running
//! two hardsnap processes on the same backup root is unsupported.
//!
//! ## Error Handling
//!
//! All operations return `Result<T, HardsnapError>`. Anomalies such as an
//! unreadable generation record or a vanished file are logged and reported
//! without failing the run; cross-device merges and failed relinks abort it.
//!
//! ## Platform
//!
//! Unix only: hardlinks, inode numbers and allocated block counts are
//! required.

// Public API modules
pub mod clone;
pub mod compare;
pub mod cycle;
pub mod error;
pub mod interrupt;
pub mod mirror;
pub mod reaper;
pub mod reconcile;
pub mod record;
pub mod roller;
pub mod rotation;
pub mod template;
pub mod types;
pub mod walk;

// Internal modules (not part of public API)
mod collections;
pub mod utils;

// Re-export main types for convenience
pub use compare::{ByteComparator, ExactComparator, FsMetadataSource, MetadataSource};
pub use cycle::{CalendarField, CycleDefinition, CycleTable, Generation, IntervalUnit};
pub use error::{HardsnapError, Result};
pub use interrupt::{install_signal_cleanup, CleanupRegistry};
pub use mirror::{RsyncMirror, TreeMirror};
pub use reaper::{DrainStats, Reaper};
pub use reconcile::Reconciler;
pub use record::SnapshotRecord;
pub use roller::CycleRoller;
pub use rotation::{RotationConfig, RotationEngine, RotationEngineBuilder};
pub use template::DirTemplate;
pub use types::*;
