//! Duplicate reconciliation
//!
//! Renames on the backed-up host make the mirroring step transfer a fresh
//! copy of data the snapshots already hold, breaking the hardlink sharing
//! between "current" and older generations. The [`Reconciler`] finds files
//! with identical contents and re-links them onto one inode again.
//!
//! ## Algorithm
//!
//! Files are visited in a deterministic depth-first order; a path reached a
//! second time (overlapping inputs) is skipped. Two indexes are kept for the
//! whole run:
//!
//! - **by size**: representatives seen so far, one per distinct content
//! - **groups**: every known path of each inode (the hardlink group cache)
//!
//! A visited file whose inode is already a known group simply joins it.
//! Otherwise it is checked against each same-size representative allowed by
//! the [`ScopePolicy`]: the representative is re-stat'ed (and evicted if it
//! vanished), and a full byte comparison decides whether the two are merged.
//! A file matching no representative becomes one.
//!
//! ## Merging
//!
//! The side with more existing hardlinks survives; ties keep the
//! representative. Every known path of the losing inode is replaced by a
//! hardlink to the survivor, via a temporary sibling link renamed over the
//! path so the path never disappears. The survivor then receives the merged
//! permission bits ([`PermissionMerge`]) and the later of both sides' access
//! and modification times.
//!
//! Space is counted as reclaimed only when every link of the losing inode was
//! re-pointed, valued at its allocated blocks.
//!
//! ## Errors
//!
//! Walk and comparison failures are recorded as anomalies and the run goes
//! on. Two candidates on different devices, or a failed relink, abort the run
//! immediately; merges completed before that point stay valid.
//!
//! [`ScopePolicy`]: crate::types::ScopePolicy
//! [`PermissionMerge`]: crate::types::PermissionMerge

use crate::collections::{HashMap, HashSet};
use crate::compare::{ByteComparator, ExactComparator, FsMetadataSource, MetadataSource};
use crate::error::{HardsnapError, Result};
use crate::types::{
    FileIdentity, InodeKey, ReconcileAction, ReconcileOptions, ReconcileProgress, ReconcileReport,
};
use crate::utils::{self, temp_sibling, RELINK_INFIX};
use crate::walk::{TopKey, TreeWalker, WalkEntry, WalkFilter, WalkItem};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, instrument, trace, warn};

/// A file standing in for one distinct content of a given size
#[derive(Debug, Clone)]
struct Representative {
    path: PathBuf,
    top: TopKey,
}

/// Indexes and counters of one run
#[derive(Default)]
struct RunState {
    by_size: HashMap<u64, Vec<Representative>>,
    groups: HashMap<InodeKey, Vec<PathBuf>>,
    seen: HashSet<PathBuf>,
    report: ReconcileReport,
}

impl RunState {
    fn anomaly(&mut self, message: String) {
        warn!("{}", message);
        self.report.anomalies.push(message);
    }
}

/// Finds byte-identical files and merges them into hardlink groups
///
/// # Example
///
/// ```rust,no_run
/// use hardsnap::{Reconciler, ReconcileOptions};
/// use std::path::PathBuf;
///
/// # fn main() -> hardsnap::Result<()> {
/// let reconciler = Reconciler::new(ReconcileOptions::default())?;
/// let report = reconciler.run(vec![PathBuf::from("/backup/host/current")])?;
/// println!("reclaimed {} bytes", report.bytes_reclaimed);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Reconciler<C = ExactComparator, M = FsMetadataSource> {
    options: ReconcileOptions,
    filter: WalkFilter,
    comparator: C,
    metadata: M,
}

impl Reconciler {
    /// Reconciler comparing real file contents and stats
    pub fn new(options: ReconcileOptions) -> Result<Self> {
        Self::with_parts(options, ExactComparator::new(), FsMetadataSource)
    }
}

impl<C: ByteComparator, M: MetadataSource> Reconciler<C, M> {
    /// Reconciler with custom comparison and metadata seams
    pub fn with_parts(options: ReconcileOptions, comparator: C, metadata: M) -> Result<Self> {
        let filter = WalkFilter::new(&options.excludes)?;
        Ok(Self {
            options,
            filter,
            comparator,
            metadata,
        })
    }

    /// Options of this reconciler
    pub fn options(&self) -> &ReconcileOptions {
        &self.options
    }

    /// Reconcile every file under `inputs`
    pub fn run<I>(&self, inputs: I) -> Result<ReconcileReport>
    where
        I: IntoIterator<Item = PathBuf>,
    {
        self.run_with_progress(inputs, None::<fn(ReconcileProgress)>)
    }

    /// Reconcile every file under `inputs`, reporting progress per visited file
    #[instrument(skip_all, fields(dry_run = self.options.dry_run, scope = ?self.options.scope))]
    pub fn run_with_progress<I, F>(&self, inputs: I, progress: Option<F>) -> Result<ReconcileReport>
    where
        I: IntoIterator<Item = PathBuf>,
        F: Fn(ReconcileProgress),
    {
        let start = Instant::now();
        let mut state = RunState::default();
        state.report.dry_run = self.options.dry_run;

        let walker = TreeWalker::new(inputs.into_iter(), self.filter.clone(), self.options.size_floor);
        for item in walker {
            match item {
                Ok(WalkItem::File(entry)) => {
                    if !state.seen.insert(entry.path.clone()) {
                        debug!("Already visited {:?}", entry.path);
                        continue;
                    }
                    state.report.files_visited += 1;
                    if let Some(ref callback) = progress {
                        callback(ReconcileProgress {
                            files_visited: state.report.files_visited,
                            merges: state.report.merges,
                            bytes_reclaimed: state.report.bytes_reclaimed,
                            current_path: entry.path.clone(),
                        });
                    }
                    self.visit(&mut state, entry)?;
                }
                Ok(WalkItem::BelowFloor(path)) => {
                    trace!("Below size floor: {:?}", path);
                    state.report.files_below_floor += 1;
                }
                Ok(WalkItem::Excluded(_)) => state.report.files_excluded += 1,
                Err(e) => state.anomaly(format!("Traversal error: {}", e)),
            }
        }

        state.report.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "Reconciliation {}: {} files visited, {} merges, {} reclaimed",
            if self.options.dry_run { "(dry run) done" } else { "done" },
            state.report.files_visited,
            state.report.merges,
            utils::format_bytes(state.report.bytes_reclaimed)
        );
        Ok(state.report)
    }

    fn visit(&self, state: &mut RunState, entry: WalkEntry) -> Result<()> {
        let key = entry.identity.inode_key();
        if let Some(members) = state.groups.get_mut(&key) {
            members.push(entry.path);
            state.report.already_linked += 1;
            return Ok(());
        }

        let size = entry.identity.size;
        let mut i = 0;
        loop {
            let Some(rep) = state.by_size.get(&size).and_then(|reps| reps.get(i)).cloned() else {
                break;
            };
            if !self.options.scope.allows(&rep.top, &entry.top) {
                i += 1;
                continue;
            }

            let current = match self.metadata.identity(&rep.path) {
                Ok(identity) => identity,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    state.anomaly(format!("Representative {:?} vanished; evicting it", rep.path));
                    state.report.vanished += 1;
                    if let Some(reps) = state.by_size.get_mut(&size) {
                        reps.remove(i);
                    }
                    continue;
                }
                Err(e) => {
                    state.anomaly(format!("Cannot stat representative {:?}: {}", rep.path, e));
                    i += 1;
                    continue;
                }
            };

            if current.dev != entry.identity.dev {
                return Err(HardsnapError::CrossDevice {
                    kept: rep.path,
                    candidate: entry.path,
                });
            }
            if current.size != size {
                i += 1;
                continue;
            }
            if current.inode_key() == key {
                state.groups.entry(key).or_default().push(entry.path);
                state.report.already_linked += 1;
                return Ok(());
            }

            state.report.comparisons += 1;
            match self.comparator.equal(&rep.path, &entry.path) {
                Ok(true) => return self.merge(state, &rep, current, entry),
                Ok(false) => i += 1,
                Err(e) => {
                    state.anomaly(format!("Cannot compare {:?} with {:?}: {}", rep.path, entry.path, e));
                    i += 1;
                }
            }
        }

        trace!("New representative for {} bytes: {:?}", size, entry.path);
        state.groups.entry(key).or_default().push(entry.path.clone());
        state.by_size.entry(size).or_default().push(Representative {
            path: entry.path,
            top: entry.top,
        });
        Ok(())
    }

    fn merge(
        &self,
        state: &mut RunState,
        rep: &Representative,
        rep_identity: FileIdentity,
        entry: WalkEntry,
    ) -> Result<()> {
        let entry_key = entry.identity.inode_key();
        let rep_key = rep_identity.inode_key();

        // Larger hardlink count survives; ties keep the representative
        let (kept_path, kept, loser, loser_key, members) = if entry.identity.nlink > rep_identity.nlink {
            let members = state
                .groups
                .remove(&rep_key)
                .unwrap_or_else(|| vec![rep.path.clone()]);
            (entry.path.clone(), entry.identity, rep_identity, rep_key, members)
        } else {
            (rep.path.clone(), rep_identity, entry.identity, entry_key, vec![entry.path.clone()])
        };

        let reclaimed = if loser.nlink <= members.len() as u64 {
            loser.allocated_bytes()
        } else {
            0
        };

        debug!(
            "Merging {:?} into {:?} ({} paths, {} bytes reclaimed)",
            loser_key, kept_path, members.len(), reclaimed
        );

        if !self.options.dry_run {
            for path in &members {
                relink(&kept_path, path)?;
            }

            let mode = self.options.permission_merge.resolve(&kept, &loser);
            if mode != kept.mode {
                utils::set_permissions(&kept_path, mode)?;
            }
            let mtime = kept.mtime.max(loser.mtime);
            let atime = kept.atime.max(loser.atime);
            utils::set_times(&kept_path, atime, mtime)?;
        }

        let survivor_key = kept.inode_key();
        let group = state.groups.entry(survivor_key).or_default();
        if survivor_key == entry_key {
            group.push(entry.path.clone());
        }
        group.extend(members.iter().cloned());

        state.report.merges += 1;
        state.report.links_created += members.len();
        state.report.bytes_reclaimed += reclaimed;
        state.report.actions.push(ReconcileAction {
            kept: kept_path,
            relinked: members,
            bytes_reclaimed: reclaimed,
        });
        Ok(())
    }
}

/// Replace `path` with a hardlink to `target` without `path` ever disappearing
fn relink(target: &Path, path: &Path) -> Result<()> {
    let failed = |source: io::Error| HardsnapError::RelinkFailed {
        path: path.to_path_buf(),
        target: target.to_path_buf(),
        source,
    };

    let tmp = temp_sibling(path, RELINK_INFIX)?;
    fs::hard_link(target, &tmp).map_err(failed)?;
    if let Err(e) = fs::rename(&tmp, path) {
        if let Err(cleanup) = fs::remove_file(&tmp) {
            warn!("Failed to remove temporary link {:?}: {}", tmp, cleanup);
        }
        return Err(failed(e));
    }
    trace!("Relinked {:?} -> {:?}", path, target);
    Ok(())
}
