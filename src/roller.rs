//! Cycle roller
//!
//! Rolling a cycle ages every generation by one slot and materializes a new
//! generation 1 from "current". The three steps always run in this order:
//!
//! 1. **Delete oldest**: every slot at or beyond `max_generations` is renamed
//!    to a quarantine name and handed to the [`Reaper`] for background deletion.
//! 2. **Shift**: slot `k` is renamed to slot `k + 1` from the highest slot
//!    down, keeping each directory's label. Nothing is copied.
//! 3. **Clone**: "current" is hardlink-cloned into a staging directory which is
//!    then renamed to the generation 1 name.
//!
//! A crash between steps leaves at most one slot empty and never two live
//! slots for the same generation: a shift refuses to overwrite an existing
//! directory, and an interrupted clone only ever exists under its staging name.

use crate::clone::link_clone;
use crate::cycle::CycleDefinition;
use crate::error::{HardsnapError, Result};
use crate::interrupt::CleanupRegistry;
use crate::reaper::{DrainStats, Reaper};
use crate::types::{CloneStats, RollOutcome};
use crate::utils::{is_generated_child, unique_child, REAP_PREFIX, STAGE_PREFIX};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Performs the delete-shift-clone sequence for cycles under one backup root
#[derive(Debug)]
pub struct CycleRoller {
    root: PathBuf,
    reaper: Reaper,
    cleanup: CleanupRegistry,
}

impl CycleRoller {
    /// Create a roller for the generations stored in `root`
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            root: root.into(),
            reaper: Reaper::new()?,
            cleanup: CleanupRegistry::new(),
        })
    }

    /// Share a cleanup registry so interrupted clones are removed on signals
    pub fn with_cleanup(mut self, cleanup: CleanupRegistry) -> Self {
        self.cleanup = cleanup;
        self
    }

    /// Backup root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The background deletion runtime
    pub fn reaper(&self) -> &Reaper {
        &self.reaper
    }

    /// Wait for aged-out generations to finish deleting
    pub fn wait_for_deletions(&mut self) -> DrainStats {
        self.reaper.drain()
    }

    /// Schedule deletion of quarantine and staging directories left in the
    /// root by interrupted runs
    ///
    /// Returns the directories handed to the reaper. Deletions this roller
    /// already scheduled are not scheduled twice.
    pub fn sweep_debris(&mut self) -> Result<Vec<PathBuf>> {
        let mut swept = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            if !is_generated_child(&name, REAP_PREFIX) && !is_generated_child(&name, STAGE_PREFIX) {
                continue;
            }
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let path = entry.path();
            if self.reaper.is_pending(&path) {
                continue;
            }
            info!("Removing {:?} left by an interrupted run", path);
            self.reaper.schedule(path.clone());
            swept.push(path);
        }
        swept.sort();
        Ok(swept)
    }

    /// Roll `cycle`, creating a generation 1 labelled `label` from `current`
    pub fn roll(&mut self, cycle: &CycleDefinition, current: &Path, label: &str) -> Result<RollOutcome> {
        let max = cycle.max_generations;
        let existing = cycle
            .generations(&self.root)
            .map_err(|e| HardsnapError::roll(&cycle.name, "listing generations", e))?;

        let first = cycle.generation_name(1, label);

        // 1. Delete oldest
        let mut deleted = Vec::new();
        let mut live = Vec::new();
        for generation in existing {
            if generation.index >= max {
                let quarantine = self
                    .reaper
                    .quarantine(&generation.path, &self.root)
                    .map_err(|e| HardsnapError::roll(&cycle.name, "deleting the oldest generation", e))?;
                debug!("Aged out {:?} (quarantined as {:?})", generation.path, quarantine);
                deleted.push(generation.path);
            } else if generation.index == 0 {
                warn!("Ignoring {:?}: generation slots start at 1", generation.path);
            } else {
                live.push(generation);
            }
        }

        // 2. Shift, highest slot first
        let mut shifted = 0;
        for generation in live.iter().rev() {
            let target = self.root.join(cycle.generation_name(generation.index + 1, &generation.label));
            if fs::symlink_metadata(&target).is_ok() {
                return Err(HardsnapError::roll(
                    &cycle.name,
                    "shifting generations",
                    io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        format!("{:?} already exists", target),
                    ),
                ));
            }
            fs::rename(&generation.path, &target)
                .map_err(|e| HardsnapError::roll(&cycle.name, "shifting generations", e))?;
            shifted += 1;
        }

        // 3. Clone into a staging directory, then move it into slot 1
        let created = self.root.join(&first);
        let staging = unique_child(&self.root, STAGE_PREFIX);
        let guard = self.cleanup.register(&staging);
        let clone = match self.materialize(current, &staging, &created) {
            Ok(stats) => stats,
            Err(e) => {
                if staging.exists() {
                    if let Err(cleanup_err) = fs::remove_dir_all(&staging) {
                        warn!("Failed to remove staging directory {:?}: {}", staging, cleanup_err);
                    }
                }
                return Err(HardsnapError::roll(&cycle.name, "cloning current", e));
            }
        };
        drop(guard);

        info!(
            "Rolled cycle '{}': {} deleted, {} shifted, created {}",
            cycle.name,
            deleted.len(),
            shifted,
            first
        );

        Ok(RollOutcome {
            deleted,
            shifted,
            created,
            clone,
        })
    }

    fn materialize(&self, current: &Path, staging: &Path, created: &Path) -> Result<CloneStats> {
        if fs::symlink_metadata(created).is_ok() {
            return Err(HardsnapError::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{:?} already exists", created),
            )));
        }
        let stats = link_clone(current, staging)?;
        fs::rename(staging, created)?;
        Ok(stats)
    }
}
