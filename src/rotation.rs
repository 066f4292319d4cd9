//! Snapshot rotation engine
//!
//! The engine owns one backup root laid out like this:
//!
//! ```text
//! /backup/host/
//! ├── current/                  # refreshed by the mirror step
//! │   └── .snapshot_record
//! ├── hour_01_2024-05-01_0640/  # hardlinked clones of earlier "current"s
//! ├── hour_02_2024-05-01_0600/
//! ├── day_01_2024-05-01_0600/
//! └── week_1_2024-04-29_0600/
//! ```
//!
//! [`RotationEngine::rotate`] walks the cycle table in order and decides for
//! each cycle whether to roll it, based on the creation time recorded in
//! "current" and the age of the cycle's generation 1. A gating cycle (the
//! day cycle in the reference table) that does not roll ends the evaluation:
//! the cycles after it are reported as skipped.
//!
//! [`RotationEngine::snapshot`] is the whole periodic job: refresh "current"
//! through a [`TreeMirror`], stamp it, optionally reconcile it against the
//! newest generation, and rotate.

use crate::cycle::{CycleDefinition, CycleTable};
use crate::error::{HardsnapError, Result};
use crate::interrupt::CleanupRegistry;
use crate::mirror::TreeMirror;
use crate::reaper::DrainStats;
use crate::reconcile::Reconciler;
use crate::record::SnapshotRecord;
use crate::roller::CycleRoller;
use crate::types::{CycleDecision, CycleOutcome, ReconcileOptions, ReconcileReport, RollReason, RotationReport};
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Default name of the "current" snapshot directory
pub const DEFAULT_CURRENT_DIR: &str = "current";

/// Configuration of one backup root
#[derive(Debug, Clone)]
pub struct RotationConfig {
    /// Directory holding "current" and all generations
    pub backup_root: PathBuf,
    /// Name of the "current" directory inside the root
    pub current_dir: String,
    /// Cycles in evaluation order
    pub cycles: CycleTable,
    /// Reconcile "current" with the newest generation before rotating
    pub reconcile_before_rotate: Option<ReconcileOptions>,
}

/// Ages generations of hardlinked snapshots through the configured cycles
///
/// # Example
///
/// ```rust,no_run
/// use hardsnap::RotationEngineBuilder;
///
/// # fn main() -> hardsnap::Result<()> {
/// let mut engine = RotationEngineBuilder::new().build("/backup/host")?;
/// let report = engine.rotate()?;
/// println!("rolled: {:?}", report.rolled());
/// engine.wait_for_deletions();
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct RotationEngine {
    config: RotationConfig,
    roller: CycleRoller,
    cleanup: CleanupRegistry,
}

impl RotationEngine {
    /// Engine for `backup_root` with the reference cycles
    pub fn new(backup_root: impl Into<PathBuf>) -> Result<Self> {
        RotationEngineBuilder::new().build(backup_root)
    }

    /// Configuration in use
    pub fn config(&self) -> &RotationConfig {
        &self.config
    }

    /// Path of the "current" snapshot
    pub fn current_path(&self) -> PathBuf {
        self.config.backup_root.join(&self.config.current_dir)
    }

    /// Registry of temporary paths to remove if the process is interrupted
    pub fn cleanup_registry(&self) -> CleanupRegistry {
        self.cleanup.clone()
    }

    /// Handle of the runtime used for background work
    pub fn runtime_handle(&self) -> tokio::runtime::Handle {
        self.roller.reaper().handle()
    }

    /// Wait until aged-out generations are deleted
    pub fn wait_for_deletions(&mut self) -> DrainStats {
        self.roller.wait_for_deletions()
    }

    /// Refresh "current" through `mirror`, stamp it with `now` and rotate
    ///
    /// A mirror failure is returned before any generation is touched.
    #[instrument(skip(self, mirror), fields(root = ?self.config.backup_root))]
    pub fn snapshot(&mut self, mirror: &dyn TreeMirror, now: DateTime<Local>) -> Result<RotationReport> {
        let current = self.current_path();
        mirror.refresh(&current)?;

        let record = SnapshotRecord::new(now);
        record.write_with_cleanup(&current, &self.cleanup)?;
        info!("Stamped {:?} as {}", current, record.label);

        self.rotate()
    }

    /// Evaluate every cycle and roll the ones that are due
    #[instrument(skip(self), fields(root = ?self.config.backup_root))]
    pub fn rotate(&mut self) -> Result<RotationReport> {
        let start = Instant::now();
        let current = self.current_path();
        let record = self.current_record(&current)?;
        let created_at = record.created_at().ok_or_else(|| HardsnapError::SnapshotIncomplete {
            path: current.clone(),
            reason: format!("creation time {} is not representable", record.created),
        })?;

        let mut report = RotationReport {
            current_label: record.label.clone(),
            ..Default::default()
        };
        report.swept = self.roller.sweep_debris()?;

        if let Some(options) = self.config.reconcile_before_rotate.clone() {
            report.reconcile = Some(self.reconcile_current(&current, options)?);
        }

        let cycles = self.config.cycles.clone();
        let mut gated_by: Option<&str> = None;
        for cycle in cycles.iter() {
            if let Some(gate) = gated_by {
                debug!("Skipping cycle '{}': '{}' did not roll", cycle.name, gate);
                report.cycles.push(CycleOutcome {
                    cycle: cycle.name.clone(),
                    decision: CycleDecision::Skipped,
                    time_field: None,
                    roll: None,
                });
                continue;
            }

            let time_field = cycle.calendar_field.value_of(&created_at);
            let (age, missing) = self.generation_age(cycle, record.created, &mut report.anomalies)?;

            let reason = match (cycle.trigger(time_field, age), missing) {
                (Some(RollReason::Forced { .. }), Some(missing)) => Some(missing),
                (reason, _) => reason,
            };

            match reason {
                Some(reason) => {
                    info!("Rolling cycle '{}' ({:?})", cycle.name, reason);
                    let roll = self.roller.roll(cycle, &current, &record.label)?;
                    report.cycles.push(CycleOutcome {
                        cycle: cycle.name.clone(),
                        decision: CycleDecision::Rolled { reason },
                        time_field: Some(time_field),
                        roll: Some(roll),
                    });
                }
                None => {
                    debug!(
                        "Keeping cycle '{}': age {:.2} < {}, field {} != {:?}",
                        cycle.name, age, cycle.forced_interval, time_field, cycle.preference
                    );
                    report.cycles.push(CycleOutcome {
                        cycle: cycle.name.clone(),
                        decision: CycleDecision::Kept { age },
                        time_field: Some(time_field),
                        roll: None,
                    });
                    if cycle.gates_following {
                        gated_by = Some(cycle.name.as_str());
                    }
                }
            }
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        if report.is_noop() {
            info!("Rotation of {} was a no-op", record.label);
        } else {
            info!("Rotated {}: rolled {:?}", record.label, report.rolled());
        }
        Ok(report)
    }

    fn current_record(&self, current: &Path) -> Result<SnapshotRecord> {
        if !current.is_dir() {
            return Err(HardsnapError::CurrentMissing(current.to_path_buf()));
        }
        SnapshotRecord::read(current).map_err(|e| HardsnapError::SnapshotIncomplete {
            path: current.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Age of the cycle's generation 1, infinite when there is none to trust
    fn generation_age(
        &self,
        cycle: &CycleDefinition,
        now: i64,
        anomalies: &mut Vec<String>,
    ) -> Result<(f64, Option<RollReason>)> {
        let Some(generation) = cycle.generation(&self.config.backup_root, 1)? else {
            debug!("Cycle '{}' has no generation 1", cycle.name);
            return Ok((f64::INFINITY, Some(RollReason::NoGeneration)));
        };

        match SnapshotRecord::read(&generation.path) {
            Ok(record) => Ok((cycle.age(now, record.created), None)),
            Err(e) => {
                let message = format!(
                    "Generation {:?} of cycle '{}' has an unreadable record, forcing a roll: {}",
                    generation.path, cycle.name, e
                );
                warn!("{}", message);
                anomalies.push(message);
                Ok((f64::INFINITY, Some(RollReason::UnreadableRecord)))
            }
        }
    }

    /// Re-link files in "current" that lost their link to the newest generation
    fn reconcile_current(&self, current: &Path, options: ReconcileOptions) -> Result<ReconcileReport> {
        let mut inputs = vec![current.to_path_buf()];
        if let Some(first) = self.config.cycles.iter().next() {
            if let Some(generation) = first.generation(&self.config.backup_root, 1)? {
                inputs.push(generation.path);
            }
        }
        info!("Reconciling {:?} before rotation", inputs);
        Reconciler::new(options)?.run(inputs)
    }
}

/// Builder for [`RotationEngine`]
///
/// # Default Values
///
/// - `current_dir`: `"current"`
/// - `cycles`: [`CycleTable::reference`]
/// - `reconcile_before_rotate`: disabled
#[derive(Debug, Clone)]
pub struct RotationEngineBuilder {
    current_dir: String,
    cycles: CycleTable,
    reconcile: Option<ReconcileOptions>,
    cleanup: Option<CleanupRegistry>,
}

impl RotationEngineBuilder {
    /// Create a new builder with default settings
    pub fn new() -> Self {
        Self {
            current_dir: DEFAULT_CURRENT_DIR.to_string(),
            cycles: CycleTable::reference(),
            reconcile: None,
            cleanup: None,
        }
    }

    /// Set the name of the "current" directory
    pub fn current_dir(mut self, name: impl Into<String>) -> Self {
        self.current_dir = name.into();
        self
    }

    /// Set the cycle table
    pub fn cycles(mut self, cycles: CycleTable) -> Self {
        self.cycles = cycles;
        self
    }

    /// Reconcile "current" against the newest generation before each rotation
    pub fn reconcile_before_rotate(mut self, options: ReconcileOptions) -> Self {
        self.reconcile = Some(options);
        self
    }

    /// Share an existing cleanup registry
    pub fn cleanup_registry(mut self, registry: CleanupRegistry) -> Self {
        self.cleanup = Some(registry);
        self
    }

    /// Build the engine for `backup_root`
    pub fn build(self, backup_root: impl Into<PathBuf>) -> Result<RotationEngine> {
        let backup_root = backup_root.into();
        if !backup_root.is_dir() {
            return Err(HardsnapError::config(format!(
                "backup root {:?} is not a directory",
                backup_root
            )));
        }
        if self.current_dir.is_empty() || self.current_dir.contains('/') || self.current_dir.starts_with('.') {
            return Err(HardsnapError::config(format!(
                "invalid current directory name {:?}",
                self.current_dir
            )));
        }
        if let Some(cycle) = self
            .cycles
            .iter()
            .find(|c| c.dir_template.parse_name(&self.current_dir).is_some())
        {
            return Err(HardsnapError::config(format!(
                "current directory {:?} looks like a generation of cycle '{}'",
                self.current_dir, cycle.name
            )));
        }

        let cleanup = self.cleanup.unwrap_or_default();
        let roller = CycleRoller::new(&backup_root)?.with_cleanup(cleanup.clone());

        Ok(RotationEngine {
            config: RotationConfig {
                backup_root,
                current_dir: self.current_dir,
                cycles: self.cycles,
                reconcile_before_rotate: self.reconcile,
            },
            roller,
            cleanup,
        })
    }
}

impl Default for RotationEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
