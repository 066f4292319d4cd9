//! Integration tests for hardsnap
//!
//! Simulates a backup root over days of periodic runs: the mirror step
//! changes "current", the engine stamps and rotates it, and the invariants of
//! the generation layout are checked after every run.

use ::hardsnap::*;
use anyhow::Context;
use chrono::{DateTime, Local, TimeZone};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::info;

/// Mirror stand-in that mutates "current" the way a changing host would
pub struct SimulatedHost {
    rng: std::cell::RefCell<StdRng>,
    files: usize,
}

impl SimulatedHost {
    pub fn new(seed: u64, files: usize) -> Self {
        Self {
            rng: std::cell::RefCell::new(StdRng::seed_from_u64(seed)),
            files,
        }
    }
}

impl TreeMirror for SimulatedHost {
    fn refresh(&self, current: &Path) -> Result<()> {
        fs::create_dir_all(current.join("data"))?;
        let mut rng = self.rng.borrow_mut();
        for i in 0..self.files {
            let path = current.join("data").join(format!("file_{:03}.bin", i));
            // Like rsync, replace changed files with a new inode
            if !path.exists() || rng.random_range(0..10) == 0 {
                let size = rng.random_range(100..4_000);
                let content: Vec<u8> = (0..size).map(|_| rng.random::<u8>()).collect();
                let tmp = current.join("data").join(format!(".file_{:03}.tmp", i));
                fs::write(&tmp, content)?;
                fs::rename(&tmp, &path)?;
            }
        }
        Ok(())
    }
}

/// A backup root plus a simulated clock
pub struct BackupHarness {
    pub temp_dir: TempDir,
    pub engine: RotationEngine,
    pub now: DateTime<Local>,
    pub reports: Vec<RotationReport>,
}

impl BackupHarness {
    /// Start on Sunday 2024-06-09 at 00:10 local time
    pub fn new() -> Self {
        Self::starting_at(
            Local
                .with_ymd_and_hms(2024, 6, 9, 0, 10, 0)
                .earliest()
                .unwrap(),
        )
    }

    pub fn starting_at(now: DateTime<Local>) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let engine = RotationEngineBuilder::new().build(temp_dir.path()).unwrap();
        Self {
            temp_dir,
            engine,
            now,
            reports: Vec::new(),
        }
    }

    pub fn root(&self) -> &Path {
        self.temp_dir.path()
    }

    /// One periodic run, then advance the clock
    pub fn run(&mut self, host: &SimulatedHost, step: chrono::Duration) -> anyhow::Result<&RotationReport> {
        let report = self
            .engine
            .snapshot(host, self.now)
            .with_context(|| format!("snapshot at {}", self.now))?;
        self.now += step;
        self.reports.push(report);
        Ok(self.reports.last().unwrap())
    }

    /// Generation indexes per cycle
    pub fn layout(&self) -> BTreeMap<String, Vec<usize>> {
        self.engine
            .config()
            .cycles
            .iter()
            .map(|c| {
                let indexes = c.generations(self.root()).unwrap().iter().map(|g| g.index).collect();
                (c.name.clone(), indexes)
            })
            .collect()
    }

    /// Check the settled-state invariants of the root
    pub fn assert_invariants(&self) {
        for cycle in self.engine.config().cycles.iter() {
            let generations = cycle.generations(self.root()).unwrap();
            assert!(
                generations.len() <= cycle.max_generations,
                "cycle {} has {} generations",
                cycle.name,
                generations.len()
            );
            let indexes: Vec<_> = generations.iter().map(|g| g.index).collect();
            let expected: Vec<_> = (1..=generations.len()).collect();
            assert_eq!(indexes, expected, "cycle {} has gaps", cycle.name);
            for generation in &generations {
                let record = SnapshotRecord::read(&generation.path).unwrap();
                assert_eq!(record.label, generation.label);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_three_days_of_twenty_minute_runs() {
        let mut harness = BackupHarness::new();
        let host = SimulatedHost::new(7, 20);
        let step = chrono::Duration::minutes(20);

        for _ in 0..(3 * 24 * 3) {
            harness.run(&host, step).unwrap();
            harness.engine.wait_for_deletions();
            harness.assert_invariants();
        }

        let layout = harness.layout();
        info!("Final layout: {:?}", layout);

        // Generation counts follow the number of rolls, capped at the maximum
        for cycle in harness.engine.config().cycles.iter() {
            let rolls = harness
                .reports
                .iter()
                .filter(|r| r.rolled().contains(&cycle.name.as_str()))
                .count();
            assert_eq!(layout[&cycle.name].len(), rolls.min(cycle.max_generations));
        }

        // Every second run forces the hour cycle
        assert_eq!(layout["hour"].len(), 12);
        // The first run, the three 6am runs of Sunday, and the 05:50 forced
        // roll plus three 6am runs on Monday and Tuesday
        assert_eq!(layout["day"].len(), 12);
        // The first run and every day roll on Monday
        assert_eq!(layout["week"].len(), 5);
        // No first of the month in range
        assert_eq!(layout["month"].len(), 1);
    }

    #[test]
    fn test_longer_cycles_only_roll_with_the_day() {
        let mut harness = BackupHarness::new();
        let host = SimulatedHost::new(11, 5);

        for _ in 0..(2 * 24) {
            harness.run(&host, chrono::Duration::hours(1)).unwrap();
        }

        for report in &harness.reports {
            let day_rolled = matches!(report.cycles[1].decision, CycleDecision::Rolled { .. });
            for later in &report.cycles[2..] {
                if !day_rolled {
                    assert_eq!(later.decision, CycleDecision::Skipped);
                }
            }
        }
        // Nothing is skipped when the day cycle rolled
        let first = &harness.reports[0];
        assert!(first.cycles.iter().all(|c| c.decision != CycleDecision::Skipped));
    }

    #[test]
    fn test_unchanged_files_share_inodes_across_generations() {
        let mut harness = BackupHarness::new();
        let host = SimulatedHost::new(3, 10);
        for _ in 0..4 {
            harness.run(&host, chrono::Duration::minutes(40)).unwrap();
        }

        let hour = harness.engine.config().cycles.get("hour").unwrap().clone();
        let generations = hour.generations(harness.root()).unwrap();
        assert_eq!(generations.len(), 4);

        let current = harness.root().join("current/data");
        let mut shared = 0;
        for entry in fs::read_dir(&current).unwrap() {
            let entry = entry.unwrap();
            let name = entry.file_name();
            let ino = entry.metadata().unwrap().ino();
            let newest = generations[0].path.join("data").join(&name);
            assert_eq!(fs::metadata(&newest).unwrap().ino(), ino);
            let oldest = generations[3].path.join("data").join(&name);
            if fs::metadata(&oldest).map(|m| m.ino() == ino).unwrap_or(false) {
                shared += 1;
            }
        }
        // Most files did not change over four runs
        assert!(shared > 0);
    }

    #[test]
    fn test_generations_keep_their_own_records() {
        let mut harness = BackupHarness::new();
        let host = SimulatedHost::new(5, 3);
        let first = harness.now;
        harness.run(&host, chrono::Duration::hours(1)).unwrap();
        harness.run(&host, chrono::Duration::hours(1)).unwrap();

        let hour = harness.engine.config().cycles.get("hour").unwrap().clone();
        let oldest = hour.generation(harness.root(), 2).unwrap().unwrap();
        assert_eq!(SnapshotRecord::read(&oldest.path).unwrap().created, first.timestamp());
        let current = SnapshotRecord::read(&harness.engine.current_path()).unwrap();
        assert_eq!(current.created, (first + chrono::Duration::hours(1)).timestamp());
    }

    #[test]
    fn test_reconcile_repairs_renamed_files() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();
        let current = root.join("current");
        let payload = vec![42u8; 64 * 1024];
        fs::create_dir_all(current.join("photos"))?;
        fs::write(current.join("photos/IMG_0001.jpg"), &payload)?;
        SnapshotRecord::from_epoch(1_711_900_000)?.write(&current)?;

        let mut engine = RotationEngine::new(root)?;
        engine.rotate()?;

        // The host renames a directory and the mirror transfers a second copy
        fs::remove_dir_all(current.join("photos"))?;
        fs::create_dir_all(current.join("albums/2024"))?;
        fs::write(current.join("albums/2024/IMG_0001.jpg"), &payload)?;

        let report = Reconciler::new(ReconcileOptions {
            scope: ScopePolicy::DifferentTop,
            ..Default::default()
        })?
        .run(vec![root.to_path_buf()])?;

        assert_eq!(report.merges, 1);
        let all: Vec<PathBuf> = walkdir::WalkDir::new(root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name() == "IMG_0001.jpg")
            .map(|e| e.into_path())
            .collect();
        assert_eq!(all.len(), 5);
        let inodes: std::collections::HashSet<u64> =
            all.iter().map(|p| fs::metadata(p).unwrap().ino()).collect();
        assert_eq!(inodes.len(), 1);
        Ok(())
    }
}
