//! Chaos testing for hardsnap
//!
//! Damages a backup root the way crashes, operators and disk errors do, then
//! checks that rotation and reconciliation keep working without losing data.

use ::hardsnap::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use tracing::{info, warn};

/// Seconds between simulated runs; forces the hour cycle every time
const RUN_INTERVAL: i64 = 45 * 60;

/// A backup root with a simulated clock and a seeded source of damage
pub struct BackupChaosTest {
    pub temp_dir: TempDir,
    pub engine: RotationEngine,
    pub chaos_engine: ChaosEngine,
    pub clock: i64,
}

impl BackupChaosTest {
    pub fn new(seed: u64) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let current = temp_dir.path().join("current");
        fs::create_dir_all(current.join("etc")).unwrap();
        fs::write(current.join("etc/hosts"), "127.0.0.1 localhost\n").unwrap();
        fs::write(current.join("etc/blob.bin"), vec![9u8; 20_000]).unwrap();

        let engine = RotationEngineBuilder::new().build(temp_dir.path()).unwrap();
        Self {
            temp_dir,
            engine,
            chaos_engine: ChaosEngine::new(seed),
            // 2024-06-03 12:00 UTC, a Monday afternoon in most zones
            clock: 1_717_416_000,
        }
    }

    pub fn root(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn current(&self) -> PathBuf {
        self.engine.current_path()
    }

    /// Stamp "current" with the simulated clock and rotate
    pub fn run(&mut self) -> Result<RotationReport> {
        SnapshotRecord::from_epoch(self.clock)?.write(&self.current())?;
        self.clock += RUN_INTERVAL;
        self.engine.rotate()
    }

    pub fn hour_cycle(&self) -> CycleDefinition {
        self.engine.config().cycles.get("hour").unwrap().clone()
    }

    pub fn hour_indexes(&self) -> Vec<usize> {
        self.hour_cycle()
            .generations(self.root())
            .unwrap()
            .iter()
            .map(|g| g.index)
            .collect()
    }
}

/// Seeded generator of damage
pub struct ChaosEngine {
    rng: StdRng,
}

impl ChaosEngine {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Replace a snapshot record with garbage
    ///
    /// The record is unlinked first: generations share it through hardlinks.
    pub fn corrupt_record(&mut self, dir: &Path) {
        let garbage: Vec<u8> = (0..self.rng.random_range(0..40)).map(|_| self.rng.random()).collect();
        let path = SnapshotRecord::path(dir);
        let _ = fs::remove_file(&path);
        fs::write(&path, garbage).unwrap();
    }

    /// Remove a random directory among `dirs`
    pub fn remove_one(&mut self, dirs: &[PathBuf]) -> Option<PathBuf> {
        if dirs.is_empty() {
            return None;
        }
        let victim = dirs[self.rng.random_range(0..dirs.len())].clone();
        fs::remove_dir_all(&victim).unwrap();
        Some(victim)
    }

    /// Leave behind the kind of debris an interrupted run would
    pub fn leave_debris(&mut self, root: &Path) -> Vec<PathBuf> {
        let mut debris = Vec::new();
        for prefix in [".stage-", ".reap-"] {
            let dir = root.join(format!("{}{:032x}", prefix, self.rng.random::<u128>()));
            fs::create_dir_all(dir.join("etc")).unwrap();
            fs::write(dir.join("etc/blob.bin"), vec![9u8; 20_000]).unwrap();
            debris.push(dir);
        }
        debris
    }

    pub fn coin(&mut self, numerator: u32, denominator: u32) -> bool {
        self.rng.random_range(0..denominator) < numerator
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupted_run_debris_is_swept() {
        let mut test = BackupChaosTest::new(1);
        test.run().unwrap();
        let root = test.root().to_path_buf();
        let mut debris = test.chaos_engine.leave_debris(&root);
        debris.sort();

        let report = test.run().unwrap();
        assert!(report.rolled().contains(&"hour"));
        assert_eq!(report.swept, debris);
        test.engine.wait_for_deletions();
        assert_eq!(test.hour_indexes(), vec![1, 2]);
        for dir in &debris {
            assert!(!dir.exists(), "debris {:?} should be deleted", dir);
        }
    }

    #[test]
    fn test_reconcile_skips_debris() {
        let mut test = BackupChaosTest::new(6);
        test.run().unwrap();
        let root = test.root().to_path_buf();
        let debris = test.chaos_engine.leave_debris(&root);

        // Reconciliation must not link into half-built or doomed trees
        let report = Reconciler::new(ReconcileOptions::default())
            .unwrap()
            .run(vec![root.clone()])
            .unwrap();
        assert_eq!(report.merges, 0);
        for dir in &debris {
            assert_eq!(fs::metadata(dir.join("etc/blob.bin")).unwrap().nlink(), 1);
        }
    }

    #[test]
    fn test_gap_in_generations_survives_roll() {
        let mut test = BackupChaosTest::new(2);
        for _ in 0..5 {
            test.run().unwrap();
        }
        assert_eq!(test.hour_indexes(), vec![1, 2, 3, 4, 5]);

        let third = test.hour_cycle().generation(test.root(), 3).unwrap().unwrap();
        fs::remove_dir_all(&third.path).unwrap();

        test.run().unwrap();
        assert_eq!(test.hour_indexes(), vec![1, 2, 3, 5, 6]);

        // The gap ages out like any other slot
        for _ in 0..10 {
            test.run().unwrap();
        }
        assert_eq!(test.hour_indexes(), (1..=12).collect::<Vec<_>>());
    }

    #[test]
    fn test_corrupt_newest_record_forces_roll() {
        let mut test = BackupChaosTest::new(3);
        test.run().unwrap();

        let newest = test.hour_cycle().generation(test.root(), 1).unwrap().unwrap();
        test.chaos_engine.corrupt_record(&newest.path);

        // Run again right away: only the corrupt record can trigger the roll
        test.clock -= RUN_INTERVAL - 60;
        let report = test.run().unwrap();
        let hour = report.cycles.iter().find(|c| c.cycle == "hour").unwrap();
        assert_eq!(
            hour.decision,
            CycleDecision::Rolled {
                reason: RollReason::UnreadableRecord
            }
        );
        assert_eq!(report.anomalies.len(), 1);
        assert!(report.anomalies[0].contains("unreadable record"));

        // The damaged generation is kept, one slot older
        assert_eq!(test.hour_indexes(), vec![1, 2]);
    }

    #[test]
    fn test_missing_current_record_blocks_rotation() {
        let mut test = BackupChaosTest::new(4);
        test.run().unwrap();
        fs::remove_file(SnapshotRecord::path(&test.current())).unwrap();

        let before = test.hour_indexes();
        let err = test.engine.rotate().unwrap_err();
        assert!(matches!(err, HardsnapError::SnapshotIncomplete { .. }));
        assert_eq!(test.hour_indexes(), before);
    }

    #[test]
    fn test_random_damage_over_many_runs() {
        let mut test = BackupChaosTest::new(42);
        let mut anomalies = 0;

        for run in 0..60 {
            if test.chaos_engine.coin(1, 5) {
                let dirs: Vec<PathBuf> = test
                    .hour_cycle()
                    .generations(test.root())
                    .unwrap()
                    .into_iter()
                    .map(|g| g.path)
                    .collect();
                if let Some(victim) = test.chaos_engine.remove_one(&dirs) {
                    info!("Run {}: removed {:?}", run, victim);
                }
            }
            if test.chaos_engine.coin(1, 10) {
                let root = test.root().to_path_buf();
                let debris = test.chaos_engine.leave_debris(&root);
                info!("Run {}: left {:?}", run, debris);
            }
            if test.chaos_engine.coin(1, 8) {
                if let Some(newest) = test.hour_cycle().generation(test.root(), 1).unwrap() {
                    warn!("Run {}: corrupting {:?}", run, newest.path);
                    test.chaos_engine.corrupt_record(&newest.path);
                }
            }

            let report = test.run().unwrap();
            anomalies += report.anomalies.len();
            test.engine.wait_for_deletions();

            let indexes = test.hour_indexes();
            assert!(indexes.len() <= 12, "run {}: {:?}", run, indexes);
            assert_eq!(indexes.first(), Some(&1), "run {}: no newest generation", run);
            assert!(indexes.iter().all(|&i| i <= 12));
            let leftovers: Vec<_> = fs::read_dir(test.root())
                .unwrap()
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .filter(|name| name.starts_with(".stage-") || name.starts_with(".reap-"))
                .collect();
            assert!(leftovers.is_empty(), "run {}: {:?}", run, leftovers);
        }
        info!("Recorded {} anomalies", anomalies);

        // The newest generation always mirrors current
        let newest = test.hour_cycle().generation(test.root(), 1).unwrap().unwrap();
        assert_eq!(
            fs::metadata(newest.path.join("etc/blob.bin")).unwrap().ino(),
            fs::metadata(test.current().join("etc/blob.bin")).unwrap().ino()
        );
    }

    #[test]
    fn test_awkward_entries_in_current() {
        let mut test = BackupChaosTest::new(5);
        let current = test.current();
        std::os::unix::fs::symlink("/nonexistent/target", current.join("dangling")).unwrap();
        std::os::unix::fs::symlink("etc", current.join("etc-link")).unwrap();
        fs::create_dir_all(current.join("a/b/c/d/e/f/g/h")).unwrap();
        fs::write(current.join("file with spaces.txt"), "x").unwrap();
        fs::write(current.join("ünïcödé.txt"), "y").unwrap();
        fs::write(current.join(".hidden"), "z").unwrap();

        test.run().unwrap();
        let newest = test.hour_cycle().generation(test.root(), 1).unwrap().unwrap();

        assert_eq!(
            fs::read_link(newest.path.join("dangling")).unwrap(),
            PathBuf::from("/nonexistent/target")
        );
        assert!(fs::symlink_metadata(newest.path.join("etc-link"))
            .unwrap()
            .file_type()
            .is_symlink());
        assert!(newest.path.join("a/b/c/d/e/f/g/h").is_dir());
        for name in ["file with spaces.txt", "ünïcödé.txt", ".hidden"] {
            assert_eq!(
                fs::metadata(newest.path.join(name)).unwrap().ino(),
                fs::metadata(current.join(name)).unwrap().ino()
            );
        }
    }
}
