//! Main test module for hardsnap
//!
//! This module includes all test suites:
//! - Integration tests over simulated days of backup runs
//! - Chaos tests for damaged backup roots
//! - Property-based tests for invariants
//! - Edge cases for unusual trees and configurations

pub mod integration;
pub mod chaos;
pub mod property;

#[cfg(test)]
mod edge_cases {
    use ::hardsnap::*;
    use std::fs;
    use std::os::unix::fs::{MetadataExt, PermissionsExt};
    use tempfile::TempDir;

    fn stamped_root(epoch: i64) -> TempDir {
        let temp_dir = TempDir::new().unwrap();
        let current = temp_dir.path().join("current");
        fs::create_dir_all(&current).unwrap();
        SnapshotRecord::from_epoch(epoch).unwrap().write(&current).unwrap();
        temp_dir
    }

    #[test]
    fn test_empty_current() {
        let temp_dir = stamped_root(1_717_416_000);
        let mut engine = RotationEngine::new(temp_dir.path()).unwrap();

        let report = engine.rotate().unwrap();
        assert_eq!(report.rolled().len(), 4);

        let hour = report.cycles[0].roll.as_ref().unwrap();
        assert_eq!(hour.clone.hardlinks, 1); // the record itself
        assert!(hour.created.join(".snapshot_record").exists());
    }

    #[test]
    fn test_special_filenames() {
        let temp_dir = stamped_root(1_717_416_000);
        let current = temp_dir.path().join("current");

        let names = [
            "file with spaces.txt",
            "file-with-dashes.txt",
            "file_with_underscores.txt",
            "file.multiple.dots.txt",
            "UPPERCASE.TXT",
            "文件.txt",
            "emoji_🎉.txt",
            "hour_01_not-a-generation",
        ];
        for name in &names {
            fs::write(current.join(name), name.as_bytes()).unwrap();
        }

        let mut engine = RotationEngine::new(temp_dir.path()).unwrap();
        engine.rotate().unwrap();
        let newest = engine.config().cycles.get("hour").unwrap().generation(temp_dir.path(), 1).unwrap().unwrap();
        for name in &names {
            assert_eq!(fs::read(newest.path.join(name)).unwrap(), name.as_bytes());
        }
    }

    #[test]
    fn test_deep_tree_keeps_directory_modes() {
        let temp_dir = stamped_root(1_717_416_000);
        let current = temp_dir.path().join("current");

        let mut deep = current.clone();
        for i in 0..40 {
            deep = deep.join(format!("level{}", i));
        }
        fs::create_dir_all(&deep).unwrap();
        fs::write(deep.join("leaf.txt"), "deep").unwrap();
        fs::set_permissions(current.join("level0"), fs::Permissions::from_mode(0o750)).unwrap();

        let mut engine = RotationEngine::new(temp_dir.path()).unwrap();
        let report = engine.rotate().unwrap();
        let created = &report.cycles[0].roll.as_ref().unwrap().created;

        let mut cloned = created.clone();
        for i in 0..40 {
            cloned = cloned.join(format!("level{}", i));
        }
        assert_eq!(fs::read_to_string(cloned.join("leaf.txt")).unwrap(), "deep");
        assert_eq!(
            fs::metadata(created.join("level0")).unwrap().mode() & 0o7777,
            0o750
        );
    }

    #[test]
    fn test_custom_cycle_table_and_current_name() {
        let temp_dir = TempDir::new().unwrap();
        let live = temp_dir.path().join("live");
        fs::create_dir_all(&live).unwrap();
        SnapshotRecord::from_epoch(1_717_416_000).unwrap().write(&live).unwrap();

        let table = CycleTable::from_json(
            r#"[
                {
                    "name": "quarter",
                    "max_generations": 3,
                    "dir_template": "q%02d-%s",
                    "forced_interval": 15.0,
                    "interval_unit": "minutes",
                    "calendar_field": "minute-of-hour"
                }
            ]"#,
        )
        .unwrap();

        let mut engine = RotationEngineBuilder::new()
            .current_dir("live")
            .cycles(table)
            .build(temp_dir.path())
            .unwrap();
        let report = engine.rotate().unwrap();
        assert_eq!(report.rolled(), vec!["quarter"]);

        let names: Vec<String> = fs::read_dir(temp_dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with("q01-"))
            .collect();
        assert_eq!(names.len(), 1);
    }

    #[test]
    fn test_size_floor_boundary() {
        let temp_dir = TempDir::new().unwrap();
        let at_floor = vec![1u8; DEFAULT_SIZE_FLOOR as usize];
        let below = vec![2u8; DEFAULT_SIZE_FLOOR as usize - 1];
        for dir in ["x", "y"] {
            fs::create_dir_all(temp_dir.path().join(dir)).unwrap();
            fs::write(temp_dir.path().join(dir).join("at"), &at_floor).unwrap();
            fs::write(temp_dir.path().join(dir).join("below"), &below).unwrap();
        }

        let report = Reconciler::new(ReconcileOptions::default())
            .unwrap()
            .run(vec![temp_dir.path().to_path_buf()])
            .unwrap();
        assert_eq!(report.merges, 1);
        assert_eq!(report.files_below_floor, 2);
        assert_eq!(
            fs::metadata(temp_dir.path().join("x/at")).unwrap().ino(),
            fs::metadata(temp_dir.path().join("y/at")).unwrap().ino()
        );
        assert_ne!(
            fs::metadata(temp_dir.path().join("x/below")).unwrap().ino(),
            fs::metadata(temp_dir.path().join("y/below")).unwrap().ino()
        );
    }

    #[test]
    fn test_same_size_different_content_never_merges() {
        let temp_dir = TempDir::new().unwrap();
        let mut a = vec![0u8; 50_000];
        let mut b = a.clone();
        a[49_999] = 1;
        b[0] = 1;
        fs::write(temp_dir.path().join("a"), &a).unwrap();
        fs::write(temp_dir.path().join("b"), &b).unwrap();
        fs::write(temp_dir.path().join("c"), &a).unwrap();

        let report = Reconciler::new(ReconcileOptions::default())
            .unwrap()
            .run(vec![temp_dir.path().to_path_buf()])
            .unwrap();
        assert_eq!(report.merges, 1);
        assert_eq!(fs::read(temp_dir.path().join("b")).unwrap(), b);
        assert_eq!(fs::metadata(temp_dir.path().join("b")).unwrap().nlink(), 1);
    }
}
