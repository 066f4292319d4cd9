//! Property-based testing for hardsnap
//!
//! Uses proptest to verify generation layout, naming and reconciliation
//! invariants across randomly generated inputs.

use ::hardsnap::*;
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::info;

/// Generate snapshot labels as the record format allows them
fn label_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        "[A-Za-z0-9:.-]{1,20}".prop_map(|s| s),
        "20[0-9]{2}-[01][0-9]-[0-3][0-9]_[0-2][0-9]:[0-5][0-9]".prop_map(|s| s),
    ]
}

/// Generate directory templates in the style of the reference cycles
fn template_strategy() -> impl Strategy<Value = String> {
    ("[a-z]{1,6}", prop::option::of(1usize..4), "[_.-]", "[a-z]{0,3}").prop_map(
        |(head, width, sep, tail)| match width {
            Some(w) => format!("{}{}%0{}d{}%s{}", head, sep, w, sep, tail),
            None => format!("{}{}%d{}%s{}", head, sep, sep, tail),
        },
    )
}

/// Generate a tree: relative path to one of a few shared payloads
fn tree_strategy() -> impl Strategy<Value = BTreeMap<PathBuf, usize>> {
    let path = (
        prop::collection::vec(prop_oneof!["[a-c]".prop_map(|s| s), "dir[0-2]".prop_map(|s| s)], 0..=2),
        "file[0-9]{1,2}\\.bin",
    )
        .prop_map(|(dirs, name)| {
            let mut path = PathBuf::new();
            for dir in dirs {
                path.push(dir);
            }
            path.push(name);
            path
        });
    prop::collection::btree_map(path, 0usize..4, 1..24)
}

fn payload(kind: usize) -> Vec<u8> {
    (0..(2048 + kind * 512)).map(|i| (i * (kind + 1) % 251) as u8).collect()
}

/// Materialize a generated tree, skipping paths that collide with a directory
fn write_tree(root: &Path, tree: &BTreeMap<PathBuf, usize>) -> BTreeMap<PathBuf, usize> {
    let mut written = BTreeMap::new();
    for (rel, kind) in tree {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            if fs::create_dir_all(parent).is_err() {
                continue;
            }
        }
        if path.is_dir() {
            continue;
        }
        fs::write(&path, payload(*kind)).unwrap();
        written.insert(path, *kind);
    }
    written
}

fn small_cycle(max_generations: usize) -> CycleDefinition {
    CycleDefinition {
        name: "test".to_string(),
        max_generations,
        dir_template: DirTemplate::parse("gen_%02d_%s").unwrap(),
        preference: None,
        forced_interval: 1.0,
        interval_unit: IntervalUnit::Minutes,
        calendar_field: CalendarField::MinuteOfHour,
        gates_following: false,
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_generation_count_is_bounded(max in 1usize..6, rolls in 1usize..14) {
        let root = TempDir::new().unwrap();
        let current = root.path().join("current");
        fs::create_dir_all(&current).unwrap();
        fs::write(current.join("file"), "data").unwrap();

        let cycle = small_cycle(max);
        let mut roller = CycleRoller::new(root.path()).unwrap();
        for n in 0..rolls {
            roller.roll(&cycle, &current, &format!("r{:03}", n)).unwrap();
        }
        roller.wait_for_deletions();

        let generations = cycle.generations(root.path()).unwrap();
        let expected = rolls.min(max);
        prop_assert_eq!(generations.len(), expected);
        for (i, generation) in generations.iter().enumerate() {
            // Slot k holds the k-th most recent roll
            prop_assert_eq!(generation.index, i + 1);
            prop_assert_eq!(&generation.label, &format!("r{:03}", rolls - 1 - i));
        }
    }

    #[test]
    fn prop_template_names_round_trip(
        template in template_strategy(),
        index in 1usize..2000,
        label in label_strategy(),
    ) {
        let template = DirTemplate::parse(&template).unwrap();
        let name = template.render(index, &label);
        prop_assert_eq!(template.parse_name(&name), Some((index, label.as_str())));
    }

    #[test]
    fn prop_reconcile_links_equal_content_and_is_idempotent(tree in tree_strategy()) {
        let root = TempDir::new().unwrap();
        let written = write_tree(root.path(), &tree);
        info!("Generated {} files", written.len());

        let options = ReconcileOptions {
            size_floor: 1,
            ..Default::default()
        };
        let first = Reconciler::new(options.clone()).unwrap().run(vec![root.path().to_path_buf()]).unwrap();

        // Content is preserved and equal content shares one inode
        let mut inode_of_kind: BTreeMap<usize, u64> = BTreeMap::new();
        for (path, kind) in &written {
            prop_assert_eq!(fs::read(path).unwrap(), payload(*kind));
            let ino = fs::metadata(path).unwrap().ino();
            let expected = *inode_of_kind.entry(*kind).or_insert(ino);
            prop_assert_eq!(ino, expected);
        }
        prop_assert_eq!(first.merges, written.len() - inode_of_kind.len());

        let second = Reconciler::new(options).unwrap().run(vec![root.path().to_path_buf()]).unwrap();
        prop_assert_eq!(second.merges, 0);
        prop_assert_eq!(second.bytes_reclaimed, 0);
        prop_assert_eq!(second.already_linked, first.merges);
    }

    #[test]
    fn prop_dry_run_changes_nothing(tree in tree_strategy()) {
        let root = TempDir::new().unwrap();
        let written = write_tree(root.path(), &tree);
        let before: Vec<u64> = written.keys().map(|p| fs::metadata(p).unwrap().ino()).collect();

        let report = Reconciler::new(ReconcileOptions {
            dry_run: true,
            size_floor: 1,
            ..Default::default()
        })
        .unwrap()
        .run(vec![root.path().to_path_buf()])
        .unwrap();

        let after: Vec<u64> = written.keys().map(|p| fs::metadata(p).unwrap().ino()).collect();
        prop_assert_eq!(before, after);
        prop_assert!(report.dry_run);
        let kinds: std::collections::BTreeSet<usize> = written.values().copied().collect();
        prop_assert_eq!(report.merges, written.len() - kinds.len());
    }
}
