//! Integration tests for complete snapshot runs
//!
//! Drives several runs against a real directory tree and checks the
//! resulting chain on disk.

use ::revsnap::*;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::info;

/// Test harness for multi-run scenarios
pub struct SnapshotHarness {
    pub temp_dir: TempDir,
    pub source: PathBuf,
    pub backups: PathBuf,
    pub revsnap: Revsnap,
}

/// Files and directories found under a root, keyed by relative path
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TreeState {
    pub files: BTreeMap<PathBuf, Vec<u8>>,
    pub dirs: Vec<PathBuf>,
}

impl TreeState {
    pub fn read(root: &Path) -> Self {
        let mut state = TreeState::default();
        for entry in walkdir::WalkDir::new(root).min_depth(1).sort_by_file_name() {
            let entry = entry.unwrap();
            let relative = entry.path().strip_prefix(root).unwrap().to_path_buf();
            if entry.file_type().is_dir() {
                state.dirs.push(relative);
            } else {
                state.files.insert(relative, fs::read(entry.path()).unwrap());
            }
        }
        state
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.dirs.is_empty()
    }
}

/// Fixed instant `minutes` after an arbitrary epoch
pub fn instant(minutes: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap() + chrono::Duration::minutes(minutes)
}

impl SnapshotHarness {
    pub fn new() -> Self {
        Self::with_builder(RevsnapBuilder::new())
    }

    pub fn with_builder(builder: RevsnapBuilder) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("source");
        let backups = temp_dir.path().join("backups");
        fs::create_dir(&source).unwrap();
        let revsnap = builder.build(source.clone(), backups.clone());
        Self {
            temp_dir,
            source,
            backups,
            revsnap,
        }
    }

    pub fn write(&self, relative: &str, content: &[u8]) {
        let path = self.source.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    pub fn mkdir(&self, relative: &str) {
        fs::create_dir_all(self.source.join(relative)).unwrap();
    }

    pub fn remove(&self, relative: &str) {
        let path = self.source.join(relative);
        if path.is_dir() {
            fs::remove_dir_all(path).unwrap();
        } else {
            fs::remove_file(path).unwrap();
        }
    }

    pub fn snapshot_dir(&self, at: DateTime<Utc>) -> PathBuf {
        self.backups.join(snapshot::encode_name(at))
    }

    /// Run to completion and return the events and report
    pub async fn run_at(&self, at: DateTime<Utc>) -> (Vec<SyncEvent>, SyncReport) {
        let run = self.revsnap.run_at(at).await.unwrap();
        info!("Run {} ({:?})", run.snapshot(), run.rotation());
        run.collect().await.unwrap()
    }
}

fn events_of(events: &[SyncEvent], kind: EventKind) -> Vec<String> {
    let mut paths: Vec<String> = events
        .iter()
        .filter(|e| e.kind == kind)
        .map(|e| e.path.to_string())
        .collect();
    paths.sort();
    paths
}

#[tokio::test]
async fn test_two_runs_keep_previous_state_as_diff() {
    let harness = SnapshotHarness::new();
    harness.write("a.txt", &[b'a'; 100]);
    harness.write("sub/b.txt", &[b'b'; 50]);

    let t1 = instant(0);
    let (events, report) = harness.run_at(t1).await;
    assert_eq!(report.added, 3);
    assert_eq!(events_of(&events, EventKind::Added), vec!["a.txt", "sub", "sub/b.txt"]);

    harness.write("a.txt", &[b'A'; 120]);
    harness.remove("sub/b.txt");

    let t2 = instant(60);
    let (events, report) = harness.run_at(t2).await;
    assert_eq!(events_of(&events, EventKind::Updated), vec!["a.txt"]);
    assert_eq!(events_of(&events, EventKind::Removed), vec!["sub/b.txt"]);
    assert_eq!(report.unchanged, 0);

    let newest = TreeState::read(&harness.snapshot_dir(t2));
    assert_eq!(newest.files.len(), 1);
    assert_eq!(newest.files[Path::new("a.txt")], vec![b'A'; 120]);
    assert_eq!(newest.dirs, vec![PathBuf::from("sub")]);

    let diff = TreeState::read(&harness.snapshot_dir(t1));
    assert_eq!(diff.files[Path::new("a.txt")], vec![b'a'; 100]);
    assert_eq!(diff.files[Path::new("sub/b.txt")], vec![b'b'; 50]);
    assert_eq!(diff.files.len(), 2);
}

#[tokio::test]
async fn test_unchanged_source_leaves_empty_diff() {
    let harness = SnapshotHarness::new();
    harness.write("a.txt", b"alpha");
    harness.write("deep/er/c.txt", b"gamma");
    harness.mkdir("empty");

    harness.run_at(instant(0)).await;
    let (events, report) = harness.run_at(instant(1)).await;

    assert!(events.is_empty());
    assert!(!report.has_changes());
    assert!(TreeState::read(&harness.snapshot_dir(instant(0))).is_empty());
    assert_eq!(
        TreeState::read(&harness.snapshot_dir(instant(1))),
        TreeState::read(&harness.source)
    );
}

#[tokio::test]
async fn test_newest_snapshot_mirrors_source_after_each_run() {
    let harness = SnapshotHarness::new();
    harness.write("keep.txt", b"keep");
    harness.write("docs/readme.md", b"# readme");
    harness.write("docs/old.md", b"old");

    let mut at = 0;
    let check = |minutes: i64| {
        let expected = TreeState::read(&harness.source);
        let actual = TreeState::read(&harness.snapshot_dir(instant(minutes)));
        assert_eq!(expected, actual, "mirror diverged at minute {}", minutes);
    };

    harness.run_at(instant(at)).await;
    check(at);

    harness.remove("docs/old.md");
    harness.write("docs/new.md", b"brand new");
    harness.write("src/main.rs", b"fn main() {}");
    at += 10;
    harness.run_at(instant(at)).await;
    check(at);

    harness.remove("docs");
    harness.write("docs", b"docs is a file now");
    at += 10;
    harness.run_at(instant(at)).await;
    check(at);

    let names: Vec<String> = harness
        .revsnap
        .snapshots()
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.name)
        .collect();
    assert_eq!(names.len(), 3);
    assert_eq!(names[0], snapshot::encode_name(instant(at)));
}

#[tokio::test]
async fn test_kind_change_moves_whole_subtree_to_diff() {
    let harness = SnapshotHarness::new();
    harness.write("x/one.txt", b"1");
    harness.write("x/two/three.txt", b"3");
    harness.run_at(instant(0)).await;

    harness.remove("x");
    harness.write("x", b"now a file");
    let (events, _) = harness.run_at(instant(5)).await;

    assert_eq!(events_of(&events, EventKind::Updated), vec!["x"]);
    let diff = TreeState::read(&harness.snapshot_dir(instant(0)));
    assert_eq!(diff.files[Path::new("x/one.txt")], b"1");
    assert_eq!(diff.files[Path::new("x/two/three.txt")], b"3");
    assert!(harness.snapshot_dir(instant(5)).join("x").is_file());
}

#[tokio::test]
async fn test_restore_rebuilds_each_state() {
    let harness = SnapshotHarness::new();
    harness.write("a.txt", b"a1");
    harness.write("b.txt", b"b1");
    harness.write("dir/c.txt", b"c1");
    harness.write("dir/d.txt", b"d1");

    let mut states = Vec::new();
    harness.run_at(instant(0)).await;
    states.push((instant(0), TreeState::read(&harness.source)));

    harness.write("a.txt", b"a2 longer");
    harness.remove("b.txt");
    harness.run_at(instant(1)).await;
    states.push((instant(1), TreeState::read(&harness.source)));

    harness.remove("dir");
    harness.write("a.txt", b"a3 even longer");
    harness.run_at(instant(2)).await;
    states.push((instant(2), TreeState::read(&harness.source)));

    for (at, expected) in &states {
        let name = snapshot::encode_name(*at);
        let target = harness.temp_dir.path().join(format!("restore-{}", name));
        let report = harness.revsnap.restore(&name, &target).await.unwrap();
        assert!(report.layers >= 1);
        assert_eq!(&TreeState::read(&target), expected, "restore of {}", name);
    }
}

#[tokio::test]
async fn test_single_slot_concurrency_completes() {
    let harness = SnapshotHarness::with_builder(RevsnapBuilder::new().max_concurrency(1));
    for dir in 0..4 {
        for file in 0..4 {
            harness.write(&format!("d{}/n{}/f{}.txt", dir, dir, file), format!("{}-{}", dir, file).as_bytes());
        }
    }

    let (_, report) = harness.run_at(instant(0)).await;
    assert_eq!(report.added, 4 + 4 + 16);
    assert!(report.is_complete());
    assert_eq!(
        TreeState::read(&harness.source),
        TreeState::read(&harness.snapshot_dir(instant(0)))
    );
}

#[tokio::test]
async fn test_directory_creator_deduplicates_concurrent_callers() {
    let temp_dir = TempDir::new().unwrap();
    let creator = std::sync::Arc::new(DirectoryCreator::new(std::sync::Arc::new(LocalFileSystem::new())));
    let target = temp_dir.path().join("p/q/r/s");

    let mut set = tokio::task::JoinSet::new();
    for _ in 0..16 {
        let creator = creator.clone();
        let target = target.clone();
        set.spawn(async move { creator.ensure(&target).await });
    }

    let mut created = 0;
    while let Some(result) = set.join_next().await {
        let outcome = result.unwrap().unwrap();
        if outcome == CreateOutcome::Created {
            created += 1;
        }
    }
    assert!(target.is_dir());
    // every caller observes the single shared outcome
    assert_eq!(created, 16);
}
