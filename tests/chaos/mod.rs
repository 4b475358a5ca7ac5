//! Fault injection for revsnap
//!
//! Wraps the local filesystem in a double that fails selected calls and
//! checks that each failure is either isolated or stops the run cleanly.

use super::integration::{instant, SnapshotHarness, TreeState};
use ::revsnap::*;
use async_trait::async_trait;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Which calls the double refuses
#[derive(Debug, Default)]
pub struct Faults {
    /// Fail `copy_file` when the source file name contains this marker
    pub poison_copy: Option<&'static str>,
    /// Fail every `rename` whose source is directly under this directory
    pub refuse_rename_under: Option<std::path::PathBuf>,
    /// Fail `list_dir` on paths ending with this name
    pub broken_listing: Option<&'static str>,
    /// Delay every `stat`
    pub slow_stat: Option<Duration>,
    /// Switch all faults off
    pub disarmed: AtomicBool,
}

#[derive(Debug)]
pub struct ChaosFs {
    inner: LocalFileSystem,
    faults: Arc<Faults>,
}

impl ChaosFs {
    pub fn new(faults: Arc<Faults>) -> Self {
        Self {
            inner: LocalFileSystem::new(),
            faults,
        }
    }

    fn armed(&self) -> bool {
        !self.faults.disarmed.load(Ordering::SeqCst)
    }
}

fn injected(what: &str, path: &Path) -> io::Error {
    io::Error::other(format!("injected {} failure at {}", what, path.display()))
}

#[async_trait]
impl FileSystem for ChaosFs {
    async fn list_dir(&self, path: &Path) -> io::Result<Vec<OsString>> {
        if let Some(name) = self.faults.broken_listing {
            if self.armed() && path.file_name().is_some_and(|n| n == name) {
                return Err(injected("list", path));
            }
        }
        self.inner.list_dir(path).await
    }

    async fn stat(&self, path: &Path) -> io::Result<EntryStat> {
        if let Some(delay) = self.faults.slow_stat {
            tokio::time::sleep(delay).await;
        }
        self.inner.stat(path).await
    }

    async fn copy_file(&self, from: &Path, to: &Path) -> io::Result<()> {
        if let Some(marker) = self.faults.poison_copy {
            let poisoned = from
                .file_name()
                .is_some_and(|n| n.to_string_lossy().contains(marker));
            if self.armed() && poisoned {
                return Err(injected("copy", from));
            }
        }
        self.inner.copy_file(from, to).await
    }

    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        if let Some(dir) = &self.faults.refuse_rename_under {
            if self.armed() && from.parent() == Some(dir.as_path()) {
                return Err(injected("rename", from));
            }
        }
        self.inner.rename(from, to).await
    }

    async fn create_dir(&self, path: &Path) -> io::Result<()> {
        self.inner.create_dir(path).await
    }
}

fn harness_with(faults: Arc<Faults>, builder: RevsnapBuilder) -> SnapshotHarness {
    SnapshotHarness::with_builder(builder.filesystem(Arc::new(ChaosFs::new(faults))))
}

#[tokio::test]
async fn test_failed_copy_only_skips_that_entry() {
    let faults = Arc::new(Faults {
        poison_copy: Some("poison"),
        ..Default::default()
    });
    let harness = harness_with(faults.clone(), RevsnapBuilder::new());
    harness.write("good.txt", b"fine");
    harness.write("nested/poison.bin", b"unreadable");
    harness.write("nested/ok.txt", b"also fine");

    let (events, report) = harness.run_at(instant(0)).await;
    assert!(!report.is_complete());
    assert_eq!(report.skipped.len(), 1);
    assert!(report.skipped[0].path.ends_with("nested/poison.bin"));
    assert_eq!(events.len(), 3);

    let mirror = harness.snapshot_dir(instant(0));
    assert!(mirror.join("good.txt").is_file());
    assert!(mirror.join("nested/ok.txt").is_file());
    assert!(!mirror.join("nested/poison.bin").exists());

    // The skipped entry is picked up as new once the fault clears
    faults.disarmed.store(true, Ordering::SeqCst);
    let (events, report) = harness.run_at(instant(1)).await;
    assert!(report.is_complete());
    assert_eq!(report.added, 1);
    assert_eq!(events[0].path.to_string(), "nested/poison.bin");
}

#[tokio::test]
async fn test_failed_update_keeps_old_version_in_history() {
    let faults = Arc::new(Faults {
        poison_copy: Some("poison"),
        disarmed: AtomicBool::new(true),
        ..Default::default()
    });
    let harness = harness_with(faults.clone(), RevsnapBuilder::new());
    harness.write("poison.txt", b"v1");
    harness.run_at(instant(0)).await;

    harness.write("poison.txt", b"v2 is longer");
    faults.disarmed.store(false, Ordering::SeqCst);
    let (events, report) = harness.run_at(instant(1)).await;

    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, EventKind::Removed);
    assert_eq!(events[0].path.to_string(), "poison.txt");
    assert_eq!((report.updated, report.removed), (0, 1));
    assert_eq!(report.skipped.len(), 1);
    assert!(!harness.snapshot_dir(instant(1)).join("poison.txt").exists());
    assert_eq!(
        fs::read(harness.snapshot_dir(instant(0)).join("poison.txt")).unwrap(),
        b"v1"
    );
}

#[tokio::test]
async fn test_rotation_failure_uses_scratch_and_keeps_chain() {
    let temp = tempfile::TempDir::new().unwrap();
    let backups = temp.path().join("backups");
    let faults = Arc::new(Faults {
        refuse_rename_under: Some(backups.clone()),
        disarmed: AtomicBool::new(true),
        ..Default::default()
    });
    let source = temp.path().join("source");
    fs::create_dir(&source).unwrap();
    fs::write(source.join("a.txt"), b"first").unwrap();
    let revsnap = RevsnapBuilder::new()
        .filesystem(Arc::new(ChaosFs::new(faults.clone())))
        .build(source.clone(), backups.clone());

    revsnap.run_at(instant(0)).await.unwrap().finish().await.unwrap();
    fs::write(source.join("a.txt"), b"second!").unwrap();

    faults.disarmed.store(false, Ordering::SeqCst);
    let run = revsnap.run_at(instant(1)).await.unwrap();
    assert!(run.is_degraded());
    assert!(!run.capture().starts_with(&backups));
    run.finish().await.unwrap();

    let old = TreeState::read(&backups.join(snapshot::encode_name(instant(0))));
    let new = TreeState::read(&backups.join(snapshot::encode_name(instant(1))));
    assert_eq!(old.files[Path::new("a.txt")], b"first");
    assert_eq!(new.files[Path::new("a.txt")], b"second!");
}

#[tokio::test]
async fn test_rotation_failure_aborts_without_touching_backups() {
    let temp = tempfile::TempDir::new().unwrap();
    let backups = temp.path().join("backups");
    let previous = backups.join(snapshot::encode_name(instant(0)));
    fs::create_dir_all(&previous).unwrap();
    fs::write(previous.join("a.txt"), b"kept").unwrap();
    let source = temp.path().join("source");
    fs::create_dir(&source).unwrap();

    let faults = Arc::new(Faults {
        refuse_rename_under: Some(backups.clone()),
        ..Default::default()
    });
    let revsnap = RevsnapBuilder::new()
        .filesystem(Arc::new(ChaosFs::new(faults)))
        .rotation_fallback(RotationFallback::Abort)
        .build(source, backups.clone());

    let err = revsnap.run_at(instant(1)).await.unwrap_err();
    assert!(matches!(err, RevsnapError::Rotation(_)));
    let names: Vec<_> = fs::read_dir(&backups).unwrap().map(|e| e.unwrap().file_name()).collect();
    assert_eq!(names, vec![OsString::from(snapshot::encode_name(instant(0)))]);
}

#[tokio::test]
async fn test_listing_failure_is_fatal() {
    let faults = Arc::new(Faults {
        broken_listing: Some("locked"),
        disarmed: AtomicBool::new(true),
        ..Default::default()
    });
    let harness = harness_with(faults.clone(), RevsnapBuilder::new());
    harness.mkdir("locked");
    harness.write("locked/inside.txt", b"x");
    harness.run_at(instant(0)).await;

    faults.disarmed.store(false, Ordering::SeqCst);

    let run = harness.revsnap.run_at(instant(1)).await.unwrap();
    let err = run.finish().await.unwrap_err();
    assert!(matches!(err, RevsnapError::Io { .. }));
}

#[tokio::test]
async fn test_cancel_stops_run() {
    let faults = Arc::new(Faults {
        slow_stat: Some(Duration::from_millis(20)),
        ..Default::default()
    });
    let harness = harness_with(faults, RevsnapBuilder::new().max_concurrency(1));
    for i in 0..50 {
        harness.write(&format!("f{:02}.txt", i), b"data");
    }

    let mut run = harness.revsnap.run_at(instant(0)).await.unwrap();
    run.cancel();
    assert!(run.next().await.is_none());
    assert!(matches!(run.finish().await, Err(RevsnapError::Cancelled)));
}
