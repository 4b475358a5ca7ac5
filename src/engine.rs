//! Recursive tree diff and merge
//!
//! The engine mirrors a source tree into a destination tree. Every entry that
//! has to leave the destination (because the source no longer has it, or
//! because it is about to be overwritten) is first moved to the same relative
//! path under a capture directory. Nothing in the destination is ever deleted.
//!
//! ## Algorithm
//!
//! For one directory level the child names of both sides are sorted and
//! walked with two cursors:
//!
//! - name only in the source: [`MergeAction::New`], deep copy
//! - name only in the destination: [`MergeAction::Backup`], move to capture
//! - name on both sides: [`MergeAction::Single`], stat both and classify
//!
//! Shared entries are classified by [`classify`]: two directories recurse,
//! two files compare size and modification time ([`is_current`]), and
//! anything else is replaced.
//!
//! ## Concurrency
//!
//! Every action of a level runs as its own task in a `JoinSet`. Nested levels
//! own nested `JoinSet`s, so aborting the top task tears down the whole walk.
//! The only required orderings are enforced by sequential awaits inside one
//! task: a directory exists before anything is written beneath it, and a
//! destination entry is moved out before its replacement is copied in.
//!
//! ## Failure isolation
//!
//! Failures while copying a source-only subtree are logged, recorded in the
//! report's `skipped` list and otherwise ignored. When the copy was meant to
//! replace an entry already moved to capture, that path is reported as
//! removed. Any other failure (listing,
//! stat of a shared entry, moving to capture) aborts the run.

use crate::dir_creator::DirectoryCreator;
use crate::error::{IoResultExt, Result, RevsnapError};
use crate::fs::FileSystem;
use crate::types::{EntryKind, EntryStat, EventKind, RelPath, SkippedEntry, SyncEvent, SyncReport};
use parking_lot::Mutex;
use std::ffi::OsString;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, info, instrument, trace, warn};

/// Default number of events buffered ahead of the consumer
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// One task emitted by the merge of two child-name lists
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeAction {
    /// Exists only in the source
    New(RelPath),
    /// Exists only in the destination
    Backup(RelPath),
    /// Exists on both sides
    Single(RelPath),
}

impl MergeAction {
    /// Path the action applies to
    pub fn path(&self) -> &RelPath {
        match self {
            MergeAction::New(p) | MergeAction::Backup(p) | MergeAction::Single(p) => p,
        }
    }
}

/// Walk two child-name lists in lock-step
///
/// Both lists are sorted ascending first. The returned actions partition the
/// union of both lists: each name appears in exactly one action.
///
/// # Examples
///
/// ```rust
/// use revsnap::engine::{merge_children, MergeAction};
/// use revsnap::types::RelPath;
///
/// let root = RelPath::root();
/// let actions = merge_children(&root, vec!["b".into(), "a".into()], vec!["c".into(), "b".into()]);
/// assert_eq!(actions, vec![
///     MergeAction::New(root.join("a")),
///     MergeAction::Single(root.join("b")),
///     MergeAction::Backup(root.join("c")),
/// ]);
/// ```
pub fn merge_children(
    parent: &RelPath,
    mut left: Vec<OsString>,
    mut right: Vec<OsString>,
) -> Vec<MergeAction> {
    left.sort();
    right.sort();

    let mut actions = Vec::with_capacity(left.len().max(right.len()));
    let mut left = left.into_iter().peekable();
    let mut right = right.into_iter().peekable();

    loop {
        let action = match (left.peek(), right.peek()) {
            (Some(l), Some(r)) => match l.cmp(r) {
                std::cmp::Ordering::Equal => {
                    right.next();
                    left.next().map(|name| MergeAction::Single(parent.join(name)))
                }
                std::cmp::Ordering::Less => left.next().map(|name| MergeAction::New(parent.join(name))),
                std::cmp::Ordering::Greater => right.next().map(|name| MergeAction::Backup(parent.join(name))),
            },
            (Some(_), None) => left.next().map(|name| MergeAction::New(parent.join(name))),
            (None, Some(_)) => right.next().map(|name| MergeAction::Backup(parent.join(name))),
            (None, None) => None,
        };

        match action {
            Some(action) => actions.push(action),
            None => break,
        }
    }

    actions
}

/// What to do with an entry present on both sides
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SingleAction {
    /// Both are directories
    Recurse,
    /// Destination file is already current
    Unchanged,
    /// Move the destination entry to capture, then copy the source over
    Replace,
}

/// Freshness predicate for two regular files
///
/// The destination is current iff sizes match and the source was not
/// modified after the destination.
pub fn is_current(source: &EntryStat, destination: &EntryStat) -> bool {
    source.size == destination.size && source.modified <= destination.modified
}

/// Classify an entry present on both sides
pub fn classify(source: &EntryStat, destination: &EntryStat) -> SingleAction {
    match (source.kind, destination.kind) {
        (EntryKind::Directory, EntryKind::Directory) => SingleAction::Recurse,
        (EntryKind::File, EntryKind::File) if is_current(source, destination) => SingleAction::Unchanged,
        _ => SingleAction::Replace,
    }
}

/// Synchronizes one source tree into one destination
///
/// An engine owns the [`DirectoryCreator`] of a single run; create a new
/// engine for every run.
#[derive(Debug)]
pub struct SyncEngine {
    fs: Arc<dyn FileSystem>,
    creator: Arc<DirectoryCreator>,
    channel_capacity: usize,
}

impl SyncEngine {
    /// Create an engine with its own directory cache
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        let creator = Arc::new(DirectoryCreator::new(fs.clone()));
        Self::with_creator(fs, creator)
    }

    /// Create an engine sharing an existing run's directory cache
    pub fn with_creator(fs: Arc<dyn FileSystem>, creator: Arc<DirectoryCreator>) -> Self {
        Self {
            fs,
            creator,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    /// Set how many events may be buffered ahead of the consumer
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// Start mirroring `source` into `destination`
    ///
    /// Displaced destination entries are moved under `capture`. Both
    /// `destination` and `capture` are created if missing. The walk runs in
    /// the background on the current tokio runtime; the returned stream
    /// yields one event per touched path.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    #[instrument(skip(self))]
    pub fn sync(&self, source: &Path, destination: &Path, capture: &Path) -> SyncStream {
        let (events, receiver) = mpsc::channel(self.channel_capacity);
        let walk = Arc::new(Walk {
            fs: self.fs.clone(),
            creator: self.creator.clone(),
            source: source.to_path_buf(),
            destination: destination.to_path_buf(),
            capture: capture.to_path_buf(),
            events,
            tally: Tally::default(),
        });

        SyncStream {
            events: receiver,
            task: Some(tokio::spawn(run_walk(walk))),
        }
    }
}

/// Stream of events produced by one sync run
///
/// Events arrive in no particular order across sibling subtrees. The stream
/// is single-use. Dropping it aborts the run; filesystem calls already in
/// flight are not rolled back.
#[derive(Debug)]
pub struct SyncStream {
    events: mpsc::Receiver<SyncEvent>,
    task: Option<JoinHandle<Result<SyncReport>>>,
}

impl SyncStream {
    /// Next completed path, or `None` once the walk has stopped emitting
    pub async fn next(&mut self) -> Option<SyncEvent> {
        self.events.recv().await
    }

    /// Drain remaining events and wait for the run's outcome
    ///
    /// # Errors
    ///
    /// Returns the fatal error that stopped the walk, or
    /// [`RevsnapError::Cancelled`] if the run was aborted.
    pub async fn finish(mut self) -> Result<SyncReport> {
        while self.events.recv().await.is_some() {}
        match self.task.take() {
            Some(task) => task.await.map_err(join_error)?,
            None => Err(RevsnapError::Cancelled),
        }
    }

    /// Collect every remaining event along with the final report
    pub async fn collect(mut self) -> Result<(Vec<SyncEvent>, SyncReport)> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        let report = self.finish().await?;
        Ok((events, report))
    }

    /// Abort the run; no further events are emitted
    pub fn cancel(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
        self.events.close();
    }
}

impl Drop for SyncStream {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

type WalkFuture = Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>>;
type IsolatedFuture = Pin<Box<dyn Future<Output = bool> + Send + 'static>>;

#[derive(Debug, Default)]
struct Tally {
    added: AtomicUsize,
    updated: AtomicUsize,
    removed: AtomicUsize,
    unchanged: AtomicUsize,
    skipped: Mutex<Vec<SkippedEntry>>,
}

impl Tally {
    fn record(&self, kind: EventKind) {
        let counter = match kind {
            EventKind::Added => &self.added,
            EventKind::Updated => &self.updated,
            EventKind::Removed => &self.removed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn report(&self, started: Instant) -> SyncReport {
        SyncReport {
            added: self.added.load(Ordering::Relaxed),
            updated: self.updated.load(Ordering::Relaxed),
            removed: self.removed.load(Ordering::Relaxed),
            unchanged: self.unchanged.load(Ordering::Relaxed),
            skipped: std::mem::take(&mut *self.skipped.lock()),
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// State shared by every task of one run
#[derive(Debug)]
struct Walk {
    fs: Arc<dyn FileSystem>,
    creator: Arc<DirectoryCreator>,
    source: PathBuf,
    destination: PathBuf,
    capture: PathBuf,
    events: mpsc::Sender<SyncEvent>,
    tally: Tally,
}

async fn run_walk(walk: Arc<Walk>) -> Result<SyncReport> {
    let started = Instant::now();
    info!(
        "Syncing {:?} into {:?} (capture {:?})",
        walk.source, walk.destination, walk.capture
    );

    let source_stat = walk.fs.stat(&walk.source).await.at(&walk.source)?;
    if !source_stat.is_dir() {
        return Err(RevsnapError::TypeMismatch {
            path: walk.source.clone(),
            expected: "directory",
        });
    }
    walk.creator.ensure(&walk.destination).await?;
    walk.creator.ensure(&walk.capture).await?;

    walk.clone().sync_recurse(RelPath::root()).await?;

    let report = walk.tally.report(started);
    info!(
        "Sync finished: {} added, {} updated, {} removed, {} unchanged, {} skipped",
        report.added,
        report.updated,
        report.removed,
        report.unchanged,
        report.skipped.len()
    );
    Ok(report)
}

impl Walk {
    fn sync_recurse(self: Arc<Self>, rel: RelPath) -> WalkFuture {
        Box::pin(async move {
            let source_dir = rel.under(&self.source);
            let destination_dir = rel.under(&self.destination);
            debug!("Syncing directory {}", rel);

            let (left, right) = tokio::try_join!(
                async { self.fs.list_dir(&source_dir).await.at(&source_dir) },
                async { self.fs.list_dir(&destination_dir).await.at(&destination_dir) },
            )?;

            let mut tasks = JoinSet::new();
            for action in merge_children(&rel, left, right) {
                tasks.spawn(self.clone().dispatch(action));
            }
            while let Some(joined) = tasks.join_next().await {
                joined.map_err(join_error)??;
            }
            Ok(())
        })
    }

    fn dispatch(self: Arc<Self>, action: MergeAction) -> WalkFuture {
        Box::pin(async move {
            trace!("Dispatching {:?}", action);
            match action {
                MergeAction::New(rel) => {
                    self.sync_new(rel, Some(EventKind::Added)).await;
                    Ok(())
                }
                MergeAction::Backup(rel) => self.backup(rel).await,
                MergeAction::Single(rel) => self.sync_single(rel).await,
            }
        })
    }

    /// Deep copy of a source-only entry; failures only skip this subtree
    ///
    /// `kind` is the event reported for `rel` itself once it is in place;
    /// `None` leaves reporting `rel` to the caller. Resolves to whether `rel`
    /// made it into the destination.
    fn sync_new(self: Arc<Self>, rel: RelPath, kind: Option<EventKind>) -> IsolatedFuture {
        Box::pin(async move {
            match self.clone().copy_new(&rel, kind).await {
                Ok(()) => true,
                Err(e) => {
                    warn!("Skipping {}: {}", rel, e);
                    self.tally.skipped.lock().push(SkippedEntry {
                        path: rel.to_path_buf(),
                        reason: e.to_string(),
                    });
                    false
                }
            }
        })
    }

    async fn copy_new(self: Arc<Self>, rel: &RelPath, kind: Option<EventKind>) -> Result<()> {
        let source = rel.under(&self.source);
        let stat = self.fs.stat(&source).await.at(&source)?;

        match stat.kind {
            EntryKind::File => {
                let destination = rel.under(&self.destination);
                self.fs
                    .copy_file(&source, &destination)
                    .await
                    .at(&destination)?;
                if let Some(kind) = kind {
                    self.emit(rel, kind).await;
                }
            }
            EntryKind::Directory => {
                self.creator.ensure(&rel.under(&self.destination)).await?;
                if let Some(kind) = kind {
                    self.emit(rel, kind).await;
                }

                let names = self.fs.list_dir(&source).await.at(&source)?;
                let mut tasks = JoinSet::new();
                for name in names {
                    tasks.spawn(self.clone().sync_new(rel.join(name), Some(EventKind::Added)));
                }
                while let Some(joined) = tasks.join_next().await {
                    joined.map_err(join_error)?;
                }
            }
            EntryKind::Other => {
                return Err(RevsnapError::TypeMismatch {
                    path: source,
                    expected: "file or directory",
                });
            }
        }
        Ok(())
    }

    async fn sync_single(self: Arc<Self>, rel: RelPath) -> Result<()> {
        let source = rel.under(&self.source);
        let destination = rel.under(&self.destination);
        let (source_stat, destination_stat) = tokio::try_join!(
            async { self.fs.stat(&source).await.at(&source) },
            async { self.fs.stat(&destination).await.at(&destination) },
        )?;

        match classify(&source_stat, &destination_stat) {
            SingleAction::Recurse => self.sync_recurse(rel).await,
            SingleAction::Unchanged => {
                trace!("Unchanged {}", rel);
                self.tally.unchanged.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            SingleAction::Replace => {
                trace!(
                    "Replacing {} ({} -> {})",
                    rel,
                    destination_stat.kind.as_str(),
                    source_stat.kind.as_str()
                );
                self.relocate(&rel).await?;
                // the old entry is in capture either way; report the path once
                let kind = if self.clone().sync_new(rel.clone(), None).await {
                    EventKind::Updated
                } else {
                    EventKind::Removed
                };
                self.emit(&rel, kind).await;
                Ok(())
            }
        }
    }

    async fn backup(self: Arc<Self>, rel: RelPath) -> Result<()> {
        self.relocate(&rel).await?;
        self.emit(&rel, EventKind::Removed).await;
        Ok(())
    }

    /// Move a destination entry to the same relative path under capture
    async fn relocate(&self, rel: &RelPath) -> Result<()> {
        let parent = rel.parent().unwrap_or_default();
        self.creator.ensure(&parent.under(&self.capture)).await?;

        let from = rel.under(&self.destination);
        let to = rel.under(&self.capture);
        self.fs.rename(&from, &to).await.at(&from)?;
        trace!("Moved {} to capture", rel);
        Ok(())
    }

    async fn emit(&self, rel: &RelPath, kind: EventKind) {
        self.tally.record(kind);
        let event = SyncEvent {
            path: rel.clone(),
            kind,
        };
        // a closed receiver means the consumer stopped listening
        let _ = self.events.send(event).await;
    }
}

fn join_error(err: JoinError) -> RevsnapError {
    if err.is_cancelled() {
        RevsnapError::Cancelled
    } else {
        RevsnapError::internal(format!("sync task panicked: {}", err))
    }
}
