//! Snapshot rotation: the entry point of a backup run
//!
//! This module provides the [`Revsnap`] struct, which wires the snapshot
//! naming, the directory creator and the sync engine into one run of the
//! promote-and-diff protocol.
//!
//! ## Protocol
//!
//! 1. Ensure the backups root exists.
//! 2. Compute the new snapshot name from the current instant.
//! 3. Rename the most recent snapshot to the new name. The renamed directory
//!    is the destination: it already holds the full previous mirror and only
//!    needs updating. The vacated old path becomes the capture directory and
//!    receives every entry this run replaces or removes.
//! 4. If there is no previous snapshot, sync into a fresh directory. If the
//!    rename fails, [`RotationFallback`] decides: `Scratch` syncs into a fresh
//!    directory and captures into a temporary directory that is discarded,
//!    `Abort` fails the run.
//! 5. Run the engine and hand its stream to the caller.
//!
//! After repeated runs the newest snapshot is a full mirror of the source and
//! every older one holds what changed relative to its successor.
//!
//! ## Examples
//!
//! ```rust,no_run
//! use revsnap::Revsnap;
//! use std::path::PathBuf;
//!
//! # async fn example() -> revsnap::Result<()> {
//! let revsnap = Revsnap::new(PathBuf::from("./documents"), PathBuf::from("/mnt/backups"));
//! let mut run = revsnap.run().await?;
//! while let Some(event) = run.next().await {
//!     println!("{}", event);
//! }
//! let report = run.finish().await?;
//! println!("{} entries touched", report.total_operations());
//! # Ok(())
//! # }
//! ```

use crate::dir_creator::DirectoryCreator;
use crate::engine::{SyncEngine, SyncStream};
use crate::error::{IoResultExt, Result, RevsnapError};
use crate::fs::{FileSystem, LocalFileSystem, ThrottledFileSystem};
use crate::restore::{self, RestoreReport};
use crate::snapshot::{self, Snapshot};
use crate::types::{RotationFallback, SyncConfig, SyncEvent, SyncReport};
use chrono::{DateTime, Utc};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{info, instrument, warn};

/// How the destination and capture directories of a run were chosen
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rotation {
    /// The previous snapshot was renamed; its old path captures the diff
    Promoted {
        /// Name the previous snapshot had before this run
        previous: String,
    },
    /// No previous snapshot existed
    FirstRun,
    /// The previous snapshot could not be promoted; the diff is discarded
    Degraded {
        /// Why promotion failed
        reason: String,
    },
}

/// Main entry point for snapshot runs
///
/// # Examples
///
/// ```rust
/// use revsnap::{RevsnapBuilder, RotationFallback};
/// use std::path::PathBuf;
///
/// let revsnap = RevsnapBuilder::new()
///     .max_concurrency(16)
///     .rotation_fallback(RotationFallback::Abort)
///     .build(PathBuf::from("./src"), PathBuf::from("./backups"));
/// assert_eq!(revsnap.config().max_concurrency, 16);
/// ```
#[derive(Debug, Clone)]
pub struct Revsnap {
    source: PathBuf,
    backups_root: PathBuf,
    config: SyncConfig,
    fs: Arc<dyn FileSystem>,
}

impl Revsnap {
    /// Create an instance with default configuration
    pub fn new(source: PathBuf, backups_root: PathBuf) -> Self {
        RevsnapBuilder::new().build(source, backups_root)
    }

    /// Directory being backed up
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Directory holding the snapshot chain
    pub fn backups_root(&self) -> &Path {
        &self.backups_root
    }

    /// Active configuration
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Start a run named after the current instant
    pub async fn run(&self) -> Result<RunHandle> {
        self.run_at(snapshot::now()).await
    }

    /// Start a run whose snapshot is named after `instant`
    ///
    /// # Errors
    ///
    /// - The backups root cannot be created
    /// - [`RevsnapError::AlreadyExists`] if a snapshot with the same name
    ///   exists, whatever the fallback policy
    /// - Promotion failed and the fallback policy is [`RotationFallback::Abort`]
    /// - A scratch capture directory cannot be created
    #[instrument(skip(self), fields(source = ?self.source, backups = ?self.backups_root))]
    pub async fn run_at(&self, instant: DateTime<Utc>) -> Result<RunHandle> {
        let fs: Arc<dyn FileSystem> = Arc::new(ThrottledFileSystem::new(
            self.fs.clone(),
            self.config.max_concurrency,
        ));
        let creator = Arc::new(DirectoryCreator::new(fs.clone()));

        creator.ensure(&self.backups_root).await?;

        let snapshot = snapshot::encode_name(instant);
        let destination = self.backups_root.join(&snapshot);
        info!("Starting snapshot {}", snapshot);

        // a fallback would sync into the existing snapshot and lose its state
        match fs.stat(&destination).await {
            Ok(_) => return Err(RevsnapError::AlreadyExists(destination)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(RevsnapError::io(&destination, e)),
        }

        let (capture, scratch, rotation) = match self.promote(fs.as_ref(), &snapshot).await {
            Ok(previous) => {
                info!("Promoted {} to {}", previous, snapshot);
                let capture = self.backups_root.join(&previous);
                (capture, None, Rotation::Promoted { previous })
            }
            Err(RevsnapError::NoSnapshots(_)) => {
                info!("No previous snapshot in {:?}, starting a new chain", self.backups_root);
                let scratch = scratch_dir()?;
                (scratch.path().to_path_buf(), Some(scratch), Rotation::FirstRun)
            }
            Err(e) => {
                if self.config.rotation_fallback == RotationFallback::Abort {
                    return Err(e);
                }
                warn!("Rotation failed, history for this run will not be kept: {}", e);
                let scratch = scratch_dir()?;
                let reason = e.to_string();
                (scratch.path().to_path_buf(), Some(scratch), Rotation::Degraded { reason })
            }
        };

        let stream = SyncEngine::with_creator(fs, creator)
            .channel_capacity(self.config.channel_capacity)
            .sync(&self.source, &destination, &capture);

        Ok(RunHandle {
            snapshot,
            destination,
            capture,
            rotation,
            stream,
            _scratch: scratch,
        })
    }

    /// Rename the latest snapshot to `snapshot`, returning its old name
    async fn promote(&self, fs: &dyn FileSystem, snapshot: &str) -> Result<String> {
        let previous = snapshot::latest_name(fs, &self.backups_root)
            .await
            .map_err(|e| match e {
                RevsnapError::NoSnapshots(_) => e,
                other => RevsnapError::rotation(format!("cannot list snapshots: {}", other)),
            })?;

        let from = self.backups_root.join(&previous);
        let to = self.backups_root.join(snapshot);
        fs.rename(&from, &to).await.map_err(|e| {
            RevsnapError::rotation(format!("cannot rename {} to {}: {}", previous, snapshot, e))
        })?;
        Ok(previous)
    }

    /// All snapshots in the backups root, newest first
    pub async fn snapshots(&self) -> Result<Vec<Snapshot>> {
        snapshot::list_snapshots(self.fs.as_ref(), &self.backups_root).await
    }

    /// Rebuild the tree as of `snapshot` into an empty `target`
    ///
    /// See [`restore::restore`] for the overlay rules.
    pub async fn restore(&self, snapshot: &str, target: &Path) -> Result<RestoreReport> {
        let chain = self.snapshots().await?;
        restore::restore(&self.backups_root, &chain, snapshot, target).await
    }
}

/// Scratch capture directory outside the backups root
fn scratch_dir() -> Result<TempDir> {
    tempfile::Builder::new()
        .prefix("revsnap-capture-")
        .tempdir()
        .at(std::env::temp_dir())
}

/// An in-progress run
///
/// Owns the scratch capture directory (if any), which is deleted when the
/// handle is dropped.
#[derive(Debug)]
pub struct RunHandle {
    snapshot: String,
    destination: PathBuf,
    capture: PathBuf,
    rotation: Rotation,
    stream: SyncStream,
    _scratch: Option<TempDir>,
}

impl RunHandle {
    /// Name of the snapshot this run produces
    pub fn snapshot(&self) -> &str {
        &self.snapshot
    }

    /// Directory receiving the full mirror
    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Directory receiving replaced and removed entries
    pub fn capture(&self) -> &Path {
        &self.capture
    }

    /// How the directories were chosen
    pub fn rotation(&self) -> &Rotation {
        &self.rotation
    }

    /// True when this run's diff is not kept as history
    pub fn is_degraded(&self) -> bool {
        matches!(self.rotation, Rotation::Degraded { .. })
    }

    /// Next completed path
    pub async fn next(&mut self) -> Option<SyncEvent> {
        self.stream.next().await
    }

    /// Abort the run
    pub fn cancel(&mut self) {
        self.stream.cancel();
    }

    /// Drain remaining events and wait for the report
    pub async fn finish(self) -> Result<SyncReport> {
        self.stream.finish().await
    }

    /// Collect every remaining event along with the report
    pub async fn collect(self) -> Result<(Vec<SyncEvent>, SyncReport)> {
        self.stream.collect().await
    }
}

/// Builder for [`Revsnap`]
#[derive(Debug, Clone)]
pub struct RevsnapBuilder {
    config: SyncConfig,
    fs: Arc<dyn FileSystem>,
}

impl Default for RevsnapBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RevsnapBuilder {
    /// Create a new builder with default settings
    pub fn new() -> Self {
        Self {
            config: SyncConfig::default(),
            fs: Arc::new(LocalFileSystem::new()),
        }
    }

    /// Cap the number of filesystem calls in flight (minimum 1)
    pub fn max_concurrency(mut self, limit: usize) -> Self {
        self.config.max_concurrency = limit.max(1);
        self
    }

    /// Choose what happens when the previous snapshot cannot be promoted
    pub fn rotation_fallback(mut self, policy: RotationFallback) -> Self {
        self.config.rotation_fallback = policy;
        self
    }

    /// Events buffered ahead of a slow consumer
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.channel_capacity = capacity.max(1);
        self
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a different filesystem implementation
    pub fn filesystem(mut self, fs: Arc<dyn FileSystem>) -> Self {
        self.fs = fs;
        self
    }

    /// Build the instance
    pub fn build(self, source: PathBuf, backups_root: PathBuf) -> Revsnap {
        Revsnap {
            source,
            backups_root,
            config: self.config,
            fs: self.fs,
        }
    }
}
