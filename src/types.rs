//! Core data types used throughout the revsnap library
//!
//! This module contains fundamental data structures that are shared across
//! different components of the library.
//!
//! ## Overview
//!
//! The types in this module represent:
//! - **Tree positions**: `RelPath` - a path relative to the source, destination or capture root
//! - **File System State**: `EntryKind`, `EntryStat` - what a single stat call reports
//! - **Results**: `SyncEvent`, `SyncReport`, `SkippedEntry` - what a run produced
//! - **Configuration**: `SyncConfig`, `RotationFallback` - run parameters
//!
//! ## Examples
//!
//! ```rust
//! use revsnap::types::RelPath;
//!
//! let rel = RelPath::root().join("sub").join("b.txt");
//! assert_eq!(rel.depth(), 2);
//! assert_eq!(rel.to_string(), "sub/b.txt");
//! ```

use serde::{Deserialize, Serialize};
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// A path relative to one of the roots a run operates on
///
/// Stored as an ordered list of segments. The empty list denotes the root
/// itself; joining appends one segment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelPath {
    segments: Vec<OsString>,
}

impl RelPath {
    /// The root of a tree
    pub fn root() -> Self {
        Self::default()
    }

    /// Whether this denotes the root itself
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Number of segments
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// Append one segment, returning the child path
    pub fn join(&self, name: impl AsRef<OsStr>) -> Self {
        let mut segments = Vec::with_capacity(self.segments.len() + 1);
        segments.extend(self.segments.iter().cloned());
        segments.push(name.as_ref().to_os_string());
        Self { segments }
    }

    /// The containing path, or `None` for the root
    pub fn parent(&self) -> Option<Self> {
        let (_, rest) = self.segments.split_last()?;
        Some(Self {
            segments: rest.to_vec(),
        })
    }

    /// Last segment, or `None` for the root
    pub fn file_name(&self) -> Option<&OsStr> {
        self.segments.last().map(OsString::as_os_str)
    }

    /// Resolve against an absolute root
    pub fn under(&self, root: &Path) -> PathBuf {
        let mut path = root.to_path_buf();
        path.extend(self.segments.iter());
        path
    }

    /// Convert to a relative `PathBuf`
    pub fn to_path_buf(&self) -> PathBuf {
        self.segments.iter().collect()
    }
}

impl fmt::Display for RelPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str(".");
        }
        for (idx, segment) in self.segments.iter().enumerate() {
            if idx > 0 {
                f.write_str("/")?;
            }
            write!(f, "{}", segment.to_string_lossy())?;
        }
        Ok(())
    }
}

impl<S: AsRef<OsStr>> FromIterator<S> for RelPath {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            segments: iter.into_iter().map(|s| s.as_ref().to_os_string()).collect(),
        }
    }
}

/// Kind of a filesystem entry
///
/// The kind is authoritative for every branching decision the engine makes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// Regular file
    File,
    /// Directory
    Directory,
    /// Anything else (sockets, fifos, devices)
    Other,
}

impl EntryKind {
    /// Human-readable label
    pub fn as_str(self) -> &'static str {
        match self {
            EntryKind::File => "file",
            EntryKind::Directory => "directory",
            EntryKind::Other => "special file",
        }
    }
}

/// Result of a single stat call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryStat {
    /// Entry kind
    pub kind: EntryKind,
    /// Size in bytes
    pub size: u64,
    /// Last modification time
    pub modified: SystemTime,
}

impl EntryStat {
    /// Build from OS metadata
    pub fn from_metadata(metadata: &Metadata) -> io::Result<Self> {
        let file_type = metadata.file_type();
        let kind = if file_type.is_dir() {
            EntryKind::Directory
        } else if file_type.is_file() {
            EntryKind::File
        } else {
            EntryKind::Other
        };

        Ok(Self {
            kind,
            size: metadata.len(),
            modified: metadata.modified()?,
        })
    }

    /// Regular file?
    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    /// Directory?
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// What happened to a path during a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// Copied from the source; nothing was there before
    Added,
    /// Previous version moved to the capture directory, then replaced
    Updated,
    /// Moved to the capture directory; no longer in the source
    Removed,
}

impl EventKind {
    /// Single-character marker used by the CLI
    pub fn marker(self) -> char {
        match self {
            EventKind::Added => '+',
            EventKind::Updated => '~',
            EventKind::Removed => '-',
        }
    }
}

/// One entry of the result stream
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SyncEvent {
    /// Path relative to the source and destination roots
    pub path: RelPath,
    /// What was done to it
    pub kind: EventKind,
}

impl fmt::Display for SyncEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind.marker(), self.path)
    }
}

/// A subtree that was abandoned while the rest of the run continued
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedEntry {
    /// Path relative to the source root
    pub path: PathBuf,
    /// Why it was skipped
    pub reason: String,
}

/// Summary of a completed sync run
///
/// # Examples
///
/// ```rust
/// # use revsnap::types::SyncReport;
/// let report = SyncReport {
///     added: 3,
///     updated: 1,
///     removed: 2,
///     ..Default::default()
/// };
///
/// assert_eq!(report.total_operations(), 6);
/// assert!(report.is_complete());
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncReport {
    /// Entries copied that did not exist in the destination
    pub added: usize,
    /// Entries replaced after moving the previous version out
    pub updated: usize,
    /// Destination-only entries moved to the capture directory
    pub removed: usize,
    /// Files left alone because the destination was already current
    pub unchanged: usize,
    /// Subtrees abandoned because of isolated failures
    pub skipped: Vec<SkippedEntry>,
    /// Wall-clock duration in milliseconds
    pub duration_ms: u64,
}

impl SyncReport {
    /// Total number of entries touched
    pub fn total_operations(&self) -> usize {
        self.added + self.updated + self.removed
    }

    /// True when nothing was skipped
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty()
    }

    /// True when the run changed nothing
    pub fn has_changes(&self) -> bool {
        self.total_operations() > 0
    }
}

/// What to do when the previous snapshot cannot be promoted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationFallback {
    /// Sync into a fresh snapshot and capture displaced entries in a
    /// temporary directory that is discarded after the run
    #[default]
    Scratch,
    /// Fail the run
    Abort,
}

/// Smallest accepted concurrency cap
pub const MIN_CONCURRENCY: usize = 1;
/// Largest accepted concurrency cap
pub const MAX_CONCURRENCY: usize = 256;
/// Environment variable overriding the default concurrency cap
pub const CONCURRENCY_ENV: &str = "REVSNAP_MAX_CONCURRENCY";

/// Configuration for a revsnap instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Maximum number of filesystem calls in flight
    pub max_concurrency: usize,
    /// Behavior when the previous snapshot cannot be renamed
    pub rotation_fallback: RotationFallback,
    /// Buffered events before the engine waits on the consumer
    pub channel_capacity: usize,
}

impl SyncConfig {
    /// Resolve the default concurrency cap
    ///
    /// Priority: `REVSNAP_MAX_CONCURRENCY` > twice the CPU count. The result is
    /// clamped to [`MIN_CONCURRENCY`, `MAX_CONCURRENCY`].
    pub fn default_concurrency() -> usize {
        let cpu_default = || num_cpus::get() * 2;
        let raw = match std::env::var(CONCURRENCY_ENV) {
            Ok(value) => value.parse::<usize>().unwrap_or_else(|_| cpu_default()),
            Err(_) => cpu_default(),
        };
        raw.clamp(MIN_CONCURRENCY, MAX_CONCURRENCY)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_concurrency: Self::default_concurrency(),
            rotation_fallback: RotationFallback::default(),
            channel_capacity: crate::engine::DEFAULT_CHANNEL_CAPACITY,
        }
    }
}
