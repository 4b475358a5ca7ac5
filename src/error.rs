//! Error types for the revsnap library
//!
//! This module defines all error types that can occur while rotating snapshots
//! and synchronizing trees. Errors carry the path they concern wherever one is
//! known, so a failed run can be traced back to a concrete entry on disk.
//!
//! ## Taxonomy
//!
//! - **NotFound**: an entry that was expected to exist is missing
//! - **AlreadyExists**: only ever tolerated by directory creation
//! - **TypeMismatch**: an entry has a different kind than required
//! - **Io**: generic copy/move/stat/list failure
//! - **NoSnapshots** / **Rotation**: orchestration failures during rotation

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Type alias for Results in the revsnap library
pub type Result<T> = std::result::Result<T, RevsnapError>;

/// Main error type for all revsnap operations
#[derive(Debug, Error)]
pub enum RevsnapError {
    /// I/O error with the path that triggered it
    #[error("IO error at {path:?}: {source}")]
    Io {
        /// Path the failing operation was applied to
        path: PathBuf,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },

    /// Entry does not exist
    #[error("Not found: {0:?}")]
    NotFound(PathBuf),

    /// Entry already exists
    #[error("Already exists: {0:?}")]
    AlreadyExists(PathBuf),

    /// Entry exists but has an unexpected kind
    #[error("Type mismatch at {path:?}: expected {expected}")]
    TypeMismatch {
        /// Offending path
        path: PathBuf,
        /// Human-readable expected kind
        expected: &'static str,
    },

    /// The backups root holds no decodable snapshot
    #[error("No snapshots found in {0:?}")]
    NoSnapshots(PathBuf),

    /// Promoting the previous snapshot failed
    #[error("Snapshot rotation failed: {0}")]
    Rotation(String),

    /// A name does not decode to a snapshot instant
    #[error("Invalid snapshot name: {0}")]
    InvalidSnapshotName(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The run was aborted before completion
    #[error("Sync run was cancelled")]
    Cancelled,

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RevsnapError {
    /// Wrap an OS error, mapping the kinds the engine branches on
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        let path = path.as_ref().to_path_buf();
        match source.kind() {
            io::ErrorKind::NotFound => RevsnapError::NotFound(path),
            io::ErrorKind::AlreadyExists => RevsnapError::AlreadyExists(path),
            _ => RevsnapError::Io { path, source },
        }
    }

    /// Create a rotation error with a custom message
    pub fn rotation(msg: impl Into<String>) -> Self {
        RevsnapError::Rotation(msg.into())
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        RevsnapError::Internal(msg.into())
    }

    /// Check if this error is a missing entry
    pub fn is_not_found(&self) -> bool {
        match self {
            RevsnapError::NotFound(_) => true,
            RevsnapError::Io { source, .. } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Check if this error belongs to the rotation step of a run
    pub fn is_orchestration(&self) -> bool {
        matches!(
            self,
            RevsnapError::NoSnapshots(_) | RevsnapError::Rotation(_)
        )
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            RevsnapError::NoSnapshots(root) => {
                format!("No snapshots found in {:?}. Run a sync first to create one.", root)
            }
            RevsnapError::NotFound(path) => {
                format!("{:?} does not exist. Check the path and try again.", path)
            }
            RevsnapError::Io { path, source } if source.kind() == io::ErrorKind::PermissionDenied => {
                format!("Permission denied for {:?}. Check file permissions or run with appropriate privileges.", path)
            }
            _ => self.to_string(),
        }
    }
}

/// Extension for attaching a path to raw `io::Result`s
pub(crate) trait IoResultExt<T> {
    fn at(self, path: impl AsRef<Path>) -> Result<T>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn at(self, path: impl AsRef<Path>) -> Result<T> {
        self.map_err(|e| RevsnapError::io(path, e))
    }
}
