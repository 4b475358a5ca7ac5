//! Deduplicated recursive directory creation
//!
//! Every branch of a sync walk may need the same directory at the same time:
//! two files landing in `capture/a/b`, or a whole subtree being materialized
//! under a freshly created parent. [`DirectoryCreator`] guarantees that each
//! distinct path (and each of its ancestors) is created by exactly one OS call
//! per run, with every other requester awaiting that call's outcome.
//!
//! ## How it works
//!
//! The cache maps absolute paths to a shared `OnceCell`. Looking up a path is
//! a single `DashMap` get-or-insert, so two tasks can never both decide to be
//! the issuer. The first task to reach `get_or_init` ensures the parent, then
//! issues `create_dir`; the rest await the same cell.
//!
//! `AlreadyExists` is tolerated only when the existing entry really is a
//! directory. Any other failure is cached and reported to every requester.
//!
//! The cache lives as long as the creator, and a creator is owned by one run.

use crate::error::RevsnapError;
use crate::fs::FileSystem;
use dashmap::DashMap;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, trace};

/// Successful outcome of ensuring a directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    /// This run created it
    Created,
    /// It was already there
    AlreadyExisted,
}

/// Failure shared by every requester of a path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateFailure {
    /// Something other than a directory occupies the path
    NotADirectory(PathBuf),
    /// The OS refused to create the directory
    Io {
        /// Path whose creation failed
        path: PathBuf,
        /// OS error kind
        kind: io::ErrorKind,
        /// OS error message
        message: String,
    },
}

impl CreateFailure {
    fn io(path: &Path, err: &io::Error) -> Self {
        CreateFailure::Io {
            path: path.to_path_buf(),
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<CreateFailure> for RevsnapError {
    fn from(failure: CreateFailure) -> Self {
        match failure {
            CreateFailure::NotADirectory(path) => RevsnapError::TypeMismatch {
                path,
                expected: "directory",
            },
            CreateFailure::Io { path, kind, message } => RevsnapError::Io {
                path,
                source: io::Error::new(kind, message),
            },
        }
    }
}

type Outcome = std::result::Result<CreateOutcome, CreateFailure>;
type OutcomeFuture<'a> = Pin<Box<dyn Future<Output = Outcome> + Send + 'a>>;

/// Run-scoped, memoized "ensure directory exists"
#[derive(Debug)]
pub struct DirectoryCreator {
    fs: Arc<dyn FileSystem>,
    cache: DashMap<PathBuf, Arc<OnceCell<Outcome>>>,
}

impl DirectoryCreator {
    /// Create an empty creator issuing calls through `fs`
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self {
            fs,
            cache: DashMap::new(),
        }
    }

    /// Ensure `path` and all of its ancestors exist
    ///
    /// Safe to call concurrently and repeatedly. Each distinct path costs at
    /// most one `create_dir` call for the lifetime of this creator.
    ///
    /// # Errors
    ///
    /// - [`RevsnapError::TypeMismatch`] if a non-directory occupies the path
    ///   or one of its ancestors
    /// - [`RevsnapError::Io`] for any creation failure other than
    ///   "already exists"
    pub async fn ensure(&self, path: &Path) -> crate::Result<CreateOutcome> {
        self.ensure_shared(path).await.map_err(RevsnapError::from)
    }

    /// Number of distinct paths requested so far
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Whether nothing has been requested yet
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    fn ensure_shared<'a>(&'a self, path: &'a Path) -> OutcomeFuture<'a> {
        Box::pin(async move {
            let cell = self.cache.entry(path.to_path_buf()).or_default().clone();
            cell.get_or_init(|| self.create_chain(path)).await.clone()
        })
    }

    async fn create_chain(&self, path: &Path) -> Outcome {
        if let Some(parent) = path.parent().filter(|p| !is_top_level(p)) {
            self.ensure_shared(parent).await?;
        }
        self.create_one(path).await
    }

    async fn create_one(&self, path: &Path) -> Outcome {
        match self.fs.create_dir(path).await {
            Ok(()) => {
                debug!("Created directory {:?}", path);
                Ok(CreateOutcome::Created)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                match self.fs.stat(path).await {
                    Ok(stat) if stat.is_dir() => {
                        trace!("Directory already present {:?}", path);
                        Ok(CreateOutcome::AlreadyExisted)
                    }
                    Ok(_) => Err(CreateFailure::NotADirectory(path.to_path_buf())),
                    Err(e) => Err(CreateFailure::io(path, &e)),
                }
            }
            Err(e) => Err(CreateFailure::io(path, &e)),
        }
    }
}

/// True once no further decomposition is possible
fn is_top_level(parent: &Path) -> bool {
    parent.as_os_str().is_empty() || parent.parent().is_none()
}
