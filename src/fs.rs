//! Filesystem primitives consumed by the sync engine
//!
//! The engine never touches `std::fs` or `tokio::fs` directly. Every list,
//! stat, copy, move and create goes through the [`FileSystem`] trait so that a
//! run can be throttled, instrumented or pointed at a test double.
//!
//! ## Implementations
//!
//! - [`LocalFileSystem`]: the OS filesystem via `tokio::fs`
//! - [`ThrottledFileSystem`]: caps the number of primitive calls in flight
//!
//! All methods return raw `io::Result`s. Callers decide which error kinds to
//! tolerate (directory creation tolerates `AlreadyExists`) and attach path
//! context themselves.

use crate::types::EntryStat;
use async_trait::async_trait;
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, trace};
use walkdir::WalkDir;

/// Primitive filesystem operations
///
/// Each operation may fail independently. `copy_file` and `rename` assume the
/// destination's parent directory already exists.
#[async_trait]
pub trait FileSystem: Send + Sync + fmt::Debug {
    /// Names of the immediate children of a directory
    async fn list_dir(&self, path: &Path) -> io::Result<Vec<OsString>>;

    /// Kind, size and modification time of an entry
    async fn stat(&self, path: &Path) -> io::Result<EntryStat>;

    /// Copy one regular file, replacing the destination if present
    async fn copy_file(&self, from: &Path, to: &Path) -> io::Result<()>;

    /// Move an entry (and its whole subtree) to a new path
    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    /// Create a single directory; the parent must exist
    async fn create_dir(&self, path: &Path) -> io::Result<()>;
}

/// The local OS filesystem
///
/// `stat` follows symbolic links, so a link to a file is synced as that file
/// and a dangling link reports `NotFound`. `rename` falls back to copy and
/// delete when source and destination live on different devices.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileSystem;

impl LocalFileSystem {
    /// Create the local filesystem handle
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FileSystem for LocalFileSystem {
    async fn list_dir(&self, path: &Path) -> io::Result<Vec<OsString>> {
        let mut entries = tokio::fs::read_dir(path).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name());
        }
        Ok(names)
    }

    async fn stat(&self, path: &Path) -> io::Result<EntryStat> {
        let metadata = tokio::fs::metadata(path).await?;
        EntryStat::from_metadata(&metadata)
    }

    async fn copy_file(&self, from: &Path, to: &Path) -> io::Result<()> {
        tokio::fs::copy(from, to).await?;
        Ok(())
    }

    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        match tokio::fs::rename(from, to).await {
            Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
                debug!("Cross-device move {:?} -> {:?}, copying instead", from, to);
                let (from, to) = (from.to_path_buf(), to.to_path_buf());
                tokio::task::spawn_blocking(move || move_across_devices(&from, &to))
                    .await
                    .map_err(io::Error::other)?
            }
            other => other,
        }
    }

    async fn create_dir(&self, path: &Path) -> io::Result<()> {
        tokio::fs::create_dir(path).await
    }
}

/// Emulate a move with copy + delete
fn move_across_devices(from: &Path, to: &Path) -> io::Result<()> {
    let metadata = fs::symlink_metadata(from)?;
    if !metadata.is_dir() {
        copy_entry(from, to, &metadata)?;
        return fs::remove_file(from);
    }

    for entry in WalkDir::new(from).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(io::Error::other)?;
        let target: PathBuf = to.join(relative);
        let metadata = entry.metadata().map_err(io::Error::other)?;
        if metadata.is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            copy_entry(entry.path(), &target, &metadata)?;
        }
        trace!("Copied {:?} across devices", relative);
    }
    fs::remove_dir_all(from)
}

fn copy_entry(from: &Path, to: &Path, metadata: &fs::Metadata) -> io::Result<()> {
    #[cfg(unix)]
    if metadata.file_type().is_symlink() {
        let target = fs::read_link(from)?;
        return std::os::unix::fs::symlink(target, to);
    }
    #[cfg(not(unix))]
    let _ = metadata;

    fs::copy(from, to).map(|_| ())
}

/// Caps the number of primitive calls in flight
///
/// A permit is held only while one primitive call runs, never across a
/// caller's recursion, so nested walks cannot starve themselves.
#[derive(Debug, Clone)]
pub struct ThrottledFileSystem {
    inner: Arc<dyn FileSystem>,
    permits: Arc<Semaphore>,
    limit: usize,
}

impl ThrottledFileSystem {
    /// Wrap `inner`, allowing at most `limit` calls at once (minimum 1)
    pub fn new(inner: Arc<dyn FileSystem>, limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            inner,
            permits: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    /// Configured cap
    pub fn limit(&self) -> usize {
        self.limit
    }

    async fn permit(&self) -> io::Result<tokio::sync::SemaphorePermit<'_>> {
        self.permits.acquire().await.map_err(io::Error::other)
    }
}

#[async_trait]
impl FileSystem for ThrottledFileSystem {
    async fn list_dir(&self, path: &Path) -> io::Result<Vec<OsString>> {
        let _permit = self.permit().await?;
        self.inner.list_dir(path).await
    }

    async fn stat(&self, path: &Path) -> io::Result<EntryStat> {
        let _permit = self.permit().await?;
        self.inner.stat(path).await
    }

    async fn copy_file(&self, from: &Path, to: &Path) -> io::Result<()> {
        let _permit = self.permit().await?;
        self.inner.copy_file(from, to).await
    }

    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        let _permit = self.permit().await?;
        self.inner.rename(from, to).await
    }

    async fn create_dir(&self, path: &Path) -> io::Result<()> {
        let _permit = self.permit().await?;
        self.inner.create_dir(path).await
    }
}
