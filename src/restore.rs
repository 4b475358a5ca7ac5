//! Rebuilding an older state from the snapshot chain
//!
//! The newest snapshot is a full mirror. Every older snapshot holds the
//! versions of entries that its successor replaced or removed. To rebuild the
//! tree as of snapshot *i*, copy the newest snapshot into the target, then
//! overlay each older snapshot down to *i*, letting older layers overwrite:
//! they hold the versions that were current at their time.
//!
//! Entries created after run *i* leave no trace in the older snapshots, so
//! they also appear in the rebuilt tree.

use crate::error::{IoResultExt, Result, RevsnapError};
use crate::snapshot::Snapshot;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, instrument, trace};
use walkdir::WalkDir;

/// Outcome of a restore
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreReport {
    /// Snapshot that was rebuilt
    pub snapshot: String,
    /// Number of snapshot directories overlaid
    pub layers: usize,
    /// Files written (later layers may overwrite earlier ones)
    pub files_written: usize,
    /// Wall-clock duration in milliseconds
    pub duration_ms: u64,
}

/// Rebuild `snapshot` into `target`
///
/// `chain` must be ordered newest first, as returned by
/// [`crate::snapshot::list_snapshots`]. `target` must not exist or be empty.
///
/// # Errors
///
/// - [`RevsnapError::NotFound`] if `snapshot` is not part of `chain`
/// - [`RevsnapError::AlreadyExists`] if `target` is a non-empty directory
/// - I/O errors while copying
#[instrument(skip(chain))]
pub async fn restore(
    backups_root: &Path,
    chain: &[Snapshot],
    snapshot: &str,
    target: &Path,
) -> Result<RestoreReport> {
    let started = Instant::now();
    let position = chain
        .iter()
        .position(|s| s.name == snapshot)
        .ok_or_else(|| RevsnapError::NotFound(backups_root.join(snapshot)))?;

    let layers: Vec<PathBuf> = chain[..=position]
        .iter()
        .map(|s| backups_root.join(&s.name))
        .collect();
    let target_dir = target.to_path_buf();

    let files_written = tokio::task::spawn_blocking(move || -> Result<usize> {
        if target_dir.exists() && fs::read_dir(&target_dir).at(&target_dir)?.next().is_some() {
            return Err(RevsnapError::AlreadyExists(target_dir));
        }
        fs::create_dir_all(&target_dir).at(&target_dir)?;
        let mut written = 0;
        for layer in &layers {
            debug!("Overlaying {:?}", layer);
            written += overlay(layer, &target_dir)?;
        }
        Ok(written)
    })
    .await
    .map_err(|e| RevsnapError::internal(format!("restore task failed: {}", e)))??;

    let report = RestoreReport {
        snapshot: snapshot.to_string(),
        layers: position + 1,
        files_written,
        duration_ms: started.elapsed().as_millis() as u64,
    };
    info!(
        "Restored {} from {} layers ({} files)",
        snapshot, report.layers, report.files_written
    );
    Ok(report)
}

/// Copy `layer` onto `target`, replacing whatever is in the way
fn overlay(layer: &Path, target: &Path) -> Result<usize> {
    let mut written = 0;
    for entry in WalkDir::new(layer).min_depth(1).follow_links(false) {
        let entry = entry.map_err(|e| RevsnapError::io(layer, io::Error::other(e)))?;
        let relative = entry
            .path()
            .strip_prefix(layer)
            .map_err(|e| RevsnapError::internal(e.to_string()))?;
        let destination = target.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            if destination.is_file() {
                fs::remove_file(&destination).at(&destination)?;
            }
            fs::create_dir_all(&destination).at(&destination)?;
        } else {
            if destination.is_dir() {
                fs::remove_dir_all(&destination).at(&destination)?;
            }
            fs::copy(entry.path(), &destination).at(&destination)?;
            written += 1;
            trace!("Restored {:?}", relative);
        }
    }
    Ok(written)
}
