//! Snapshot naming and discovery
//!
//! A snapshot is a directory directly under the backups root whose name
//! encodes the instant its run started. The encoding is an on-disk contract:
//! existing chains must stay readable, so it is isolated here behind one
//! [`encode_name`] / [`decode_name`] pair.
//!
//! ## Name format
//!
//! RFC 3339 in UTC with millisecond precision and a `Z` suffix, with every
//! `:` replaced by `_` so the name is legal on every common filesystem:
//!
//! ```text
//! 2024-03-01T12_30_45.123Z
//! ```
//!
//! Entries whose names do not decode are foreign files and are ignored.

use crate::error::{IoResultExt, Result, RevsnapError};
use crate::fs::FileSystem;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, trace};

/// One snapshot directory in a backups root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Directory name
    pub name: String,
    /// Decoded instant
    pub taken_at: DateTime<Utc>,
}

/// Encode an instant as a snapshot directory name
///
/// Sub-millisecond precision is dropped.
///
/// # Examples
///
/// ```rust
/// use chrono::{TimeZone, Utc};
/// use revsnap::snapshot::encode_name;
///
/// let t = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 45).unwrap();
/// assert_eq!(encode_name(t), "2024-03-01T12_30_45.000Z");
/// ```
pub fn encode_name(instant: DateTime<Utc>) -> String {
    instant
        .to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace(':', "_")
}

/// Decode a snapshot directory name back into its instant
///
/// # Errors
///
/// [`RevsnapError::InvalidSnapshotName`] if the name is not a snapshot name.
pub fn decode_name(name: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&name.replace('_', ":"))
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| RevsnapError::InvalidSnapshotName(name.to_string()))
}

/// The current instant, truncated to what a name can represent
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Name for a snapshot started right now
pub fn new_name() -> String {
    encode_name(now())
}

/// All snapshots under `root`, newest first
///
/// Children whose names do not decode are skipped.
///
/// # Errors
///
/// Fails if `root` cannot be listed.
pub async fn list_snapshots(fs: &dyn FileSystem, root: &Path) -> Result<Vec<Snapshot>> {
    let names = fs.list_dir(root).await.at(root)?;

    let mut snapshots: Vec<Snapshot> = names
        .into_iter()
        .filter_map(|name| {
            let name = name.into_string().ok()?;
            match decode_name(&name) {
                Ok(taken_at) => Some(Snapshot { name, taken_at }),
                Err(_) => {
                    trace!("Ignoring foreign entry {:?} in backups root", name);
                    None
                }
            }
        })
        .collect();

    snapshots.sort_by(|a, b| b.taken_at.cmp(&a.taken_at).then_with(|| b.name.cmp(&a.name)));
    debug!("Found {} snapshots in {:?}", snapshots.len(), root);
    Ok(snapshots)
}

/// Name of the most recent snapshot under `root`
///
/// # Errors
///
/// - [`RevsnapError::NoSnapshots`] if no child name decodes
/// - I/O errors if `root` cannot be listed
pub async fn latest_name(fs: &dyn FileSystem, root: &Path) -> Result<String> {
    list_snapshots(fs, root)
        .await?
        .into_iter()
        .next()
        .map(|s| s.name)
        .ok_or_else(|| RevsnapError::NoSnapshots(root.to_path_buf()))
}
