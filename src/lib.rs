//! # revsnap - Reverse-incremental directory snapshots
//!
//! Mirrors a source directory into a timestamp-named snapshot under a backups
//! root while keeping every earlier state as a chain of diffs.
//!
//! ## Overview
//!
//! Each run:
//! - renames the newest snapshot to a fresh timestamp, so the full previous
//!   mirror becomes the directory to update in place
//! - walks source and destination side by side, copying new and changed
//!   entries into the mirror
//! - moves every entry it replaces or removes to the same relative path under
//!   the snapshot's old name
//!
//! The newest snapshot is therefore always a complete copy of the source,
//! and each older snapshot holds only what changed relative to its successor.
//!
//! ```text
//! backups/
//!   2024-03-02T09_00_00.000Z/   full mirror
//!   2024-03-01T09_00_00.000Z/   files replaced or removed on 03-02
//!   2024-02-28T09_00_00.000Z/   files replaced or removed on 03-01
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use revsnap::Revsnap;
//! use std::path::PathBuf;
//!
//! # #[tokio::main]
//! # async fn main() -> revsnap::Result<()> {
//! let revsnap = Revsnap::new(PathBuf::from("./project"), PathBuf::from("./backups"));
//!
//! let mut run = revsnap.run().await?;
//! println!("Writing snapshot {}", run.snapshot());
//! while let Some(event) = run.next().await {
//!     println!("{}", event);
//! }
//!
//! let report = run.finish().await?;
//! println!("{} added, {} updated, {} removed", report.added, report.updated, report.removed);
//! # Ok(())
//! # }
//! ```
//!
//! ## Change Detection
//!
//! Files are compared by size and modification time only. A destination file
//! is current when its size equals the source's and it is not older than the
//! source. Contents are never hashed.
//!
//! ## Concurrency
//!
//! Every entry of a directory is processed as its own task. The total number
//! of filesystem calls in flight is capped by
//! [`SyncConfig::max_concurrency`](types::SyncConfig). Directory creation is
//! deduplicated per run so concurrent branches never race on the same path.
//!
//! ## Error Handling
//!
//! All operations return `Result<T, RevsnapError>`. Failures while copying a
//! new subtree are isolated: the subtree is skipped, listed in the final
//! [`SyncReport`], and the run continues.
//!
//! ## Module Organization
//!
//! - [`rotation`]: run orchestration and the [`Revsnap`] entry point
//! - [`engine`]: tree diff and merge
//! - [`dir_creator`]: deduplicated directory creation
//! - [`snapshot`]: snapshot naming and discovery
//! - [`restore`]: rebuilding older states
//! - [`fs`]: filesystem primitives
//! - [`types`]: common types
//! - [`error`]: error types

pub mod dir_creator;
pub mod engine;
pub mod error;
pub mod fs;
pub mod restore;
pub mod rotation;
pub mod snapshot;
pub mod types;

pub use dir_creator::{CreateOutcome, DirectoryCreator};
pub use engine::{SyncEngine, SyncStream};
pub use error::{Result, RevsnapError};
pub use fs::{FileSystem, LocalFileSystem, ThrottledFileSystem};
pub use restore::RestoreReport;
pub use rotation::{Revsnap, RevsnapBuilder, Rotation, RunHandle};
pub use snapshot::Snapshot;
pub use types::*;
