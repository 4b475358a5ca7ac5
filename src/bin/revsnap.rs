//! # revsnap CLI - Reverse-incremental backups for a directory
//!
//! ## Usage
//! ```bash
//! # Back up ~/documents into /mnt/backups (one snapshot per run)
//! revsnap ~/documents /mnt/backups
//!
//! # Same, with explicit subcommand and options
//! revsnap sync ~/documents /mnt/backups --max-concurrency 32 --progress
//!
//! # Show the snapshot chain
//! revsnap list /mnt/backups
//!
//! # Rebuild an older state into a new directory
//! revsnap restore /mnt/backups 2024-03-01T09_00_00.000Z ./restored
//! ```
//!
//! Every completed path is printed to stdout as it finishes. Logs and
//! summaries go to stderr.

use chrono::Utc;
use clap::{Args, Parser, Subcommand, ValueEnum};
use colored::*;
use humantime::format_duration;
use indicatif::{ProgressBar, ProgressStyle};
use revsnap::{
    snapshot, EventKind, LocalFileSystem, Result, RevsnapBuilder, RevsnapError, Rotation,
    RotationFallback, SyncEvent, SyncReport,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// revsnap - versioned directory backups
#[derive(Parser)]
#[command(name = "revsnap")]
#[command(version)]
#[command(about = "Mirror a directory into timestamped snapshots, keeping older states as diffs")]
#[command(args_conflicts_with_subcommands = true, subcommand_negates_reqs = true)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(flatten)]
    sync: SyncArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync a source directory into a new snapshot
    Sync(SyncArgs),

    /// List snapshots, newest first
    #[command(alias = "ls")]
    List {
        /// Backups root directory
        backups: PathBuf,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Rebuild the state of a snapshot into an empty directory
    #[command(alias = "rs")]
    Restore {
        /// Backups root directory
        backups: PathBuf,

        /// Snapshot name
        snapshot: String,

        /// Directory to restore into (must be empty or absent)
        target: PathBuf,
    },
}

#[derive(Args)]
struct SyncArgs {
    /// Directory to back up
    #[arg(required = true)]
    source: Option<PathBuf>,

    /// Directory holding the snapshots
    #[arg(required = true)]
    backups: Option<PathBuf>,

    /// Maximum filesystem calls in flight
    #[arg(long)]
    max_concurrency: Option<usize>,

    /// What to do when the previous snapshot cannot be renamed
    #[arg(long, value_enum, default_value = "scratch")]
    on_rotation_failure: FallbackMode,

    /// Show a spinner instead of listing every path
    #[arg(long)]
    progress: bool,

    /// Print the final report as JSON instead of listing every path
    #[arg(long)]
    json: bool,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum FallbackMode {
    /// Sync anyway and discard this run's diff
    Scratch,
    /// Fail the run
    Abort,
}

impl From<FallbackMode> for RotationFallback {
    fn from(mode: FallbackMode) -> Self {
        match mode {
            FallbackMode::Scratch => RotationFallback::Scratch,
            FallbackMode::Abort => RotationFallback::Abort,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Set up logging
    let default_filter = if cli.verbose { "revsnap=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // Disable colors if needed
    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli).await {
        eprintln!("{}: {}", "Error".red().bold(), e.user_message());
        std::process::exit(1);
    }
}

/// Main command runner
async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Some(Commands::Sync(args)) => cmd_sync(args).await,
        Some(Commands::List { backups, json }) => cmd_list(&backups, json).await,
        Some(Commands::Restore { backups, snapshot, target }) => {
            cmd_restore(backups, &snapshot, &target).await
        }
        None => cmd_sync(cli.sync).await,
    }
}

#[derive(Serialize)]
struct RunSummary<'a> {
    snapshot: &'a str,
    destination: &'a Path,
    capture: Option<&'a Path>,
    degraded: bool,
    report: &'a SyncReport,
}

/// Run one backup
async fn cmd_sync(args: SyncArgs) -> Result<()> {
    let (Some(source), Some(backups)) = (args.source, args.backups) else {
        return Err(RevsnapError::InvalidConfiguration(
            "both SOURCE and BACKUPS are required".to_string(),
        ));
    };

    let mut builder = RevsnapBuilder::new().rotation_fallback(args.on_rotation_failure.into());
    if let Some(limit) = args.max_concurrency {
        builder = builder.max_concurrency(limit);
    }
    let revsnap = builder.build(source, backups);

    let mut run = revsnap.run().await?;
    let snapshot = run.snapshot().to_string();
    let destination = run.destination().to_path_buf();
    let capture = match run.rotation() {
        Rotation::Promoted { .. } => Some(run.capture().to_path_buf()),
        Rotation::FirstRun | Rotation::Degraded { .. } => None,
    };
    let degraded = run.is_degraded();

    if !args.json {
        eprintln!("{} {}", "Writing snapshot".blue().bold(), snapshot.yellow());
        if let Rotation::Degraded { reason } = run.rotation() {
            eprintln!(
                "{} {} (changes from this run are not kept as history)",
                "Warning:".yellow().bold(),
                reason
            );
        }
    }

    let progress = if args.progress && !args.json {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {pos} entries {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.enable_steady_tick(Duration::from_millis(100));
        Some(pb)
    } else {
        None
    };

    while let Some(event) = run.next().await {
        match &progress {
            Some(pb) => {
                pb.inc(1);
                pb.set_message(event.path.to_string());
            }
            None if !args.json => print_event(&event),
            None => {}
        }
    }
    let report = run.finish().await?;

    if let Some(pb) = progress {
        pb.finish_and_clear();
    }

    if args.json {
        let summary = RunSummary {
            snapshot: &snapshot,
            destination: &destination,
            capture: capture.as_deref(),
            degraded,
            report: &report,
        };
        let json = serde_json::to_string_pretty(&summary)
            .map_err(|e| RevsnapError::internal(e.to_string()))?;
        println!("{}", json);
        return Ok(());
    }

    eprintln!(
        "{} {} added, {} updated, {} removed, {} unchanged in {}",
        "✓".green().bold(),
        report.added.to_string().green(),
        report.updated.to_string().yellow(),
        report.removed.to_string().red(),
        report.unchanged,
        format_duration(Duration::from_millis(report.duration_ms))
    );
    if let Some(capture) = &capture {
        eprintln!("  History: {}", capture.display().to_string().cyan());
    }
    if !report.skipped.is_empty() {
        eprintln!(
            "{} {} entries skipped:",
            "Warning:".yellow().bold(),
            report.skipped.len()
        );
        for skipped in &report.skipped {
            eprintln!("  {} ({})", skipped.path.display(), skipped.reason.dimmed());
        }
    }

    Ok(())
}

fn print_event(event: &SyncEvent) {
    let marker = event.kind.marker().to_string();
    let marker = match event.kind {
        EventKind::Added => marker.green(),
        EventKind::Updated => marker.yellow(),
        EventKind::Removed => marker.red(),
    };
    println!("{} {}", marker, event.path);
}

/// Show the snapshot chain
async fn cmd_list(backups: &Path, json: bool) -> Result<()> {
    let snapshots = snapshot::list_snapshots(&LocalFileSystem::new(), backups).await?;

    if json {
        let json = serde_json::to_string_pretty(&snapshots)
            .map_err(|e| RevsnapError::internal(e.to_string()))?;
        println!("{}", json);
        return Ok(());
    }

    if snapshots.is_empty() {
        println!("{}", "No snapshots yet".dimmed());
        return Ok(());
    }

    let now = Utc::now();
    for (idx, snap) in snapshots.iter().enumerate() {
        let age = (now - snap.taken_at)
            .to_std()
            .map(|d| format!("{} ago", format_duration(Duration::from_secs(d.as_secs()))))
            .unwrap_or_else(|_| "in the future".to_string());
        let label = if idx == 0 {
            "full mirror".green().to_string()
        } else {
            "diff".dimmed().to_string()
        };
        println!("{}  {}  {}", snap.name.yellow(), label, age.dimmed());
    }
    Ok(())
}

/// Rebuild an older state
async fn cmd_restore(backups: PathBuf, snapshot: &str, target: &Path) -> Result<()> {
    let revsnap = RevsnapBuilder::new().build(PathBuf::new(), backups);

    println!("{} {}", "Restoring snapshot".blue().bold(), snapshot.yellow());
    let report = revsnap.restore(snapshot, target).await?;

    println!(
        "{} Restored {} files from {} snapshots into {} in {}",
        "✓".green().bold(),
        report.files_written.to_string().cyan(),
        report.layers,
        target.display().to_string().cyan(),
        format_duration(Duration::from_millis(report.duration_ms))
    );
    Ok(())
}
