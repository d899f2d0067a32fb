/*!
zchain CLI - chained ZFS snapshot backup and restore.

Runs one backup, restore, cleanup or listing per invocation under an exclusive
run lock. Every failure exits with status 2.
*/

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tabled::{Table, Tabled};
use tracing::{error, info, warn};
use zchain_core::config::{
    default_lockfile, DEFAULT_INTERVAL_DAYS, DEFAULT_LOCK_DIR, DEFAULT_LOG_DIR, DEFAULT_PREFIX,
    DEFAULT_RETENTION_CHAINS, EXIT_INVALID_ARGS, LOCK_DIR_ENV, LOG_DIR_ENV,
};
use zchain_core::{
    install_termination_cleanup, observability, Action, ArtifactVerifier, BackupEngine,
    BackupMode, BackupSettings, ChainStore, LockHandle, LoggingConfig, Pipeline, Preflight,
    RestoreEngine, RestoreOptions, RestoreOutcome, RestoreSettings, SnapshotFacility, Toolbox,
    ZfsCli,
};

#[derive(Parser, Debug)]
#[command(name = "zchain")]
#[command(about = "Simple, atomic ZFS backup/restore with full/diff chains and retention")]
#[command(version)]
struct Cli {
    /// Source dataset, e.g. rpool/data
    #[arg(short, long)]
    dataset: String,

    /// Mounted filesystem receiving the backups
    #[arg(short, long = "mount")]
    mount_point: PathBuf,

    /// Snapshot and file name prefix
    #[arg(short = 'x', long, default_value = DEFAULT_PREFIX)]
    prefix: String,

    /// Number of chains to keep
    #[arg(short = 'k', long, default_value_t = DEFAULT_RETENTION_CHAINS)]
    retention: usize,

    /// Lock file path (default: <lock-dir>/zfs-simple-backup-restore.lock)
    #[arg(short, long)]
    lockfile: Option<PathBuf>,

    /// Directory for the default lock file
    #[arg(long, env = LOCK_DIR_ENV, default_value = DEFAULT_LOCK_DIR)]
    lock_dir: PathBuf,

    /// Directory for the appended log file
    #[arg(long, env = LOG_DIR_ENV, default_value = DEFAULT_LOG_DIR)]
    log_dir: PathBuf,

    /// Log what would happen without changing snapshots or datasets
    #[arg(short = 'n', long, global = true)]
    dry_run: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Deadline in seconds for one send or receive stream
    #[arg(long, default_value_t = 24 * 60 * 60)]
    stream_timeout: u64,

    /// Write Prometheus metrics to this file after the run
    #[arg(long)]
    metrics_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a full or differential backup, then prune old chains
    Backup {
        /// Days between full backups
        #[arg(short, long, default_value_t = DEFAULT_INTERVAL_DAYS)]
        interval: u32,

        /// Limit the send rate through pv, e.g. 10M, 50M, 1G
        #[arg(short = 'R', long)]
        rate: Option<String>,
    },
    /// Restore a chain into a pool
    Restore {
        /// Pool receiving the restored dataset
        #[arg(short = 'p', long)]
        restore_pool: String,

        /// Chain folder to restore (default: latest)
        #[arg(short = 'c', long)]
        restore_chain: Option<String>,

        /// Restore up to this file name or timestamp
        #[arg(short = 's', long)]
        restore_snapshot: Option<String>,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        force: bool,
    },
    /// Prune old chains and stale temporary files
    Cleanup,
    /// List chains and artifacts
    List,
}

impl Cli {
    fn action(&self) -> Action {
        match self.command {
            Commands::Backup { .. } => Action::Backup,
            Commands::Restore { .. } => Action::Restore,
            Commands::Cleanup => Action::Cleanup,
            Commands::List => Action::List,
        }
    }

    fn backup_settings(&self) -> BackupSettings {
        let mut settings = BackupSettings::new(self.dataset.clone(), self.mount_point.clone());
        settings.prefix = self.prefix.clone();
        settings.retention_chains = self.retention;
        settings.dry_run = self.dry_run;
        settings.stream_timeout = Duration::from_secs(self.stream_timeout);
        if let Commands::Backup { interval, rate } = &self.command {
            settings.interval_days = *interval;
            settings.rate = rate.clone();
        }
        settings
    }

    fn restore_settings(&self) -> Option<RestoreSettings> {
        match &self.command {
            Commands::Restore {
                restore_pool,
                restore_chain,
                restore_snapshot,
                force,
            } => Some(RestoreSettings {
                pool: Some(restore_pool.clone()),
                chain: restore_chain.clone(),
                snapshot: restore_snapshot.clone(),
                force: *force,
            }),
            _ => None,
        }
    }

    fn lockfile(&self) -> PathBuf {
        self.lockfile
            .clone()
            .unwrap_or_else(|| default_lockfile(&self.lock_dir))
    }
}

#[derive(Tabled)]
struct ArtifactRow {
    #[tabled(rename = "Chain")]
    chain: String,
    #[tabled(rename = "Artifact")]
    artifact: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Created")]
    created: String,
    #[tabled(rename = "Size")]
    size: String,
    #[tabled(rename = "Snapshot")]
    snapshot: String,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let logging = LoggingConfig {
        verbose: cli.verbose,
        log_dir: Some(cli.log_dir.clone()),
    };
    if let Err(e) = observability::init_logging(&logging) {
        eprintln!("Failed to initialize logging: {e}");
    }

    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| run(&cli)));
    ExitCode::from(exit_status(outcome))
}

/// Process exit status for a run; errors and panics alike exit with 2
fn exit_status(outcome: std::thread::Result<anyhow::Result<()>>) -> u8 {
    match outcome {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => {
            error!("{e:#}");
            EXIT_INVALID_ARGS
        }
        Err(_) => {
            error!("Internal error: run aborted by a panic");
            EXIT_INVALID_ARGS
        }
    }
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    let action = cli.action();
    let settings = cli.backup_settings();
    let restore = cli.restore_settings();

    let toolbox = Toolbox::new(Pipeline::system());
    let facility = ZfsCli::new(toolbox.clone());
    Preflight::new().check(action, &settings, restore.as_ref(), &toolbox, &facility)?;

    let mut lock = LockHandle::acquire(cli.lockfile())?;
    install_termination_cleanup(lock.path())?;
    info!(action = %action, dataset = %settings.dataset, dry_run = settings.dry_run, "Starting");

    let result = dispatch(action, settings, restore, toolbox, facility);
    lock.release();

    if let Some(path) = &cli.metrics_file {
        write_metrics(path);
    }
    result
}

fn dispatch(
    action: Action,
    settings: BackupSettings,
    restore: Option<RestoreSettings>,
    toolbox: Toolbox,
    facility: ZfsCli,
) -> anyhow::Result<()> {
    let store = ChainStore::new(settings.target_dir());
    let verifier = ArtifactVerifier::new(toolbox.clone());

    match action {
        Action::Backup | Action::Cleanup => {
            let engine = BackupEngine::new(settings, store, facility, toolbox, verifier);
            if action == Action::Cleanup {
                engine.cleanup()?;
                return Ok(());
            }

            let outcome = engine.run()?;
            let kind = match outcome.mode {
                BackupMode::Full => "full",
                BackupMode::Differential { .. } => "differential",
            };
            if outcome.fell_back {
                warn!(chain = %outcome.chain, "Base snapshot was missing; started a new full backup");
            }
            match &outcome.artifact {
                Some(path) => info!(kind, artifact = %path.display(), "Backup written"),
                None => info!(kind, snapshot = %outcome.snapshot, "[dry-run] Backup planned"),
            }
            Ok(())
        }
        Action::Restore => {
            let restore = restore.context("restore settings missing")?;
            let options = RestoreOptions::from_settings(&settings, &restore)?;
            let engine = RestoreEngine::new(options, store, facility, toolbox, verifier);
            match engine.run()? {
                RestoreOutcome::Restored { dest, artifacts } => {
                    info!(dest = %dest, count = artifacts.len(), "Restore complete")
                }
                RestoreOutcome::DryRun { dest, artifacts } => {
                    info!(dest = %dest, count = artifacts.len(), "[dry-run] Restore planned")
                }
                RestoreOutcome::Declined => {}
            }
            Ok(())
        }
        Action::List => list_chains(&settings, &store, &facility),
    }
}

fn list_chains(
    settings: &BackupSettings,
    store: &ChainStore,
    facility: &impl SnapshotFacility,
) -> anyhow::Result<()> {
    let chains = store.list_chains()?;
    if chains.is_empty() {
        println!("No chains found in {}", store.root().display());
        return Ok(());
    }

    let snapshots: Option<BTreeSet<String>> = match facility.list_snapshots(&settings.dataset) {
        Ok(names) => Some(names.into_iter().collect()),
        Err(e) => {
            warn!(error = %e, "Could not list snapshots");
            None
        }
    };

    let mut rows = Vec::new();
    for chain in &chains {
        for artifact in store.list_artifacts(chain)? {
            let full_name = format!("{}@{}", settings.dataset, artifact.id.snapshot_name());
            let snapshot = match &snapshots {
                Some(set) if set.contains(&full_name) => "present",
                Some(_) => "missing",
                None => "unknown",
            };
            rows.push(ArtifactRow {
                chain: chain.clone(),
                artifact: artifact.file_name(),
                kind: artifact.id.kind.to_string(),
                created: artifact.id.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
                size: format_size(artifact.size),
                snapshot: snapshot.to_string(),
            });
        }
    }

    if rows.is_empty() {
        println!("No artifacts found in {} chain(s)", chains.len());
    } else {
        println!("{}", Table::new(rows));
    }
    Ok(())
}

#[cfg(feature = "metrics")]
fn write_metrics(path: &Path) {
    match observability::write_metrics_file(path) {
        Ok(()) => info!(path = %path.display(), "Metrics written"),
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to write metrics"),
    }
}

#[cfg(not(feature = "metrics"))]
fn write_metrics(path: &Path) {
    warn!(path = %path.display(), "Metrics support not enabled");
}

fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}
