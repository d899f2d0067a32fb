/*!
Backup orchestration: the full/differential decision and artifact production.

Every run makes exactly one decision:

1. No pointer, or the pointed chain holds no full artifact: full backup.
2. The newest full artifact is at least `interval_days` whole days old: full
   backup into a chain dated today.
3. Otherwise a differential against that full, unless its snapshot has been
   destroyed, in which case the run falls back to a full backup.

An artifact only receives its final name after it has been written, found
non-empty and verified. Any failure removes the partial file and destroys the
snapshot taken for the run. Retention pruning runs after every successful
backup.
*/

use crate::artifact::{Artifact, ArtifactId, ArtifactKind};
use crate::config::BackupSettings;
use crate::store::{ChainDir, ChainStore, PruneReport};
use crate::tools::Toolbox;
use crate::verify::ArtifactVerifier;
use crate::zfs::SnapshotFacility;
use crate::{observability, Result, ZchainError};
use chrono::{Local, NaiveDateTime};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// What the run will produce
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupMode {
    /// New lineage in today's chain
    Full,
    /// Incremental from the chain's newest full artifact
    Differential { base: Artifact },
}

impl BackupMode {
    pub fn kind(&self) -> ArtifactKind {
        match self {
            BackupMode::Full => ArtifactKind::Full,
            BackupMode::Differential { .. } => ArtifactKind::Diff,
        }
    }

    /// Human label used in logs and failure messages
    pub fn label(&self) -> &'static str {
        match self {
            BackupMode::Full => "Full",
            BackupMode::Differential { .. } => "Differential",
        }
    }
}

/// The decision for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupPlan {
    pub mode: BackupMode,
    /// Chain receiving the artifact
    pub chain: String,
    /// A differential was planned but its base snapshot is gone
    pub fell_back: bool,
}

/// Result of a backup run
#[derive(Debug, Clone)]
pub struct BackupOutcome {
    pub mode: BackupMode,
    pub chain: String,
    /// Snapshot taken (or that would have been taken) for this run
    pub snapshot: String,
    /// Final artifact path; `None` in dry-run
    pub artifact: Option<PathBuf>,
    pub fell_back: bool,
    pub dry_run: bool,
    pub pruned: PruneReport,
}

/// Produces full and differential artifacts for one dataset
#[derive(Debug)]
pub struct BackupEngine<F: SnapshotFacility> {
    settings: BackupSettings,
    store: ChainStore,
    facility: F,
    toolbox: Toolbox,
    verifier: ArtifactVerifier,
}

impl<F: SnapshotFacility> BackupEngine<F> {
    pub fn new(
        settings: BackupSettings,
        store: ChainStore,
        facility: F,
        toolbox: Toolbox,
        verifier: ArtifactVerifier,
    ) -> Self {
        Self {
            settings,
            store,
            facility,
            toolbox,
            verifier,
        }
    }

    pub fn store(&self) -> &ChainStore {
        &self.store
    }

    /// Decide between a full and a differential backup at `now`
    pub fn plan(&self, now: NaiveDateTime) -> Result<BackupPlan> {
        let full = BackupPlan {
            mode: BackupMode::Full,
            chain: ChainStore::chain_name_for(now.date()),
            fell_back: false,
        };

        let Some(chain) = self.store.read_last_chain()? else {
            info!("No previous chain recorded, starting a full backup");
            return Ok(full);
        };

        let base = match self.store.latest_full(&chain, &self.settings.prefix) {
            Ok(Some(base)) => base,
            Ok(None) | Err(ZchainError::ChainNotFound { .. }) => {
                info!(chain = %chain, "No full backup in last chain, starting a full backup");
                return Ok(full);
            }
            Err(e) => return Err(e),
        };

        let age_days = (now - base.id.timestamp).num_days();
        if age_days >= i64::from(self.settings.interval_days) {
            info!(
                base = %base.file_name(),
                age_days,
                interval_days = self.settings.interval_days,
                "Last full backup is due for renewal, starting a new chain"
            );
            return Ok(full);
        }

        let base_snapshot = base.id.snapshot_name();
        if !self
            .facility
            .snapshot_exists(&self.settings.dataset, &base_snapshot)?
        {
            warn!(
                snapshot = %format!("{}@{}", self.settings.dataset, base_snapshot),
                "Base snapshot no longer exists, falling back to a full backup"
            );
            return Ok(BackupPlan {
                fell_back: true,
                ..full
            });
        }

        debug!(chain = %chain, base = %base_snapshot, age_days, "Planned differential backup");
        Ok(BackupPlan {
            mode: BackupMode::Differential { base },
            chain,
            fell_back: false,
        })
    }

    /// Back up at the current local time
    pub fn run(&self) -> Result<BackupOutcome> {
        self.run_at(Local::now().naive_local())
    }

    /// Back up as if the current local time were `now`
    pub fn run_at(&self, now: NaiveDateTime) -> Result<BackupOutcome> {
        let dry_run = self.settings.dry_run;
        self.store.ensure_root()?;

        let plan = self.plan(now)?;
        let id = ArtifactId::new(self.settings.prefix.clone(), plan.mode.kind(), now);
        let snapshot = id.snapshot_name();

        let artifact = self
            .produce(&plan, &id)
            .and_then(|artifact| {
                if plan.mode == BackupMode::Full {
                    self.store.write_last_chain(&plan.chain)?;
                }
                Ok(artifact)
            })
            .map_err(|e| {
                error!(mode = plan.mode.label(), error = %e, "Backup failed");
                observability::record_backup_failure();
                ZchainError::fatal(format!("{} backup failed: {e}", plan.mode.label()))
            })?;

        let pruned = self.store.prune(self.settings.retention_chains, dry_run)?;
        info!(chain = %plan.chain, snapshot = %snapshot, dry_run, "Backup done");

        Ok(BackupOutcome {
            mode: plan.mode,
            chain: plan.chain,
            snapshot,
            artifact,
            fell_back: plan.fell_back,
            dry_run,
            pruned,
        })
    }

    /// Retention pruning only
    pub fn cleanup(&self) -> Result<PruneReport> {
        let report = self
            .store
            .prune(self.settings.retention_chains, self.settings.dry_run)?;
        info!(
            removed_chains = report.removed_chains.len(),
            removed_temp_files = report.removed_temp_files.len(),
            "Cleanup done"
        );
        Ok(report)
    }

    fn produce(&self, plan: &BackupPlan, id: &ArtifactId) -> Result<Option<PathBuf>> {
        let chain_dir = self.store.create_chain(&plan.chain)?;
        let snapshot = id.snapshot_name();
        let dataset = &self.settings.dataset;

        match &plan.mode {
            BackupMode::Full => {
                info!(snapshot = %snapshot, chain = %chain_dir.path.display(), "Full backup")
            }
            BackupMode::Differential { base } => info!(
                base = %base.id.snapshot_name(),
                snapshot = %snapshot,
                chain = %chain_dir.path.display(),
                "Differential backup"
            ),
        }

        if self.settings.dry_run {
            info!(snapshot = %format!("{dataset}@{snapshot}"), "[dry-run] Would create snapshot");
            info!(artifact = %id.file_name(), "[dry-run] Would send and compress stream");
            return Ok(None);
        }

        self.facility.create_snapshot(dataset, &snapshot)?;

        let tmp_path = chain_dir.path.join(id.tmp_file_name());
        match self.write_artifact(plan, id, &chain_dir, &tmp_path) {
            Ok(path) => Ok(Some(path)),
            Err(e) => {
                self.discard(&tmp_path, &snapshot);
                Err(e)
            }
        }
    }

    fn write_artifact(
        &self,
        plan: &BackupPlan,
        id: &ArtifactId,
        chain_dir: &ChainDir,
        tmp_path: &Path,
    ) -> Result<PathBuf> {
        let dataset = &self.settings.dataset;
        let base = match &plan.mode {
            BackupMode::Full => None,
            BackupMode::Differential { base } => Some(base.id.snapshot_name()),
        };
        let send = self
            .toolbox
            .zfs_send(dataset, &id.snapshot_name(), base.as_deref());
        let compressor = self.toolbox.compressor();

        self.toolbox.pipeline().run_with_rate_limit(
            &send,
            tmp_path,
            self.settings.rate.as_deref(),
            Some(&compressor),
            Some(self.settings.stream_timeout),
        )?;

        let size = fs::metadata(tmp_path)?.len();
        if size == 0 {
            return Err(ZchainError::fatal("empty artifact"));
        }
        if !self.verifier.verify(tmp_path) {
            return Err(ZchainError::fatal("verification failed"));
        }

        let final_path = chain_dir.path.join(id.file_name());
        fs::rename(tmp_path, &final_path)?;
        observability::record_backup(size);
        info!(artifact = %final_path.display(), size, "Artifact written");
        Ok(final_path)
    }

    /// Best-effort removal of everything a failed run left behind
    fn discard(&self, tmp_path: &Path, snapshot: &str) {
        if tmp_path.exists() {
            if let Err(e) = fs::remove_file(tmp_path) {
                warn!(file = %tmp_path.display(), error = %e, "Failed to remove partial artifact");
            }
        }
        match self
            .facility
            .destroy_snapshot(&self.settings.dataset, snapshot)
        {
            Ok(()) => info!(snapshot, "Cleaned up failed snapshot"),
            Err(e) => warn!(snapshot, error = %e, "Failed to clean up snapshot"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Pipeline;
    use crate::tools::PathResolver;
    use crate::zfs::MockSnapshotFacility;
    use chrono::NaiveDate;
    use mockall::predicate::eq;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn day(d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, d)
            .unwrap()
            .and_hms_opt(1, 0, 0)
            .unwrap()
    }

    fn engine(temp_dir: &TempDir, facility: MockSnapshotFacility) -> BackupEngine<MockSnapshotFacility> {
        engine_with(temp_dir, PathResolver::isolated(Vec::<PathBuf>::new()), facility)
    }

    fn engine_with(
        temp_dir: &TempDir,
        resolver: PathResolver,
        facility: MockSnapshotFacility,
    ) -> BackupEngine<MockSnapshotFacility> {
        let settings = BackupSettings::new("pool/data", temp_dir.path());
        let store = ChainStore::new(settings.target_dir());
        let toolbox = Toolbox::new(Pipeline::new(Arc::new(resolver)));
        let verifier = ArtifactVerifier::new(toolbox.clone());
        BackupEngine::new(settings, store, facility, toolbox, verifier)
    }

    /// Fake `zfs send`, pass-through `gzip` and a header-checking `zstreamdump`
    fn stream_tools(dir: &Path) -> PathResolver {
        use std::os::unix::fs::PermissionsExt;

        let scripts = [
            ("zfs", "printf 'STREAM payload'"),
            ("pigz", "exit 1"),
            ("gzip", r#"if [ "$1" = "-dc" ]; then exec cat "$2"; fi
exec cat"#),
            ("zstreamdump", "head -c 6 | grep -q '^STREAM'"),
        ];
        for (name, body) in scripts {
            let path = dir.join(name);
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        PathResolver::isolated([dir.to_path_buf(), "/usr/bin".into(), "/bin".into()])
    }

    fn seed_full(engine: &BackupEngine<MockSnapshotFacility>, chain: &str, at: NaiveDateTime) {
        let dir = engine.store().create_chain(chain).unwrap();
        let id = ArtifactId::new(crate::config::DEFAULT_PREFIX, ArtifactKind::Full, at);
        std::fs::write(dir.path.join(id.file_name()), "STREAM").unwrap();
        engine.store().write_last_chain(chain).unwrap();
    }

    #[test]
    fn test_plan_full_without_pointer() {
        let temp_dir = TempDir::new().unwrap();
        let engine = engine(&temp_dir, MockSnapshotFacility::new());

        let plan = engine.plan(day(1)).unwrap();
        assert_eq!(plan.mode, BackupMode::Full);
        assert_eq!(plan.chain, "chain-20250301");
        assert!(!plan.fell_back);
    }

    #[test]
    fn test_plan_full_when_pointed_chain_is_gone() {
        let temp_dir = TempDir::new().unwrap();
        let engine = engine(&temp_dir, MockSnapshotFacility::new());
        engine.store().write_last_chain("chain-20250201").unwrap();

        assert_eq!(engine.plan(day(1)).unwrap().mode, BackupMode::Full);
    }

    #[test]
    fn test_plan_differential_within_interval() {
        let temp_dir = TempDir::new().unwrap();
        let mut facility = MockSnapshotFacility::new();
        facility
            .expect_snapshot_exists()
            .with(eq("pool/data"), eq("zfs-simple-backup-restore-full-20250301010000"))
            .times(1)
            .returning(|_, _| Ok(true));
        let engine = engine(&temp_dir, facility);
        seed_full(&engine, "chain-20250301", day(1));

        let plan = engine.plan(day(7)).unwrap();
        assert_eq!(plan.chain, "chain-20250301");
        assert!(matches!(plan.mode, BackupMode::Differential { .. }));
    }

    #[test]
    fn test_plan_full_once_interval_elapsed() {
        let temp_dir = TempDir::new().unwrap();
        let engine = engine(&temp_dir, MockSnapshotFacility::new());
        seed_full(&engine, "chain-20250301", day(1));

        let plan = engine.plan(day(8)).unwrap();
        assert_eq!(plan.mode, BackupMode::Full);
        assert_eq!(plan.chain, "chain-20250308");
    }

    #[test]
    fn test_plan_falls_back_when_base_snapshot_vanished() {
        let temp_dir = TempDir::new().unwrap();
        let mut facility = MockSnapshotFacility::new();
        facility
            .expect_snapshot_exists()
            .returning(|_, _| Ok(false));
        let engine = engine(&temp_dir, facility);
        seed_full(&engine, "chain-20250301", day(1));

        let plan = engine.plan(day(3)).unwrap();
        assert_eq!(plan.mode, BackupMode::Full);
        assert_eq!(plan.chain, "chain-20250303");
        assert!(plan.fell_back);
    }

    #[test]
    fn test_dry_run_touches_no_snapshots() {
        let temp_dir = TempDir::new().unwrap();
        let mut facility = MockSnapshotFacility::new();
        facility.expect_create_snapshot().never();
        facility.expect_destroy_snapshot().never();
        let mut engine = engine(&temp_dir, facility);
        engine.settings.dry_run = true;

        let outcome = engine.run_at(day(1)).unwrap();
        assert!(outcome.dry_run);
        assert!(outcome.artifact.is_none());
        assert_eq!(outcome.snapshot, "zfs-simple-backup-restore-full-20250301010000");
        assert!(engine.store().chain_path("chain-20250301").is_dir());
        assert_eq!(
            engine.store().read_last_chain().unwrap().as_deref(),
            Some("chain-20250301")
        );
    }

    #[test]
    fn test_failed_snapshot_creation_is_wrapped() {
        let temp_dir = TempDir::new().unwrap();
        let mut facility = MockSnapshotFacility::new();
        facility
            .expect_create_snapshot()
            .returning(|_, _| Err(ZchainError::fatal("out of space")));
        let engine = engine(&temp_dir, facility);

        let err = engine.run_at(day(1)).unwrap_err();
        assert_eq!(err.to_string(), "Full backup failed: out of space");
        assert!(engine.store().read_last_chain().unwrap().is_none());
    }

    #[test]
    fn test_stream_failure_cleans_up() {
        let temp_dir = TempDir::new().unwrap();
        let mut facility = MockSnapshotFacility::new();
        facility.expect_create_snapshot().times(1).returning(|_, _| Ok(()));
        facility
            .expect_destroy_snapshot()
            .with(eq("pool/data"), eq("zfs-simple-backup-restore-full-20250301010000"))
            .times(1)
            .returning(|_, _| Ok(()));
        // No binaries resolvable, so the send pipeline cannot start
        let engine = engine(&temp_dir, facility);

        let err = engine.run_at(day(1)).unwrap_err();
        assert!(err.to_string().starts_with("Full backup failed:"));

        let chain = engine.store().chain_path("chain-20250301");
        assert_eq!(std::fs::read_dir(chain).unwrap().count(), 0);
    }

    #[test]
    fn test_pointer_write_failure_is_wrapped() {
        let temp_dir = TempDir::new().unwrap();
        let bin = TempDir::new().unwrap();
        let target = BackupSettings::new("pool/data", temp_dir.path()).target_dir();

        let mut facility = MockSnapshotFacility::new();
        // A non-empty directory where the pointer goes makes its rename fail
        let blocker = target.join("last_chain").join("blocker");
        facility.expect_create_snapshot().times(1).returning(move |_, _| {
            std::fs::create_dir_all(&blocker).unwrap();
            Ok(())
        });
        facility.expect_destroy_snapshot().never();
        let engine = engine_with(&temp_dir, stream_tools(bin.path()), facility);

        let err = engine.run_at(day(1)).unwrap_err();
        assert!(matches!(err, ZchainError::Fatal(_)));
        assert!(err.to_string().starts_with("Full backup failed:"));

        let artifacts = engine.store().list_artifacts("chain-20250301").unwrap();
        assert_eq!(artifacts.len(), 1);
    }
}
