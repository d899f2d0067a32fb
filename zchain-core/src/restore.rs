/*!
Restore orchestration: verified, strictly ordered replay of one chain.

Every artifact of the chain is verified before anything is received. The full
artifact is applied first, then the differentials in timestamp order, each
through `<decompressor> | zfs receive -F <pool>/<leaf>`. A failure stops the
replay; artifacts already received stay applied.
*/

use crate::artifact::Artifact;
use crate::config::{BackupSettings, RestoreSettings};
use crate::dataset::dataset_leaf;
use crate::pipeline::{PipelineStage, StageRole};
use crate::store::{ChainDir, ChainStore};
use crate::tools::Toolbox;
use crate::verify::ArtifactVerifier;
use crate::zfs::SnapshotFacility;
use crate::{observability, Result, ZchainError};
use std::io::{BufRead, Write};
use std::time::Duration;
use tracing::{error, info};

const BANNER: &str = "======================================================================";

/// Inputs of one restore run
#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// Dataset the chain was backed up from
    pub dataset: String,
    pub pool: String,
    pub chain: Option<String>,
    /// Cutoff token; the replay stops after the first artifact matching it
    pub snapshot: Option<String>,
    pub force: bool,
    pub dry_run: bool,
    pub stream_timeout: Duration,
}

impl RestoreOptions {
    pub fn from_settings(backup: &BackupSettings, restore: &RestoreSettings) -> Result<Self> {
        restore.validate()?;
        let pool = restore
            .pool
            .clone()
            .ok_or_else(|| ZchainError::validation("Restore requires a target pool"))?;
        Ok(Self {
            dataset: backup.dataset.clone(),
            pool,
            chain: restore.chain.clone(),
            snapshot: restore.snapshot.clone().filter(|s| !s.is_empty()),
            force: restore.force,
            dry_run: backup.dry_run,
            stream_timeout: backup.stream_timeout,
        })
    }

    /// `<pool>/<last component of the source dataset>`
    pub fn destination(&self) -> String {
        format!("{}/{}", self.pool, dataset_leaf(&self.dataset))
    }
}

/// How a restore run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    Restored { dest: String, artifacts: Vec<String> },
    DryRun { dest: String, artifacts: Vec<String> },
    /// The operator did not confirm; nothing was changed
    Declined,
}

/// Replays a chain into a pool
#[derive(Debug)]
pub struct RestoreEngine<F: SnapshotFacility> {
    options: RestoreOptions,
    store: ChainStore,
    facility: F,
    toolbox: Toolbox,
    verifier: ArtifactVerifier,
}

impl<F: SnapshotFacility> RestoreEngine<F> {
    pub fn new(
        options: RestoreOptions,
        store: ChainStore,
        facility: F,
        toolbox: Toolbox,
        verifier: ArtifactVerifier,
    ) -> Self {
        Self {
            options,
            store,
            facility,
            toolbox,
            verifier,
        }
    }

    /// Restore using the process's stdin and stdout for the confirmation
    pub fn run(&self) -> Result<RestoreOutcome> {
        let stdin = std::io::stdin();
        let mut input = stdin.lock();
        let mut output = std::io::stdout();
        self.run_with(&mut input, &mut output)
    }

    /// Restore, reading the confirmation from `input` and printing to `output`
    pub fn run_with<R: BufRead, W: Write>(
        &self,
        input: &mut R,
        output: &mut W,
    ) -> Result<RestoreOutcome> {
        let chain = self.store.resolve_chain(self.options.chain.as_deref())?;
        let artifacts = self.store.list_artifacts(&chain.name)?;
        if artifacts.is_empty() {
            error!(chain = %chain.path.display(), "No backups in chain");
            return Err(ZchainError::fatal("No backups found in restore chain"));
        }

        info!(count = artifacts.len(), "Verifying backup files before restore");
        for artifact in &artifacts {
            if !self.verifier.verify(&artifact.path) {
                return Err(ZchainError::fatal(format!(
                    "Backup file verification failed: {}",
                    artifact.file_name()
                )));
            }
        }

        let artifacts = match self.options.snapshot.as_deref() {
            Some(token) => truncate_at(artifacts, token)?,
            None => artifacts,
        };
        let dest = self.options.destination();
        let names: Vec<String> = artifacts.iter().map(Artifact::file_name).collect();

        write_summary(output, &chain, &dest, &names)?;
        if self.options.dry_run {
            writeln!(output, "!!! This is a dry-run. No changes will be made.\n")?;
        } else if !self.options.force && !confirm(input, output, &dest)? {
            writeln!(output, "Aborted by user.")?;
            info!("Restore aborted by user");
            return Ok(RestoreOutcome::Declined);
        }
        output.flush()?;

        info!(chain = %chain.path.display(), dest = %dest, "Restoring");
        if self.options.dry_run {
            info!(dest = %dest, "[dry-run] Would create dataset if needed");
            for artifact in &artifacts {
                info!(artifact = %artifact.path.display(), dest = %dest, "[dry-run] Would restore");
            }
            return Ok(RestoreOutcome::DryRun {
                dest,
                artifacts: names,
            });
        }

        if !self.facility.dataset_exists(&dest)? {
            self.facility.create_dataset(&dest)?;
        }

        for artifact in &artifacts {
            info!(artifact = %artifact.path.display(), "Restore");
            let stages = [
                self.toolbox.decompress_stage(&artifact.path),
                PipelineStage::new(self.toolbox.zfs_receive(&dest), StageRole::Sink),
            ];
            self.toolbox
                .pipeline()
                .run_pipeline(&stages, Some(self.options.stream_timeout))
                .map_err(|e| {
                    ZchainError::fatal(format!(
                        "Restore failed for {}: {e}",
                        artifact.file_name()
                    ))
                })?;
            observability::record_restored_artifact();
        }

        info!(dest = %dest, count = artifacts.len(), "Restore done");
        Ok(RestoreOutcome::Restored {
            dest,
            artifacts: names,
        })
    }
}

/// Keep artifacts up to and including the first whose file name contains `token`
///
/// Equality, suffix and timestamp-digit matches are all substring matches.
pub fn truncate_at(artifacts: Vec<Artifact>, token: &str) -> Result<Vec<Artifact>> {
    let position = artifacts
        .iter()
        .position(|a| a.file_name().contains(token))
        .ok_or_else(|| {
            error!(token, "Could not find file or timestamp in backup chain");
            ZchainError::fatal(format!("Restore snapshot not found in chain: {token}"))
        })?;

    let mut artifacts = artifacts;
    artifacts.truncate(position + 1);
    Ok(artifacts)
}

fn write_summary<W: Write>(
    output: &mut W,
    chain: &ChainDir,
    dest: &str,
    names: &[String],
) -> Result<()> {
    writeln!(output)?;
    writeln!(output, "{BANNER}")?;
    writeln!(output, "   ZFS RESTORE OPERATION SUMMARY")?;
    writeln!(output, "{BANNER}")?;
    writeln!(output, "   Will restore the following:\n")?;
    writeln!(output, "     Source Chain Folder: {}", chain.path.display())?;
    writeln!(output, "     Target Dataset:      {dest}")?;
    writeln!(output, "     Number of Snapshots: {}\n", names.len())?;
    writeln!(output, "   Files to be restored, in order:")?;
    for name in names {
        writeln!(output, "     - {name}")?;
    }
    writeln!(output)?;
    Ok(())
}

fn confirm<R: BufRead, W: Write>(input: &mut R, output: &mut W, dest: &str) -> Result<bool> {
    writeln!(
        output,
        "WARNING: This will OVERWRITE the dataset {dest} with the above snapshots."
    )?;
    writeln!(output, "If this is not what you want, press Ctrl-C now.\n")?;
    write!(output, "Type 'yes' to proceed: ")?;
    output.flush()?;

    let mut answer = String::new();
    input.read_line(&mut answer)?;
    Ok(answer.trim() == "yes")
}
