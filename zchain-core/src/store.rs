/*!
On-disk chain store.

Layout under the store root (`<mount>/<sanitized dataset>`):

```text
last_chain                  name of the active chain
chain-YYYYMMDD/             one full artifact, then differentials
    <prefix>-full-<ts>.zfs.gz
    <prefix>-diff-<ts>.zfs.gz
```

Only complete, verified artifacts carry their final name; in-progress output
ends in `.tmp` and is ignored by every listing.
*/

use crate::artifact::{Artifact, ArtifactId, ArtifactKind, TMP_SUFFIX};
use crate::config::{LAST_CHAIN_FILE, STALE_TMP_SECS};
use crate::{observability, Result, ZchainError};
use chrono::{Local, NaiveDate};
use serde::Serialize;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// Prefix shared by all chain directory names
pub const CHAIN_PREFIX: &str = "chain-";

/// A chain directory inside the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainDir {
    pub name: String,
    pub path: PathBuf,
}

/// What a prune pass removed, or would remove in dry-run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub removed_chains: Vec<String>,
    pub removed_temp_files: Vec<PathBuf>,
    pub dry_run: bool,
}

impl PruneReport {
    pub fn is_empty(&self) -> bool {
        self.removed_chains.is_empty() && self.removed_temp_files.is_empty()
    }
}

/// Chains and artifacts of one dataset
#[derive(Debug, Clone)]
pub struct ChainStore {
    root: PathBuf,
}

impl ChainStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Chain name for today's local date
    pub fn today_chain_name() -> String {
        Self::chain_name_for(Local::now().date_naive())
    }

    /// `chain-YYYYMMDD`
    pub fn chain_name_for(date: NaiveDate) -> String {
        format!("{CHAIN_PREFIX}{}", date.format("%Y%m%d"))
    }

    pub fn ensure_root(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        Ok(())
    }

    pub fn chain_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Create the chain directory if missing
    pub fn create_chain(&self, name: &str) -> Result<ChainDir> {
        let path = self.chain_path(name);
        fs::create_dir_all(&path)?;
        debug!(chain = name, path = %path.display(), "Chain directory ready");
        Ok(ChainDir {
            name: name.to_string(),
            path,
        })
    }

    /// Chain directory names, oldest first
    ///
    /// A missing store root has no chains.
    pub fn list_chains(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut chains = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(CHAIN_PREFIX) && entry.path().is_dir() {
                chains.push(name);
            }
        }
        // chain-YYYYMMDD sorts chronologically
        chains.sort();
        Ok(chains)
    }

    /// The named chain, or the newest one when no name is given
    ///
    /// # Errors
    /// * `ZchainError::ChainNotFound` - the named chain does not exist
    /// * `ZchainError::NoChains` - no name was given and the store is empty
    pub fn resolve_chain(&self, explicit: Option<&str>) -> Result<ChainDir> {
        match explicit {
            Some(name) => {
                let path = self.chain_path(name);
                if !path.is_dir() {
                    return Err(ZchainError::ChainNotFound { path });
                }
                Ok(ChainDir {
                    name: name.to_string(),
                    path,
                })
            }
            None => {
                let name = self
                    .list_chains()?
                    .pop()
                    .ok_or_else(|| ZchainError::NoChains {
                        root: self.root.clone(),
                    })?;
                let path = self.chain_path(&name);
                Ok(ChainDir { name, path })
            }
        }
    }

    /// Published artifacts of a chain: full first, then by timestamp
    ///
    /// Zero-byte files, `.tmp` files and unparseable names are skipped.
    pub fn list_artifacts(&self, chain: &str) -> Result<Vec<Artifact>> {
        let dir = self.chain_path(chain);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(ZchainError::ChainNotFound { path: dir })
            }
            Err(e) => return Err(e.into()),
        };

        let mut artifacts = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(TMP_SUFFIX) {
                continue;
            }
            let meta = entry.metadata()?;
            if !meta.is_file() || meta.len() == 0 {
                continue;
            }
            match ArtifactId::parse(&name) {
                Ok(id) => artifacts.push(Artifact {
                    id,
                    path: entry.path(),
                    size: meta.len(),
                }),
                Err(e) => debug!(file = %name, error = %e, "Skipping foreign file"),
            }
        }

        artifacts.sort_by(|a, b| {
            a.id.cmp(&b.id)
                .then_with(|| a.file_name().cmp(&b.file_name()))
        });
        Ok(artifacts)
    }

    /// Most recent full artifact with `prefix` in the chain
    pub fn latest_full(&self, chain: &str, prefix: &str) -> Result<Option<Artifact>> {
        Ok(self
            .list_artifacts(chain)?
            .into_iter()
            .filter(|a| a.id.kind == ArtifactKind::Full && a.id.prefix == prefix)
            .last())
    }

    /// Active chain name from the pointer file
    pub fn read_last_chain(&self) -> Result<Option<String>> {
        match fs::read_to_string(self.root.join(LAST_CHAIN_FILE)) {
            Ok(text) => {
                let name = text.trim();
                Ok((!name.is_empty()).then(|| name.to_string()))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the pointer file atomically
    pub fn write_last_chain(&self, name: &str) -> Result<()> {
        self.ensure_root()?;
        let mut tmp = tempfile::Builder::new()
            .prefix(".last_chain")
            .suffix(TMP_SUFFIX)
            .tempfile_in(&self.root)?;
        tmp.write_all(name.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.root.join(LAST_CHAIN_FILE))
            .map_err(|e| ZchainError::Io(e.error))?;
        debug!(chain = name, "Updated last chain pointer");
        Ok(())
    }

    /// Remove all but the `retain_n` newest chains, then stale `.tmp` files
    ///
    /// Chains whose real path is not inside the store root are never removed.
    /// Individual deletion failures are logged and skipped.
    pub fn prune(&self, retain_n: usize, dry_run: bool) -> Result<PruneReport> {
        let mut report = PruneReport {
            dry_run,
            ..Default::default()
        };
        if !self.root.is_dir() {
            return Ok(report);
        }
        let chains = self.list_chains()?;
        let root = fs::canonicalize(&self.root)?;
        let excess = chains.len().saturating_sub(retain_n);
        let (expired, kept) = chains.split_at(excess);

        for name in expired {
            let path = self.chain_path(name);
            let resolved = match fs::canonicalize(&path) {
                Ok(resolved) => resolved,
                Err(e) => {
                    warn!(chain = %name, error = %e, "Cannot resolve chain path, skipping");
                    continue;
                }
            };
            if resolved == root || !resolved.starts_with(&root) {
                warn!(
                    chain = %name,
                    path = %resolved.display(),
                    "Refusing to remove chain outside the store root"
                );
                continue;
            }

            if dry_run {
                info!(chain = %name, "[dry-run] Would remove old chain");
                report.removed_chains.push(name.clone());
                continue;
            }
            match fs::remove_dir_all(&resolved) {
                Ok(()) => {
                    info!(chain = %name, "Removed old chain");
                    report.removed_chains.push(name.clone());
                }
                Err(e) => warn!(chain = %name, error = %e, "Failed to remove old chain"),
            }
        }

        let mut dirs = vec![self.root.clone()];
        dirs.extend(kept.iter().map(|name| self.chain_path(name)));
        let now = SystemTime::now();
        for dir in dirs {
            self.prune_stale_temp_files(&dir, now, &mut report);
        }

        if !dry_run {
            observability::record_pruned_chains(report.removed_chains.len());
        }
        Ok(report)
    }

    fn prune_stale_temp_files(&self, dir: &Path, now: SystemTime, report: &mut PruneReport) {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Cannot scan for temp files");
                return;
            }
        };

        let threshold = Duration::from_secs(STALE_TMP_SECS);
        for entry in entries.flatten() {
            let path = entry.path();
            let is_tmp = path
                .file_name()
                .map(|n| n.to_string_lossy().ends_with(TMP_SUFFIX))
                .unwrap_or(false);
            if !is_tmp {
                continue;
            }
            let stale = entry
                .metadata()
                .ok()
                .filter(|meta| meta.is_file())
                .and_then(|meta| meta.modified().ok())
                .and_then(|modified| now.duration_since(modified).ok())
                .map(|age| age > threshold)
                .unwrap_or(false);
            if !stale {
                continue;
            }

            if report.dry_run {
                info!(file = %path.display(), "[dry-run] Would remove stale temp file");
                report.removed_temp_files.push(path);
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    info!(file = %path.display(), "Removed stale temp file");
                    report.removed_temp_files.push(path);
                }
                Err(e) => warn!(file = %path.display(), error = %e, "Failed to remove temp file"),
            }
        }
    }
}
