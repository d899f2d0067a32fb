/*!
Pre-flight checks run before any lock is taken or anything is changed.
*/

use crate::config::{BackupSettings, RestoreSettings};
use crate::tools::Toolbox;
use crate::zfs::SnapshotFacility;
use crate::{Result, ZchainError};
use std::fmt;
use tracing::{debug, error};

/// Top-level operation requested on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Backup,
    Restore,
    Cleanup,
    List,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Backup => "backup",
            Action::Restore => "restore",
            Action::Cleanup => "cleanup",
            Action::List => "list",
        })
    }
}

/// Environment and input checks; every failure is a validation error
#[derive(Debug, Clone)]
pub struct Preflight {
    require_root: bool,
}

impl Default for Preflight {
    fn default() -> Self {
        Self { require_root: true }
    }
}

impl Preflight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Skip the effective-uid check
    pub fn without_root_check(mut self) -> Self {
        self.require_root = false;
        self
    }

    /// Run every check for `action`
    ///
    /// Order: settings, required binaries, root, dataset, restore pool, mount
    /// point directory.
    pub fn check<F: SnapshotFacility>(
        &self,
        action: Action,
        settings: &BackupSettings,
        restore: Option<&RestoreSettings>,
        toolbox: &Toolbox,
        facility: &F,
    ) -> Result<()> {
        settings.validate()?;
        if let Some(restore) = restore {
            restore.validate()?;
        }

        let missing = toolbox.missing_binaries(settings.rate.as_deref());
        if !missing.is_empty() {
            let list = missing.join(" ");
            error!(missing = %list, "Missing required binaries");
            return Err(ZchainError::validation(format!(
                "Missing required binaries: {list}. Install them with: sudo apt install {list}"
            )));
        }

        if self.require_root && !nix::unistd::geteuid().is_root() {
            return Err(ZchainError::validation("This program must be run as root"));
        }

        if !facility.dataset_exists(&settings.dataset)? {
            return Err(ZchainError::validation(format!(
                "Dataset not found: {}",
                settings.dataset
            )));
        }

        if action == Action::Restore {
            if let Some(pool) = restore.and_then(|r| r.pool.as_deref()) {
                if !facility.pool_exists(pool)? {
                    return Err(ZchainError::validation(format!("Pool not found: {pool}")));
                }
            }
        }

        if !settings.mount_point.is_dir() {
            return Err(ZchainError::validation(format!(
                "Not a directory: {}",
                settings.mount_point.display()
            )));
        }

        debug!(action = %action, dataset = %settings.dataset, "Pre-flight checks passed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Pipeline;
    use crate::tools::PathResolver;
    use crate::zfs::MockSnapshotFacility;
    use mockall::predicate::eq;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn toolbox_with(dir: &Path, names: &[&str]) -> Toolbox {
        for name in names {
            let path = dir.join(name);
            std::fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        Toolbox::new(Pipeline::new(Arc::new(PathResolver::isolated([dir]))))
    }

    fn all_tools(dir: &Path) -> Toolbox {
        toolbox_with(dir, &["zfs", "zpool", "gzip", "zstreamdump", "pv"])
    }

    #[test]
    fn test_missing_binaries_listed_with_hint() {
        let temp_dir = TempDir::new().unwrap();
        let toolbox = toolbox_with(temp_dir.path(), &["zfs", "gzip"]);
        let settings = BackupSettings::new("pool/data", temp_dir.path());

        let err = Preflight::new()
            .without_root_check()
            .check(Action::Backup, &settings, None, &toolbox, &MockSnapshotFacility::new())
            .unwrap_err();
        assert!(err.is_validation());
        assert!(err
            .to_string()
            .contains("sudo apt install zpool zstreamdump"));
    }

    #[test]
    fn test_pv_required_only_with_rate() {
        let temp_dir = TempDir::new().unwrap();
        let toolbox = toolbox_with(temp_dir.path(), &["zfs", "zpool", "gzip", "zstreamdump"]);
        let mut settings = BackupSettings::new("pool/data", temp_dir.path());
        settings.rate = Some("10M".to_string());

        let err = Preflight::new()
            .without_root_check()
            .check(Action::Backup, &settings, None, &toolbox, &MockSnapshotFacility::new())
            .unwrap_err();
        assert!(err.to_string().contains("pv"));
    }

    #[test]
    fn test_missing_dataset() {
        let temp_dir = TempDir::new().unwrap();
        let toolbox = all_tools(temp_dir.path());
        let settings = BackupSettings::new("pool/data", temp_dir.path());
        let mut facility = MockSnapshotFacility::new();
        facility
            .expect_dataset_exists()
            .with(eq("pool/data"))
            .returning(|_| Ok(false));

        let err = Preflight::new()
            .without_root_check()
            .check(Action::Backup, &settings, None, &toolbox, &facility)
            .unwrap_err();
        assert_eq!(err.to_string(), "Validation error: Dataset not found: pool/data");
    }

    #[test]
    fn test_restore_pool_checked() {
        let temp_dir = TempDir::new().unwrap();
        let toolbox = all_tools(temp_dir.path());
        let settings = BackupSettings::new("pool/data", temp_dir.path());
        let restore = RestoreSettings {
            pool: Some("tank".to_string()),
            ..Default::default()
        };
        let mut facility = MockSnapshotFacility::new();
        facility.expect_dataset_exists().returning(|_| Ok(true));
        facility
            .expect_pool_exists()
            .with(eq("tank"))
            .returning(|_| Ok(false));

        let err = Preflight::new()
            .without_root_check()
            .check(Action::Restore, &settings, Some(&restore), &toolbox, &facility)
            .unwrap_err();
        assert!(err.to_string().contains("Pool not found: tank"));
    }

    #[test]
    fn test_mount_point_must_be_directory() {
        let temp_dir = TempDir::new().unwrap();
        let toolbox = all_tools(temp_dir.path());
        let settings = BackupSettings::new("pool/data", temp_dir.path().join("unmounted"));
        let mut facility = MockSnapshotFacility::new();
        facility.expect_dataset_exists().returning(|_| Ok(true));

        let err = Preflight::new()
            .without_root_check()
            .check(Action::Cleanup, &settings, None, &toolbox, &facility)
            .unwrap_err();
        assert!(err.to_string().contains("Not a directory"));
    }

    #[test]
    fn test_all_checks_pass() {
        let temp_dir = TempDir::new().unwrap();
        let toolbox = all_tools(temp_dir.path());
        let settings = BackupSettings::new("pool/data", temp_dir.path());
        let mut facility = MockSnapshotFacility::new();
        facility.expect_dataset_exists().returning(|_| Ok(true));

        assert!(Preflight::new()
            .without_root_check()
            .check(Action::Backup, &settings, None, &toolbox, &facility)
            .is_ok());
    }

    #[test]
    fn test_invalid_settings_rejected_first() {
        let temp_dir = TempDir::new().unwrap();
        let toolbox = toolbox_with(temp_dir.path(), &[]);
        let settings = BackupSettings::new("../etc", temp_dir.path());

        let err = Preflight::new()
            .check(Action::Backup, &settings, None, &toolbox, &MockSnapshotFacility::new())
            .unwrap_err();
        assert!(err.to_string().contains("Dataset name"));
    }
}
