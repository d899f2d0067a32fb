//! Configuration module for backup, restore and logging settings
//!
//! This module holds the defaults shared by the CLI and the engines, and the
//! settings structures whose `validate` methods implement the pre-flight
//! input checks that need no external tools.

use crate::dataset::{sanitize_dataset_name, validate_dataset_name, validate_mount_point};
use crate::{Result, ZchainError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Identifier used for the default prefix, log file and lock file names
pub const SCRIPT_ID: &str = "zfs-simple-backup-restore";

pub const DEFAULT_INTERVAL_DAYS: u32 = 7;
pub const DEFAULT_RETENTION_CHAINS: usize = 2;
pub const DEFAULT_PREFIX: &str = SCRIPT_ID;
pub const DEFAULT_LOG_DIR: &str = "/var/log";
pub const DEFAULT_LOCK_DIR: &str = "/var/lock";

/// Environment variables overriding the log and lock directories
pub const LOG_DIR_ENV: &str = "ZFS_BACKUP_LOG_DIR";
pub const LOCK_DIR_ENV: &str = "ZFS_BACKUP_LOCK_DIR";

/// Name of the pointer file recording the active chain
pub const LAST_CHAIN_FILE: &str = "last_chain";

/// `*.tmp` files older than this are considered orphaned by a crashed run
pub const STALE_TMP_SECS: u64 = 3600;

/// Decompressed bytes handed to the stream validator
pub const VERIFY_WINDOW_BYTES: usize = 1024;
pub const VERIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for single non-streaming commands (snapshot, list, destroy...)
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

/// Deadline for a whole send or receive pipeline
pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Process exit code for any failed invocation
pub const EXIT_INVALID_ARGS: u8 = 2;

/// Default lock file inside the given lock directory
pub fn default_lockfile<P: AsRef<Path>>(lock_dir: P) -> PathBuf {
    lock_dir.as_ref().join(format!("{SCRIPT_ID}.lock"))
}

/// Settings shared by every action on one dataset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSettings {
    /// Source dataset, e.g. `rpool/data`
    pub dataset: String,
    /// Mounted filesystem receiving the backups
    pub mount_point: PathBuf,
    /// Days between full backups
    pub interval_days: u32,
    /// How many chains to keep
    pub retention_chains: usize,
    /// Snapshot and file name prefix
    pub prefix: String,
    /// Optional `pv` rate limit, e.g. `10M`
    pub rate: Option<String>,
    /// Plan and log without touching the source store
    pub dry_run: bool,
    /// Deadline for a whole send/receive pipeline
    pub stream_timeout: Duration,
}

impl BackupSettings {
    /// Settings with defaults for everything but the dataset and mount point
    pub fn new<S: Into<String>, P: Into<PathBuf>>(dataset: S, mount_point: P) -> Self {
        Self {
            dataset: dataset.into(),
            mount_point: mount_point.into(),
            interval_days: DEFAULT_INTERVAL_DAYS,
            retention_chains: DEFAULT_RETENTION_CHAINS,
            prefix: DEFAULT_PREFIX.to_string(),
            rate: None,
            dry_run: false,
            stream_timeout: DEFAULT_STREAM_TIMEOUT,
        }
    }

    /// Directory holding this dataset's chains
    pub fn target_dir(&self) -> PathBuf {
        self.mount_point.join(sanitize_dataset_name(&self.dataset))
    }

    /// Validate the settings
    pub fn validate(&self) -> Result<()> {
        validate_dataset_name(&self.dataset)?;
        validate_mount_point(&self.mount_point)?;
        validate_prefix(&self.prefix)?;

        if self.interval_days == 0 {
            return Err(ZchainError::validation("Interval must be at least 1 day"));
        }
        if self.retention_chains == 0 {
            return Err(ZchainError::validation("Retention must keep at least 1 chain"));
        }
        if let Some(rate) = &self.rate {
            validate_rate(rate)?;
        }
        Ok(())
    }
}

/// Restore-only settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestoreSettings {
    /// Pool receiving the restored dataset
    pub pool: Option<String>,
    /// Chain directory to restore (default: latest)
    pub chain: Option<String>,
    /// Restore up to and including the artifact matching this token
    pub snapshot: Option<String>,
    /// Skip the interactive confirmation
    pub force: bool,
}

impl RestoreSettings {
    pub fn validate(&self) -> Result<()> {
        let pool = self
            .pool
            .as_deref()
            .ok_or_else(|| ZchainError::validation("Restore requires a target pool"))?;
        validate_dataset_name(pool)?;

        if let Some(chain) = &self.chain {
            if chain.contains('/') || chain.contains("..") || !chain.starts_with("chain-") {
                return Err(ZchainError::validation(format!(
                    "Invalid chain folder name: {chain}"
                )));
            }
        }
        Ok(())
    }
}

/// Logging configuration for the CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub verbose: bool,
    /// Directory for the appended log file; `None` disables file logging
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            log_dir: Some(PathBuf::from(DEFAULT_LOG_DIR)),
        }
    }
}

fn validate_prefix(prefix: &str) -> Result<()> {
    if prefix.is_empty() {
        return Err(ZchainError::validation("Prefix cannot be empty"));
    }
    if !prefix
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
    {
        return Err(ZchainError::validation("Prefix contains invalid characters"));
    }
    Ok(())
}

/// `pv -L` rate grammar: digits with an optional k/m/g/t suffix
fn validate_rate(rate: &str) -> Result<()> {
    let digits = rate.trim_end_matches(|c: char| "kKmMgGtT".contains(c));
    let suffix_len = rate.len() - digits.len();
    if digits.is_empty() || suffix_len > 1 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(ZchainError::validation(format!("Invalid rate limit: {rate}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = BackupSettings::new("pool/data", "/mnt/backups");
        assert_eq!(settings.interval_days, 7);
        assert_eq!(settings.retention_chains, 2);
        assert_eq!(settings.prefix, SCRIPT_ID);
        assert!(settings.rate.is_none());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_target_dir_is_sanitized() {
        let settings = BackupSettings::new("rpool/data/home", "/mnt/backups");
        assert_eq!(
            settings.target_dir(),
            PathBuf::from("/mnt/backups/rpool_data_home")
        );
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut settings = BackupSettings::new("pool/data", "/mnt/backups");
        settings.retention_chains = 0;
        assert!(settings.validate().is_err());

        let mut settings = BackupSettings::new("pool/data", "/mnt/backups");
        settings.interval_days = 0;
        assert!(settings.validate().is_err());

        let mut settings = BackupSettings::new("pool/data", "/mnt/backups");
        settings.prefix = "bad/prefix".to_string();
        assert!(settings.validate().is_err());

        let settings = BackupSettings::new("pool/data", "mnt/backups");
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_rate_grammar() {
        assert!(validate_rate("10M").is_ok());
        assert!(validate_rate("512k").is_ok());
        assert!(validate_rate("1000").is_ok());
        assert!(validate_rate("M").is_err());
        assert!(validate_rate("10MB").is_err());
        assert!(validate_rate("1.5G").is_err());
        assert!(validate_rate("").is_err());
    }

    #[test]
    fn test_restore_settings_require_pool() {
        assert!(RestoreSettings::default().validate().is_err());

        let settings = RestoreSettings {
            pool: Some("restored".to_string()),
            ..Default::default()
        };
        assert!(settings.validate().is_ok());

        let settings = RestoreSettings {
            pool: Some("restored".to_string()),
            chain: Some("../chain-20250101".to_string()),
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_default_lockfile() {
        assert_eq!(
            default_lockfile("/var/lock"),
            PathBuf::from("/var/lock/zfs-simple-backup-restore.lock")
        );
    }

    #[test]
    fn test_settings_serialize() {
        let settings = BackupSettings::new("pool/data", "/mnt/backups");
        let json = serde_json::to_string(&settings).unwrap();
        let back: BackupSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(back.dataset, "pool/data");
        assert_eq!(back.stream_timeout, DEFAULT_STREAM_TIMEOUT);
    }
}
