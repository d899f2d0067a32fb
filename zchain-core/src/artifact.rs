/*!
Artifact naming grammar.

An artifact file is named `<prefix>-<kind>-<YYYYMMDDHHMMSS>.zfs.gz`. The part
before the extension doubles as the name of the ZFS snapshot the stream was
sent from, which is how a differential finds its base snapshot.
*/

use crate::{Result, ZchainError};
use chrono::{NaiveDateTime, Timelike};
use std::cmp::Ordering;
use std::fmt;
use std::path::PathBuf;

/// Extension of every published artifact
pub const ARTIFACT_EXTENSION: &str = "zfs.gz";

/// Suffix of in-progress output files
pub const TMP_SUFFIX: &str = ".tmp";

/// Timestamp layout embedded in artifact names
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// Full or differential stream; full sorts first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ArtifactKind {
    Full,
    Diff,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Full => "full",
            ArtifactKind::Diff => "diff",
        }
    }

    fn marker(&self) -> String {
        format!("-{}-", self.as_str())
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed artifact name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactId {
    pub prefix: String,
    pub kind: ArtifactKind,
    pub timestamp: NaiveDateTime,
}

impl ArtifactId {
    pub fn new<S: Into<String>>(prefix: S, kind: ArtifactKind, timestamp: NaiveDateTime) -> Self {
        Self {
            prefix: prefix.into(),
            kind,
            // Names only carry whole seconds
            timestamp: timestamp.with_nanosecond(0).unwrap_or(timestamp),
        }
    }

    /// Parse a file name such as `backup-full-20250101120000.zfs.gz`
    ///
    /// The prefix may contain `-`; the last `-full-`/`-diff-` marker wins.
    pub fn parse(file_name: &str) -> Result<Self> {
        let stem = file_name
            .strip_suffix(ARTIFACT_EXTENSION)
            .and_then(|s| s.strip_suffix('.'))
            .ok_or_else(|| invalid(file_name, "missing .zfs.gz extension"))?;
        Self::parse_snapshot_name(stem).map_err(|_| invalid(file_name, "malformed artifact name"))
    }

    /// Parse a snapshot name such as `backup-diff-20250101120000`
    pub fn parse_snapshot_name(name: &str) -> Result<Self> {
        let (kind, at) = [ArtifactKind::Full, ArtifactKind::Diff]
            .into_iter()
            .filter_map(|kind| name.rfind(&kind.marker()).map(|at| (kind, at)))
            .max_by_key(|(_, at)| *at)
            .ok_or_else(|| invalid(name, "no full/diff marker"))?;

        let prefix = &name[..at];
        let stamp = &name[at + kind.marker().len()..];
        if prefix.is_empty() {
            return Err(invalid(name, "empty prefix"));
        }
        if stamp.len() != 14 || !stamp.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid(name, "timestamp must be YYYYMMDDHHMMSS"));
        }
        let timestamp = NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT)
            .map_err(|e| invalid(name, &e.to_string()))?;

        Ok(Self {
            prefix: prefix.to_string(),
            kind,
            timestamp,
        })
    }

    /// `<prefix>-<kind>-<timestamp>`, also the ZFS snapshot name
    pub fn snapshot_name(&self) -> String {
        format!(
            "{}-{}-{}",
            self.prefix,
            self.kind,
            self.timestamp.format(TIMESTAMP_FORMAT)
        )
    }

    /// Final artifact file name
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.snapshot_name(), ARTIFACT_EXTENSION)
    }

    /// Name of the in-progress output file for this artifact
    pub fn tmp_file_name(&self) -> String {
        format!("{}{}", self.file_name(), TMP_SUFFIX)
    }

    pub fn is_full(&self) -> bool {
        self.kind == ArtifactKind::Full
    }
}

impl Ord for ArtifactId {
    /// Full before diff, then ascending timestamp, then prefix
    fn cmp(&self, other: &Self) -> Ordering {
        self.kind
            .cmp(&other.kind)
            .then_with(|| self.timestamp.cmp(&other.timestamp))
            .then_with(|| self.prefix.cmp(&other.prefix))
    }
}

impl PartialOrd for ArtifactId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name())
    }
}

/// A published artifact inside a chain directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub id: ArtifactId,
    pub path: PathBuf,
    pub size: u64,
}

impl Artifact {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.id.file_name())
    }
}

fn invalid(name: &str, reason: &str) -> ZchainError {
    ZchainError::invalid_argument(format!("Invalid artifact name '{name}': {reason}"))
}
