/*!
Error types for the zchain core engine.
*/

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type used throughout the zchain core.
pub type Result<T> = std::result::Result<T, ZchainError>;

/// Coarse classification of an error for reporting.
///
/// Validation errors are raised before anything is mutated; fatal errors abort
/// an operation that has already started and trigger its cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Validation,
    Fatal,
}

/// Errors that can occur during backup, restore and cleanup operations.
#[derive(Error, Debug)]
pub enum ZchainError {
    /// I/O errors during file operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Pre-flight validation errors (bad input, missing dataset, not root)
    #[error("Validation error: {0}")]
    Validation(String),

    /// An external binary could not be located
    #[error("Required binary not found: {name}")]
    BinaryNotFound { name: String },

    /// Invalid arguments passed to an internal API
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Mid-run failures that abort the current operation
    #[error("{0}")]
    Fatal(String),

    /// Another process holds the run lock
    #[error("Lock held: {}", path.display())]
    LockHeld { path: PathBuf },

    /// An explicitly requested chain directory does not exist
    #[error("Chain folder not found: {}", path.display())]
    ChainNotFound { path: PathBuf },

    /// The store contains no chain directories
    #[error("No chain folders found in {}", root.display())]
    NoChains { root: PathBuf },

    /// A pipeline stage exited unsuccessfully
    #[error("Stage {index} ({program}) failed with {status}: {stderr}")]
    StageFailed {
        index: usize,
        program: String,
        status: String,
        stderr: String,
    },

    /// A command or pipeline did not finish within its deadline
    #[error("{program} timed out after {}s", timeout.as_secs())]
    Timeout { program: String, timeout: Duration },
}

impl ZchainError {
    /// Create a new validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new fatal error
    pub fn fatal<S: Into<String>>(msg: S) -> Self {
        Self::Fatal(msg.into())
    }

    /// Create a new invalid argument error
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a new binary-not-found error
    pub fn binary_not_found<S: Into<String>>(name: S) -> Self {
        Self::BinaryNotFound { name: name.into() }
    }

    /// Classify this error as a validation or a fatal failure
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation(_) | Self::BinaryNotFound { .. } | Self::InvalidArgument(_) => {
                ErrorCategory::Validation
            }
            Self::Io(_)
            | Self::Fatal(_)
            | Self::LockHeld { .. }
            | Self::ChainNotFound { .. }
            | Self::NoChains { .. }
            | Self::StageFailed { .. }
            | Self::Timeout { .. } => ErrorCategory::Fatal,
        }
    }

    pub fn is_validation(&self) -> bool {
        self.category() == ErrorCategory::Validation
    }

    pub fn is_fatal(&self) -> bool {
        self.category() == ErrorCategory::Fatal
    }

    /// True when the run could not start because another run holds the lock
    pub fn is_lock_contention(&self) -> bool {
        matches!(self, Self::LockHeld { .. })
    }
}
