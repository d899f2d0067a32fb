/*!
Dataset name validation and mapping to directory-safe names.
*/

use crate::{Result, ZchainError};
use std::path::{Component, Path};

/// Longest dataset name accepted
pub const MAX_DATASET_NAME_LEN: usize = 256;

/// Validate a ZFS dataset name before it is used for any filesystem access
///
/// Rejects empty names, parent-directory sequences, absolute paths, characters
/// outside `[A-Za-z0-9/_-]` and names longer than [`MAX_DATASET_NAME_LEN`].
pub fn validate_dataset_name(dataset: &str) -> Result<()> {
    if dataset.is_empty() {
        return Err(ZchainError::validation("Dataset name cannot be empty"));
    }

    if dataset.contains("..") || dataset.starts_with('/') {
        return Err(ZchainError::validation(
            "Dataset name contains invalid path components",
        ));
    }

    if !dataset
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '-'))
    {
        return Err(ZchainError::validation(
            "Dataset name contains invalid characters",
        ));
    }

    if dataset.len() > MAX_DATASET_NAME_LEN {
        return Err(ZchainError::validation("Dataset name too long"));
    }

    Ok(())
}

/// Validate the backup mount point: non-empty, absolute, no `..` components
pub fn validate_mount_point(mount_point: &Path) -> Result<()> {
    if mount_point.as_os_str().is_empty() {
        return Err(ZchainError::validation("Mount point cannot be empty"));
    }

    if mount_point
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(ZchainError::validation("Mount point contains path traversal"));
    }

    if !mount_point.is_absolute() {
        return Err(ZchainError::validation("Mount point must be an absolute path"));
    }

    Ok(())
}

/// Map a dataset name to the directory name used below the mount point
///
/// ```rust
/// use zchain_core::dataset::sanitize_dataset_name;
///
/// assert_eq!(sanitize_dataset_name("rpool/data/home"), "rpool_data_home");
/// ```
pub fn sanitize_dataset_name(dataset: &str) -> String {
    dataset
        .replace('/', "_")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
        .collect()
}

/// Last path component of a dataset (`rpool/data` -> `data`)
pub fn dataset_leaf(dataset: &str) -> &str {
    dataset.rsplit('/').next().unwrap_or(dataset)
}
