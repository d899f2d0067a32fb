/*!
Snapshot facility abstraction.

The engines talk to ZFS through the [`SnapshotFacility`] port. [`ZfsCli`] is the
adapter that drives the `zfs` and `zpool` executables; tests substitute fake
executables or a mock.
*/

use crate::tools::Toolbox;
use crate::Result;
use tracing::{debug, info};

/// Control-plane operations on datasets and snapshots
///
/// Streams (send/receive) are not part of this port; they run as pipelines
/// built from [`Toolbox::zfs_send`] and [`Toolbox::zfs_receive`].
#[cfg_attr(test, mockall::automock)]
pub trait SnapshotFacility {
    /// Check whether a dataset exists
    ///
    /// # Arguments
    /// * `dataset` - Full dataset name, e.g. `pool/data`
    fn dataset_exists(&self, dataset: &str) -> Result<bool>;

    /// Check whether a pool exists
    fn pool_exists(&self, pool: &str) -> Result<bool>;

    /// Check whether `dataset@snapshot` exists
    ///
    /// # Arguments
    /// * `dataset` - Full dataset name
    /// * `snapshot` - Snapshot name without the `@`
    fn snapshot_exists(&self, dataset: &str, snapshot: &str) -> Result<bool>;

    /// Create `dataset@snapshot` recursively
    fn create_snapshot(&self, dataset: &str, snapshot: &str) -> Result<()>;

    /// Destroy `dataset@snapshot` recursively
    fn destroy_snapshot(&self, dataset: &str, snapshot: &str) -> Result<()>;

    /// Full names (`dataset@snap`) of every snapshot under `dataset`
    fn list_snapshots(&self, dataset: &str) -> Result<Vec<String>>;

    /// Create an empty dataset
    fn create_dataset(&self, dataset: &str) -> Result<()>;
}

/// [`SnapshotFacility`] backed by the `zfs` and `zpool` command-line tools
#[derive(Debug, Clone)]
pub struct ZfsCli {
    toolbox: Toolbox,
}

impl ZfsCli {
    pub fn new(toolbox: Toolbox) -> Self {
        Self { toolbox }
    }
}

impl SnapshotFacility for ZfsCli {
    fn dataset_exists(&self, dataset: &str) -> Result<bool> {
        self.toolbox
            .pipeline()
            .run_status(&self.toolbox.zfs(["list", dataset]))
    }

    fn pool_exists(&self, pool: &str) -> Result<bool> {
        self.toolbox
            .pipeline()
            .run_status(&self.toolbox.zpool(["list", pool]))
    }

    fn snapshot_exists(&self, dataset: &str, snapshot: &str) -> Result<bool> {
        let full = format!("{dataset}@{snapshot}");
        self.toolbox
            .pipeline()
            .run_status(&self.toolbox.zfs(["list", "-t", "snapshot", full.as_str()]))
    }

    fn create_snapshot(&self, dataset: &str, snapshot: &str) -> Result<()> {
        let full = format!("{dataset}@{snapshot}");
        info!(snapshot = %full, "Creating snapshot");
        self.toolbox
            .pipeline()
            .run_simple(&self.toolbox.zfs(["snapshot", "-r", full.as_str()]))?;
        Ok(())
    }

    fn destroy_snapshot(&self, dataset: &str, snapshot: &str) -> Result<()> {
        let full = format!("{dataset}@{snapshot}");
        info!(snapshot = %full, "Destroying snapshot");
        self.toolbox
            .pipeline()
            .run_simple(&self.toolbox.zfs(["destroy", "-r", full.as_str()]))?;
        Ok(())
    }

    fn list_snapshots(&self, dataset: &str) -> Result<Vec<String>> {
        let output = self.toolbox.pipeline().run_simple(&self.toolbox.zfs([
            "list", "-H", "-o", "name", "-t", "snapshot", "-r", dataset,
        ]))?;
        let snapshots: Vec<String> = output
            .stdout_text()
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect();
        debug!(dataset, count = snapshots.len(), "Listed snapshots");
        Ok(snapshots)
    }

    fn create_dataset(&self, dataset: &str) -> Result<()> {
        info!(dataset, "Creating dataset");
        self.toolbox
            .pipeline()
            .run_simple(&self.toolbox.zfs(["create", dataset]))?;
        Ok(())
    }
}
