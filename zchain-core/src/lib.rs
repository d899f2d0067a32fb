/*!
# zchain Core Engine

Chained ZFS snapshot backup and restore onto a mounted filesystem.

A backup run produces one compressed replication stream ("artifact") per
invocation. Artifacts are grouped into chains: a chain directory holds one full
stream and the differential streams taken against it. Restores replay a chain
in order into `zfs receive`.

This crate provides:

- Supervised multi-stage process pipelines (`zfs send | pv | gzip > file`)
- The on-disk chain store with atomic writes and retention pruning
- The full/differential decision with fallback when a base snapshot vanished
- Header verification of artifacts before they are trusted
- Single-writer locking for whole invocations

## Architecture

External tools are never reimplemented. Every program is located through a
[`BinaryResolver`] and driven through [`Pipeline`]; snapshot control-plane
operations go through the [`SnapshotFacility`] port, implemented by [`ZfsCli`].

## Usage

```rust,no_run
use zchain_core::{
    ArtifactVerifier, BackupEngine, BackupSettings, ChainStore, Pipeline, Toolbox, ZfsCli,
};

let settings = BackupSettings::new("rpool/data", "/mnt/backups");
let toolbox = Toolbox::new(Pipeline::system());
let store = ChainStore::new(settings.target_dir());
let engine = BackupEngine::new(
    settings,
    store,
    ZfsCli::new(toolbox.clone()),
    toolbox.clone(),
    ArtifactVerifier::new(toolbox),
);

let outcome = engine.run()?;
println!("wrote {:?} into {}", outcome.artifact, outcome.chain);
# Ok::<(), zchain_core::ZchainError>(())
```
*/

pub mod artifact;
pub mod backup;
pub mod config;
pub mod dataset;
pub mod error;
pub mod lock;
pub mod observability;
pub mod pipeline;
pub mod preflight;
pub mod restore;
pub mod store;
pub mod tools;
pub mod verify;
pub mod zfs;

#[cfg(test)]
mod artifact_tests;
#[cfg(test)]
mod error_tests;

pub use artifact::{Artifact, ArtifactId, ArtifactKind};
pub use backup::{BackupEngine, BackupMode, BackupOutcome, BackupPlan};
pub use config::{BackupSettings, LoggingConfig, RestoreSettings};
pub use error::{ErrorCategory, Result, ZchainError};
pub use lock::{install_termination_cleanup, LockHandle};
pub use pipeline::{CommandOutput, Pipeline, PipelineStage, StageRole};
pub use preflight::{Action, Preflight};
pub use restore::{RestoreEngine, RestoreOptions, RestoreOutcome};
pub use store::{ChainDir, ChainStore, PruneReport};
pub use tools::{BinaryResolver, PathResolver, Toolbox};
pub use verify::ArtifactVerifier;
pub use zfs::{SnapshotFacility, ZfsCli};
