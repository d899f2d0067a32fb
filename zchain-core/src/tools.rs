/*!
External tool resolution and argument vectors.

Every external program is reached through a [`BinaryResolver`], so tests and
unusual installations can point the engine at other binaries. [`Toolbox`]
builds the argument vectors for the snapshot, stream, compression, rate
limiting and validation tools.
*/

use crate::pipeline::{Pipeline, PipelineStage, StageRole};
use once_cell::sync::OnceCell;
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Directories searched after `PATH`; cron runs often have a minimal `PATH`
pub const FALLBACK_DIRS: &[&str] = &[
    "/usr/local/sbin",
    "/usr/local/bin",
    "/usr/sbin",
    "/usr/bin",
    "/sbin",
    "/bin",
];

const COMPRESSOR_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Locates executables by name
pub trait BinaryResolver: fmt::Debug + Send + Sync {
    /// Absolute path of `name`, or `None` if it cannot be found
    fn resolve(&self, name: &str) -> Option<PathBuf>;
}

/// Resolver searching an ordered list of directories, optionally `PATH` first
#[derive(Debug, Clone)]
pub struct PathResolver {
    use_path_env: bool,
    dirs: Vec<PathBuf>,
}

impl PathResolver {
    /// `PATH`, then [`FALLBACK_DIRS`]
    pub fn system() -> Self {
        Self {
            use_path_env: true,
            dirs: FALLBACK_DIRS.iter().map(PathBuf::from).collect(),
        }
    }

    /// Only the given directories, in order; `PATH` is ignored
    pub fn isolated<I, P>(dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            use_path_env: false,
            dirs: dirs.into_iter().map(Into::into).collect(),
        }
    }
}

impl Default for PathResolver {
    fn default() -> Self {
        Self::system()
    }
}

impl BinaryResolver for PathResolver {
    fn resolve(&self, name: &str) -> Option<PathBuf> {
        let candidate = Path::new(name);
        if candidate.is_absolute() {
            return is_executable(candidate).then(|| candidate.to_path_buf());
        }

        if self.use_path_env {
            if let Ok(found) = which::which(name) {
                return Some(found);
            }
        }

        self.dirs
            .iter()
            .map(|dir| dir.join(name))
            .find(|path| is_executable(path))
    }
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Argument vector builder for the external tools
#[derive(Debug, Clone)]
pub struct Toolbox {
    pipeline: Pipeline,
    compressor: OnceCell<String>,
}

impl Toolbox {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline,
            compressor: OnceCell::new(),
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn resolver(&self) -> &dyn BinaryResolver {
        self.pipeline.resolver()
    }

    pub fn zfs<I, S>(&self, args: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        command("zfs", args)
    }

    pub fn zpool<I, S>(&self, args: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        command("zpool", args)
    }

    /// Recursive replication stream of `dataset@snapshot`, incremental from
    /// `dataset@base` when a base is given
    pub fn zfs_send(&self, dataset: &str, snapshot: &str, base: Option<&str>) -> Vec<String> {
        let mut argv = self.zfs(["send", "-R"]);
        if let Some(base) = base {
            argv.push("-i".to_string());
            argv.push(format!("{dataset}@{base}"));
        }
        argv.push(format!("{dataset}@{snapshot}"));
        argv
    }

    /// Forced receive into `dest`
    pub fn zfs_receive(&self, dest: &str) -> Vec<String> {
        self.zfs(["receive", "-F", dest])
    }

    /// Compressor writing to stdout: `pigz` when present and working, else `gzip`
    pub fn compressor(&self) -> Vec<String> {
        vec![self.compressor_program().to_string()]
    }

    /// Decompress `path` to stdout
    pub fn decompressor(&self, path: &Path) -> Vec<String> {
        vec![
            self.compressor_program().to_string(),
            "-dc".to_string(),
            path.to_string_lossy().into_owned(),
        ]
    }

    /// Stream validator reading a stream prefix on stdin
    pub fn validator(&self) -> Vec<String> {
        command("zstreamdump", ["-v"])
    }

    pub fn decompress_stage(&self, path: &Path) -> PipelineStage {
        PipelineStage::new(self.decompressor(path), StageRole::Decompressor)
    }

    /// Binaries needed for a run, `pv` only when rate limiting
    pub fn required_binaries(rate: Option<&str>) -> BTreeSet<&'static str> {
        let mut bins: BTreeSet<&'static str> = ["zfs", "zpool", "gzip", "zstreamdump"].into();
        if rate.is_some() {
            bins.insert("pv");
        }
        bins
    }

    /// Required binaries the resolver cannot find, sorted
    pub fn missing_binaries(&self, rate: Option<&str>) -> Vec<&'static str> {
        Self::required_binaries(rate)
            .into_iter()
            .filter(|name| self.resolver().resolve(name).is_none())
            .collect()
    }

    fn compressor_program(&self) -> &str {
        self.compressor.get_or_init(|| {
            if self.resolver().resolve("pigz").is_some() {
                match self
                    .pipeline
                    .run_with_timeout(&command("pigz", ["--version"]), COMPRESSOR_CHECK_TIMEOUT)
                {
                    Ok(_) => {
                        debug!("Using pigz for compression");
                        return "pigz".to_string();
                    }
                    Err(e) => debug!(error = %e, "pigz self-check failed, falling back to gzip"),
                }
            }
            "gzip".to_string()
        })
    }
}

fn command<I, S>(program: &str, args: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    std::iter::once(program.to_string())
        .chain(args.into_iter().map(Into::into))
        .collect()
}
