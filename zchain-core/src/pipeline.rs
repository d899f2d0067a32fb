/*!
Supervised execution of external commands and piped command chains.

A pipeline is an explicit list of [`PipelineStage`]s. Each stage's stdout is
connected to the next stage's stdin; the last stage writes to a file or to
`/dev/null`. The runner waits for every stage, drains every stderr, enforces
one deadline for the whole chain, and never leaves a spawned stage unreaped.
*/

use crate::tools::{BinaryResolver, PathResolver};
use crate::{observability, Result, ZchainError};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error};

use crate::config::DEFAULT_COMMAND_TIMEOUT;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// What a stage does in the chain; used for logging and error reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageRole {
    Source,
    RateLimiter,
    Compressor,
    Decompressor,
    Sink,
}

/// One external process in a pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineStage {
    pub argv: Vec<String>,
    pub role: StageRole,
}

impl PipelineStage {
    pub fn new(argv: Vec<String>, role: StageRole) -> Self {
        Self { argv, role }
    }

    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or("")
    }
}

/// Exit status and captured output of one command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// `pv -q -L <rate>`
pub fn rate_limiter_argv(rate: &str) -> Vec<String> {
    vec!["pv".to_string(), "-q".to_string(), "-L".to_string(), rate.to_string()]
}

/// `source -> [pv] -> [compressor]`; absent stages are left out entirely
pub fn rate_limited_stages(
    source: &[String],
    rate_limit: Option<&str>,
    compression: Option<&[String]>,
) -> Vec<PipelineStage> {
    let mut stages = vec![PipelineStage::new(source.to_vec(), StageRole::Source)];
    if let Some(rate) = rate_limit {
        stages.push(PipelineStage::new(
            rate_limiter_argv(rate),
            StageRole::RateLimiter,
        ));
    }
    if let Some(compression) = compression {
        stages.push(PipelineStage::new(
            compression.to_vec(),
            StageRole::Compressor,
        ));
    }
    stages
}

/// Runs commands and pipelines with binaries located through a [`BinaryResolver`]
#[derive(Debug, Clone)]
pub struct Pipeline {
    resolver: Arc<dyn BinaryResolver>,
    command_timeout: Duration,
}

impl Pipeline {
    pub fn new(resolver: Arc<dyn BinaryResolver>) -> Self {
        Self {
            resolver,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Pipeline resolving binaries from `PATH` and the standard system directories
    pub fn system() -> Self {
        Self::new(Arc::new(PathResolver::system()))
    }

    /// Deadline applied by [`Pipeline::run_simple`] and [`Pipeline::run_status`]
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn resolver(&self) -> &dyn BinaryResolver {
        self.resolver.as_ref()
    }

    /// Run one command to completion and return its output
    ///
    /// # Errors
    /// * `ZchainError::BinaryNotFound` - the program cannot be located
    /// * `ZchainError::StageFailed` - the command exited unsuccessfully
    /// * `ZchainError::Timeout` - the command outlived the command timeout
    pub fn run_simple(&self, argv: &[String]) -> Result<CommandOutput> {
        self.run_with_timeout(argv, self.command_timeout)
    }

    /// [`Pipeline::run_simple`] with an explicit deadline
    pub fn run_with_timeout(&self, argv: &[String], timeout: Duration) -> Result<CommandOutput> {
        debug!(command = %argv.join(" "), "Running");
        let output = self.capture(argv, None, timeout)?;
        if !output.success() {
            return Err(ZchainError::StageFailed {
                index: 0,
                program: program_of(argv),
                status: output.status.to_string(),
                stderr: output.stderr_text(),
            });
        }
        Ok(output)
    }

    /// Run an existence check; a non-zero exit is `Ok(false)`
    pub fn run_status(&self, argv: &[String]) -> Result<bool> {
        debug!(command = %argv.join(" "), "Probing");
        let output = self.capture(argv, None, self.command_timeout)?;
        Ok(output.success())
    }

    /// Run one command with `input` on its stdin
    ///
    /// Unlike [`Pipeline::run_simple`] a non-zero exit is returned, not raised.
    pub fn run_with_input(
        &self,
        argv: &[String],
        input: &[u8],
        timeout: Duration,
    ) -> Result<CommandOutput> {
        self.capture(argv, Some(input), timeout)
    }

    /// Run the stages as one pipeline, discarding the last stage's stdout
    ///
    /// # Errors
    /// * `ZchainError::InvalidArgument` - `stages` is empty
    /// * `ZchainError::StageFailed` - the most root-cause failing stage
    /// * `ZchainError::Timeout` - the pipeline outlived `timeout`; every stage
    ///   still running has been killed and reaped
    pub fn run_pipeline(&self, stages: &[PipelineStage], timeout: Option<Duration>) -> Result<()> {
        self.execute(stages, None, timeout)
    }

    /// Run `source -> [pv] -> compressor` into a newly created `output_path`
    ///
    /// The rate limiter is only inserted when `rate_limit` is set. The file is
    /// created exclusively and synced on success. On error the partial file is
    /// left for the caller to remove.
    pub fn run_with_rate_limit(
        &self,
        source: &[String],
        output_path: &Path,
        rate_limit: Option<&str>,
        compression: Option<&[String]>,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let stages = rate_limited_stages(source, rate_limit, compression);

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(output_path)?;
        let sync_handle = file.try_clone()?;

        // A lone source stage writes straight into the file.
        self.execute(&stages, Some(file), timeout)?;
        sync_handle.sync_all()?;
        Ok(())
    }

    fn command_for(&self, argv: &[String]) -> Result<Command> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| ZchainError::invalid_argument("empty command"))?;
        let path = self
            .resolver
            .resolve(program)
            .ok_or_else(|| ZchainError::binary_not_found(program.as_str()))?;
        let mut command = Command::new(path);
        command.args(args);
        Ok(command)
    }

    fn capture(
        &self,
        argv: &[String],
        input: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let mut command = self.command_for(argv)?;
        command
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .map_err(|e| spawn_error(e, &program_of(argv)))?;

        let writer = match (input, child.stdin.take()) {
            (Some(bytes), Some(mut stdin)) => {
                let bytes = bytes.to_vec();
                // The child may exit without reading; a broken pipe is its answer.
                Some(thread::spawn(move || {
                    let _ = stdin.write_all(&bytes);
                }))
            }
            _ => None,
        };
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let mut children = [child];
        let statuses = wait_all(&mut children, &[program_of(argv)], Some(timeout))?;

        if let Some(writer) = writer {
            let _ = writer.join();
        }
        Ok(CommandOutput {
            status: statuses[0],
            stdout: join(stdout),
            stderr: join(stderr),
        })
    }

    fn execute(
        &self,
        stages: &[PipelineStage],
        output: Option<File>,
        timeout: Option<Duration>,
    ) -> Result<()> {
        if stages.is_empty() {
            return Err(ZchainError::invalid_argument(
                "pipeline requires at least one stage",
            ));
        }

        // Resolve every binary before anything is spawned.
        let commands = stages
            .iter()
            .map(|stage| self.command_for(&stage.argv))
            .collect::<Result<Vec<_>>>()?;
        let programs: Vec<String> = stages.iter().map(|s| s.program().to_string()).collect();

        let description = stages
            .iter()
            .map(|s| s.argv.join(" "))
            .collect::<Vec<_>>()
            .join(" | ");
        debug!(pipeline = %description, "Running pipeline");
        let started = Instant::now();

        let last = stages.len() - 1;
        let mut output = output;
        let mut upstream: Option<ChildStdout> = None;
        let mut children: Vec<Child> = Vec::with_capacity(stages.len());
        let mut stderr_readers = Vec::with_capacity(stages.len());

        for (index, mut command) in commands.into_iter().enumerate() {
            let stdin = match upstream.take() {
                Some(read_end) => Stdio::from(read_end),
                None => Stdio::null(),
            };
            let stdout = if index == last {
                match output.take() {
                    Some(file) => Stdio::from(file),
                    None => Stdio::null(),
                }
            } else {
                Stdio::piped()
            };
            command.stdin(stdin).stdout(stdout).stderr(Stdio::piped());

            let spawned = command.spawn();
            // Dropping the command closes the parent's copy of the upstream read
            // end (and of the output file); otherwise the next stage never sees EOF.
            drop(command);

            let mut child = match spawned {
                Ok(child) => child,
                Err(e) => {
                    kill_and_reap(&mut children);
                    return Err(spawn_error(e, &programs[index]));
                }
            };
            stderr_readers.push(drain(child.stderr.take()));
            upstream = child.stdout.take();
            children.push(child);
        }

        let statuses = wait_all(&mut children, &programs, timeout)?;
        let stderrs: Vec<String> = stderr_readers
            .into_iter()
            .map(|reader| String::from_utf8_lossy(&join(reader)).trim().to_string())
            .collect();
        observability::record_pipeline_duration(started.elapsed());

        if let Some(index) = root_cause(&statuses) {
            let role = stages[index].role;
            error!(
                stage = index,
                role = ?role,
                program = %programs[index],
                status = %statuses[index],
                stderr = %stderrs[index],
                "Pipeline stage failed"
            );
            return Err(ZchainError::StageFailed {
                index,
                program: programs[index].clone(),
                status: statuses[index].to_string(),
                stderr: stderrs[index].clone(),
            });
        }

        let elapsed_ms = started.elapsed().as_millis();
        debug!(elapsed_ms, "Pipeline finished");
        Ok(())
    }
}

/// Earliest stage that failed on its own; SIGPIPE deaths are usually a
/// downstream failure, so they are only reported when nothing else failed.
fn root_cause(statuses: &[ExitStatus]) -> Option<usize> {
    let failed: Vec<usize> = statuses
        .iter()
        .enumerate()
        .filter(|(_, status)| !status.success())
        .map(|(index, _)| index)
        .collect();

    failed
        .iter()
        .copied()
        .find(|&index| !killed_by_sigpipe(&statuses[index]))
        .or_else(|| failed.first().copied())
}

fn killed_by_sigpipe(status: &ExitStatus) -> bool {
    status.signal() == Some(nix::sys::signal::Signal::SIGPIPE as i32)
}

/// Poll every child until all have exited or the deadline passes
fn wait_all(
    children: &mut [Child],
    programs: &[String],
    timeout: Option<Duration>,
) -> Result<Vec<ExitStatus>> {
    let deadline = timeout.map(|t| Instant::now() + t);
    let mut statuses: Vec<Option<ExitStatus>> = vec![None; children.len()];

    loop {
        for (index, child) in children.iter_mut().enumerate() {
            if statuses[index].is_none() {
                match child.try_wait() {
                    Ok(status) => statuses[index] = status,
                    Err(e) => {
                        kill_and_reap(children);
                        return Err(e.into());
                    }
                }
            }
        }

        if statuses.iter().all(Option::is_some) {
            return Ok(statuses.into_iter().flatten().collect());
        }

        if let (Some(deadline), Some(timeout)) = (deadline, timeout) {
            if Instant::now() >= deadline {
                let program = statuses
                    .iter()
                    .position(Option::is_none)
                    .and_then(|index| programs.get(index))
                    .cloned()
                    .unwrap_or_default();
                kill_and_reap(children);
                let timeout_secs = timeout.as_secs();
                error!(program = %program, timeout_secs, "Timed out; killed remaining stages");
                return Err(ZchainError::Timeout { program, timeout });
            }
        }

        thread::sleep(POLL_INTERVAL);
    }
}

fn kill_and_reap(children: &mut [Child]) {
    for child in children.iter_mut() {
        if let Ok(None) = child.try_wait() {
            let _ = child.kill();
        }
        let _ = child.wait();
    }
}

fn drain<R: Read + Send + 'static>(reader: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    reader.map(|mut reader| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = reader.read_to_end(&mut buf);
            buf
        })
    })
}

fn join(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

fn spawn_error(e: std::io::Error, program: &str) -> ZchainError {
    if e.kind() == std::io::ErrorKind::NotFound {
        ZchainError::binary_not_found(program)
    } else {
        ZchainError::Io(e)
    }
}

fn program_of(argv: &[String]) -> String {
    argv.first().cloned().unwrap_or_default()
}
