/*!
Header-window verification of compressed stream artifacts.

An artifact is trusted only when its first decompressed bytes parse as a
replication stream. The check is fail-closed: any problem reading, decompressing
or validating the window yields `false`.
*/

use crate::config::{VERIFY_TIMEOUT, VERIFY_WINDOW_BYTES};
use crate::tools::Toolbox;
use crate::{observability, Result, ZchainError};
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Checks artifacts by feeding a decompressed prefix to the stream validator
#[derive(Debug, Clone)]
pub struct ArtifactVerifier {
    toolbox: Toolbox,
    window: usize,
    timeout: Duration,
}

impl ArtifactVerifier {
    pub fn new(toolbox: Toolbox) -> Self {
        Self {
            toolbox,
            window: VERIFY_WINDOW_BYTES,
            timeout: VERIFY_TIMEOUT,
        }
    }

    /// Deadline for each of the decompression and validation steps
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// True only when the artifact's header decompresses and validates
    pub fn verify(&self, path: &Path) -> bool {
        match self.check(path) {
            Ok(()) => {
                debug!(artifact = %path.display(), "Artifact verified");
                true
            }
            Err(e) => {
                warn!(artifact = %path.display(), error = %e, "Artifact verification failed");
                observability::record_verification_failure();
                false
            }
        }
    }

    fn check(&self, path: &Path) -> Result<()> {
        if !path.is_file() {
            return Err(ZchainError::fatal("artifact does not exist"));
        }

        let window = self.read_window(path)?;
        if window.is_empty() {
            return Err(ZchainError::fatal("decompressed stream is empty"));
        }

        let output = self.toolbox.pipeline().run_with_input(
            &self.toolbox.validator(),
            &window,
            self.timeout,
        )?;
        if !output.success() {
            return Err(ZchainError::fatal(format!(
                "stream validator rejected header ({}): {}",
                output.status,
                output.stderr_text()
            )));
        }
        Ok(())
    }

    /// First `window` decompressed bytes of the artifact
    fn read_window(&self, path: &Path) -> Result<Vec<u8>> {
        let argv = self.toolbox.decompressor(path);
        let program = argv.first().cloned().unwrap_or_default();
        let binary = self
            .toolbox
            .resolver()
            .resolve(&program)
            .ok_or_else(|| ZchainError::binary_not_found(program.as_str()))?;

        let mut child = Command::new(binary)
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| ZchainError::fatal("decompressor stdout unavailable"))?;

        let limit = self.window;
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut buf = vec![0u8; limit];
            let mut filled = 0;
            let result = loop {
                if filled == limit {
                    break Ok(filled);
                }
                match stdout.read(&mut buf[filled..]) {
                    Ok(0) => break Ok(filled),
                    Ok(n) => filled += n,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => break Err(e),
                }
            };
            buf.truncate(filled);
            let _ = tx.send(result.map(|_| buf));
        });

        let window = match rx.recv_timeout(self.timeout) {
            Ok(Ok(window)) => window,
            Ok(Err(e)) => {
                stop(&mut child);
                return Err(e.into());
            }
            Err(_) => {
                stop(&mut child);
                return Err(ZchainError::Timeout {
                    program,
                    timeout: self.timeout,
                });
            }
        };

        if window.len() == limit {
            // Enough bytes; the rest of the stream is not needed.
            stop(&mut child);
            return Ok(window);
        }

        // The stream ended early, so the decompressor has to have finished cleanly.
        let status = child.wait()?;
        if !status.success() {
            return Err(ZchainError::StageFailed {
                index: 0,
                program,
                status: status.to_string(),
                stderr: String::new(),
            });
        }
        Ok(window)
    }
}

fn stop(child: &mut Child) {
    if let Ok(None) = child.try_wait() {
        let _ = child.kill();
    }
    let _ = child.wait();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Pipeline;
    use crate::tools::PathResolver;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Arc;
    use std::time::Instant;
    use tempfile::TempDir;

    fn write_script(dir: &Path, name: &str, body: &str) {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    /// Fake tools: `gzip -dc` copies the file, `zstreamdump` wants a STREAM header
    fn fake_tools(dir: &Path) -> ArtifactVerifier {
        // Shadow any system pigz so the fake gzip is chosen
        write_script(dir, "pigz", "exit 1");
        write_script(
            dir,
            "gzip",
            r#"if [ "$1" = "-dc" ]; then exec cat "$2"; fi
exec cat"#,
        );
        write_script(
            dir,
            "zstreamdump",
            r#"head -c 6 | grep -q '^STREAM' || { echo "invalid stream" >&2; exit 1; }"#,
        );
        let resolver = PathResolver::isolated([dir.to_path_buf(), "/usr/bin".into(), "/bin".into()]);
        ArtifactVerifier::new(Toolbox::new(Pipeline::new(Arc::new(resolver))))
    }

    #[test]
    fn test_valid_artifact() {
        let temp_dir = TempDir::new().unwrap();
        let verifier = fake_tools(temp_dir.path());
        let artifact = temp_dir.path().join("p-full-20250101000000.zfs.gz");
        std::fs::write(&artifact, "STREAM full payload").unwrap();

        assert!(verifier.verify(&artifact));
    }

    #[test]
    fn test_corrupted_first_byte() {
        let temp_dir = TempDir::new().unwrap();
        let verifier = fake_tools(temp_dir.path());
        let artifact = temp_dir.path().join("p-full-20250101000000.zfs.gz");
        std::fs::write(&artifact, "XTREAM full payload").unwrap();

        assert!(!verifier.verify(&artifact));
    }

    #[test]
    fn test_missing_and_empty_artifacts() {
        let temp_dir = TempDir::new().unwrap();
        let verifier = fake_tools(temp_dir.path());

        assert!(!verifier.verify(&temp_dir.path().join("absent.zfs.gz")));

        let empty = temp_dir.path().join("empty.zfs.gz");
        std::fs::write(&empty, "").unwrap();
        assert!(!verifier.verify(&empty));
    }

    #[test]
    fn test_decompressor_failure() {
        let temp_dir = TempDir::new().unwrap();
        let verifier = fake_tools(temp_dir.path());
        // Valid prefix, then the decompressor reports corruption
        write_script(
            temp_dir.path(),
            "gzip",
            r#"printf STREAM; echo "unexpected end of file" >&2; exit 1"#,
        );
        let artifact = temp_dir.path().join("p-diff-20250101000000.zfs.gz");
        std::fs::write(&artifact, "STREAM").unwrap();

        assert!(!verifier.verify(&artifact));
    }

    #[test]
    fn test_long_stream_is_cut_at_window() {
        let temp_dir = TempDir::new().unwrap();
        let verifier = fake_tools(temp_dir.path());
        write_script(temp_dir.path(), "gzip", "exec yes STREAM");
        let artifact = temp_dir.path().join("p-full-20250101000000.zfs.gz");
        std::fs::write(&artifact, "ignored").unwrap();

        let started = Instant::now();
        assert!(verifier.verify(&artifact));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_hanging_decompressor_times_out() {
        let temp_dir = TempDir::new().unwrap();
        let verifier = fake_tools(temp_dir.path()).with_timeout(Duration::from_millis(200));
        write_script(temp_dir.path(), "gzip", "exec sleep 5");
        let artifact = temp_dir.path().join("p-full-20250101000000.zfs.gz");
        std::fs::write(&artifact, "STREAM").unwrap();

        let started = Instant::now();
        assert!(!verifier.verify(&artifact));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_hanging_validator_times_out() {
        let temp_dir = TempDir::new().unwrap();
        let verifier = fake_tools(temp_dir.path()).with_timeout(Duration::from_millis(300));
        write_script(temp_dir.path(), "zstreamdump", "exec sleep 5");
        let artifact = temp_dir.path().join("p-full-20250101000000.zfs.gz");
        std::fs::write(&artifact, "STREAM full payload").unwrap();

        let started = Instant::now();
        assert!(!verifier.verify(&artifact));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_missing_validator() {
        let temp_dir = TempDir::new().unwrap();
        write_script(temp_dir.path(), "gzip", r#"exec cat "$2""#);
        let resolver = PathResolver::isolated([temp_dir.path()]);
        let verifier = ArtifactVerifier::new(Toolbox::new(Pipeline::new(Arc::new(resolver))));
        let artifact = temp_dir.path().join("p-full-20250101000000.zfs.gz");
        std::fs::write(&artifact, "STREAM").unwrap();

        assert!(!verifier.verify(&artifact));
    }
}
