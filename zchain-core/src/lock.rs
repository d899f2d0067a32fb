//! Run lock guarding a whole backup, restore or cleanup invocation
//!
//! The lock is an advisory exclusive `flock` taken without blocking. The lock
//! file is unlinked on release, so a subsequent acquirer re-creates it. That is
//! fine on a single host but not on network filesystems with stale-handle
//! semantics, where two hosts could each lock a different inode.

use crate::{Result, ZchainError};
use nix::fcntl::{flock, FlockArg};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error};

/// Lock file content, informational only
#[derive(Debug, Serialize, Deserialize)]
struct LockContent {
    pid: u32,
    started_at: u64,
}

/// Held run lock; released on [`LockHandle::release`] or drop
#[derive(Debug)]
pub struct LockHandle {
    path: PathBuf,
    file: Option<File>,
}

impl LockHandle {
    /// Acquire the exclusive lock at `path` without waiting
    ///
    /// # Errors
    /// * `ZchainError::LockHeld` - another process holds the lock
    /// * `ZchainError::Io` - the lock file could not be created
    pub fn acquire<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;

        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(()) => {}
            Err(nix::errno::Errno::EWOULDBLOCK) => {
                error!(path = %path.display(), "Lock held");
                return Err(ZchainError::LockHeld { path });
            }
            Err(e) => return Err(ZchainError::Io(e.into())),
        }

        write_lock_content(&mut file)?;
        debug!(path = %path.display(), "Acquired run lock");

        Ok(Self {
            path,
            file: Some(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }

    /// Release the lock and remove the lock file
    ///
    /// Safe to call more than once; every failure is ignored.
    pub fn release(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = flock(file.as_raw_fd(), FlockArg::Unlock);
            drop(file);
            disarm_termination_cleanup(&self.path);
            let _ = std::fs::remove_file(&self.path);
            debug!(path = %self.path.display(), "Released run lock");
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.release();
    }
}

fn write_lock_content(file: &mut File) -> Result<()> {
    let content = LockContent {
        pid: std::process::id(),
        started_at: chrono::Utc::now().timestamp_millis().max(0) as u64,
    };
    let serialized = serde_json::to_string(&content)
        .map_err(|e| ZchainError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;

    file.set_len(0)?;
    file.write_all(serialized.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

static TERMINATION_LOCK_PATH: OnceCell<CString> = OnceCell::new();
static TERMINATION_ARMED: AtomicBool = AtomicBool::new(false);

/// Remove the lock file if the process is terminated by SIGINT, SIGTERM or SIGHUP
///
/// The kernel drops the `flock` itself when the process dies; the handler only
/// unlinks the path, restores the default disposition and re-raises the signal.
/// Only the first registered path is used. Releasing that lock disarms the
/// unlink, since the path may already belong to another run.
pub fn install_termination_cleanup(path: &Path) -> Result<()> {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| ZchainError::invalid_argument("Lock path contains a NUL byte"))?;
    let registered = TERMINATION_LOCK_PATH.get_or_init(|| c_path.clone());
    if *registered == c_path {
        TERMINATION_ARMED.store(true, Ordering::SeqCst);
    }

    let action = SigAction::new(
        SigHandler::Handler(handle_termination),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for signal in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP] {
        // SAFETY: the handler only performs async-signal-safe calls
        // (unlink, sigaction, raise) on data initialized before installation.
        unsafe { sigaction(signal, &action) }.map_err(|e| ZchainError::Io(e.into()))?;
    }
    Ok(())
}

fn disarm_termination_cleanup(path: &Path) {
    if let Some(registered) = TERMINATION_LOCK_PATH.get() {
        if registered.as_bytes() == path.as_os_str().as_bytes() {
            TERMINATION_ARMED.store(false, Ordering::SeqCst);
        }
    }
}

extern "C" fn handle_termination(signum: nix::libc::c_int) {
    use nix::sys::signal::{raise, signal, SigHandler, Signal};

    if TERMINATION_ARMED.load(Ordering::SeqCst) {
        if let Some(path) = TERMINATION_LOCK_PATH.get() {
            let _ = nix::unistd::unlink(path.as_c_str());
        }
    }
    if let Ok(sig) = Signal::try_from(signum) {
        // SAFETY: restoring the default disposition is async-signal-safe.
        let _ = unsafe { signal(sig, SigHandler::SigDfl) };
        let _ = raise(sig);
    }
}
