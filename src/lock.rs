//! Exclusive advisory file locks.
//!
//! Every read-modify-write of persisted state happens while holding a
//! [`FileLock`]. Locks are `flock(2)` based, so they are released by the
//! kernel if the holder dies, and on drop otherwise.

use crate::error::{Error, Result};
use crate::poll::{poll_until, Backoff, PollOutcome};
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A held exclusive lock. Released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Acquire an exclusive lock on `path`, waiting up to `timeout`.
    ///
    /// The lock file is created if missing. Fails with
    /// [`Error::LockContention`] when another holder keeps it past the
    /// timeout.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let outcome = poll_until(
            timeout,
            Backoff::exponential(Duration::from_millis(10), Duration::from_millis(250)),
            None,
            || try_lock(&file),
        )?;

        match outcome {
            PollOutcome::Ready(()) => {
                tracing::trace!(path = %path.display(), "lock acquired");
                Ok(Self {
                    file,
                    path: path.to_path_buf(),
                })
            }
            PollOutcome::TimedOut | PollOutcome::Cancelled => Err(Error::LockContention {
                path: path.to_path_buf(),
            }),
        }
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
        tracing::trace!(path = %self.path.display(), "lock released");
    }
}

/// One non-blocking lock attempt. `Ok(None)` means someone else holds it.
fn try_lock(file: &File) -> Result<Option<()>> {
    let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if ret == 0 {
        return Ok(Some(()));
    }

    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(code) if code == libc::EWOULDBLOCK || code == libc::EINTR => Ok(None),
        _ => Err(err.into()),
    }
}
