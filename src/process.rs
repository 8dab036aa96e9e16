//! Host process helpers.
//!
//! Thin wrappers over `kill(2)` / `waitpid(2)` used to supervise
//! hypervisor processes by pid across CLI invocations.

use crate::poll::{poll_until, Backoff, PollOutcome};
use std::time::Duration;

/// Check whether `pid` refers to a live process.
///
/// Reaps the process first if it is an exited child of ours, so zombies
/// are not reported as alive. A process we may not signal (EPERM) still
/// exists and counts as alive.
pub fn is_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }

    let mut status: libc::c_int = 0;
    let reaped = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
    if reaped == pid {
        return false;
    }

    // Check if process exists by sending signal 0
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Send SIGTERM. Returns false if the process was already gone.
pub fn terminate(pid: i32) -> bool {
    signal(pid, libc::SIGTERM)
}

/// Send SIGKILL. Returns false if the process was already gone.
pub fn kill(pid: i32) -> bool {
    signal(pid, libc::SIGKILL)
}

fn signal(pid: i32, sig: libc::c_int) -> bool {
    if pid <= 0 {
        return false;
    }
    unsafe { libc::kill(pid, sig) == 0 }
}

/// Wait up to `timeout` for `pid` to exit. Returns true if it did.
pub fn wait_for_exit(pid: i32, timeout: Duration) -> bool {
    let outcome = poll_until(
        timeout,
        Backoff::fixed(Duration::from_millis(100)),
        None,
        || Ok((!is_alive(pid)).then_some(())),
    );
    matches!(outcome, Ok(PollOutcome::Ready(())))
}

/// Terminate `pid`, escalating to SIGKILL after `grace`.
///
/// Returns true if the forced path was taken.
pub fn terminate_with_grace(pid: i32, grace: Duration) -> bool {
    if !terminate(pid) || wait_for_exit(pid, grace) {
        return false;
    }

    tracing::debug!(pid, "process ignored SIGTERM, sending SIGKILL");
    kill(pid);
    wait_for_exit(pid, Duration::from_secs(5));
    true
}
