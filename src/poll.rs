//! Bounded polling with capped exponential backoff.
//!
//! Used wherever vmctl waits on something outside its control: a booting
//! machine, a process that was asked to exit, a contended lock.

use crate::error::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cooperative cancellation flag shared with a waiting operation.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Create an unset flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Delay schedule between probes.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    /// First delay.
    pub initial: Duration,
    /// Upper bound for any single delay.
    pub max: Duration,
}

impl Backoff {
    /// Fixed-interval schedule.
    pub fn fixed(interval: Duration) -> Self {
        Self {
            initial: interval,
            max: interval,
        }
    }

    /// Doubling schedule capped at `max`.
    pub fn exponential(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::exponential(Duration::from_millis(100), Duration::from_secs(2))
    }
}

/// How a poll loop ended.
#[derive(Debug, PartialEq, Eq)]
pub enum PollOutcome<T> {
    /// The probe produced a value.
    Ready(T),
    /// The timeout elapsed first.
    TimedOut,
    /// The cancel flag was set.
    Cancelled,
}

/// Probe until it yields `Some`, the timeout elapses, or the wait is cancelled.
///
/// Unless already cancelled, the probe runs at least once. A probe error
/// ends the loop immediately.
pub fn poll_until<T, F>(
    timeout: Duration,
    backoff: Backoff,
    cancel: Option<&CancelFlag>,
    mut probe: F,
) -> Result<PollOutcome<T>>
where
    F: FnMut() -> Result<Option<T>>,
{
    let start = Instant::now();
    let mut delay = backoff.initial;

    loop {
        if cancel.is_some_and(CancelFlag::is_cancelled) {
            return Ok(PollOutcome::Cancelled);
        }

        if let Some(value) = probe()? {
            return Ok(PollOutcome::Ready(value));
        }

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Ok(PollOutcome::TimedOut);
        }

        std::thread::sleep(delay.min(timeout - elapsed));
        delay = (delay * 2).min(backoff.max);
    }
}
