//! ## Watchdog
//!
//! Single-shot I/O deadline bound to a board. The session layer arms it with
//! the caller's timeout, the transport polls it cooperatively.
//!

use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::lock;

#[derive(Debug, Default)]
pub struct Watchdog {
    deadline: Mutex<Option<Instant>>,
}

impl Watchdog {
    pub fn new() -> Watchdog {
        Watchdog::default()
    }

    /// ### Arm
    ///
    /// Start the timer. `None` means the I/O may block forever.
    ///
    pub fn arm(&self, timeout: Option<Duration>) {
        *lock(&self.deadline) = timeout.map(|t| Instant::now() + t);
    }

    pub fn disarm(&self) {
        *lock(&self.deadline) = None;
    }

    /// Arm the timer for the lifetime of the returned guard
    pub fn start(&self, timeout: Option<Duration>) -> WatchdogGuard<'_> {
        self.arm(timeout);
        WatchdogGuard { watchdog: self }
    }

    /// The deadline has passed
    pub fn io_timed_out(&self) -> bool {
        lock(&self.deadline).is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Time left before the deadline, `None` when no deadline is armed
    pub fn remaining(&self) -> Option<Duration> {
        lock(&self.deadline).map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

/// Disarms the watchdog when dropped
#[derive(Debug)]
pub struct WatchdogGuard<'a> {
    watchdog: &'a Watchdog,
}

impl Drop for WatchdogGuard<'_> {
    fn drop(&mut self) {
        self.watchdog.disarm();
    }
}
