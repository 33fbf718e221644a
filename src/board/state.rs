//! ## Board State
//!
//! Hardware independent bookkeeping shared by every board implementation.
//!

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::lock;
use super::queue::StatusQueues;
use super::watchdog::Watchdog;
use crate::config::BoardConfig;
use crate::types::{BoardInfo, Status};

/// ### Board State
///
/// Status word, configuration snapshot, status queues, watchdog and the big
/// bus lock of one board.
///
#[derive(Debug)]
pub struct BoardState {
    config: BoardConfig,
    info: Mutex<BoardInfo>,
    status: Mutex<Status>,
    status_changed: Condvar,
    queues: Mutex<StatusQueues>,
    pub watchdog: Watchdog,
    bus_lock: Mutex<()>,
    online: AtomicBool,
    stuck_srq: AtomicBool,
    abort_requested: AtomicBool,
}

impl BoardState {
    pub fn new(config: BoardConfig) -> BoardState {
        let info = BoardInfo {
            pad: config.pad,
            sad: config.sad,
            parallel_poll_configuration: 0,
            autopolling: config.autopoll,
            is_system_controller: config.system_controller,
            t1_delay: 0,
            ist: false,
            no_7_bit_eos: false,
        };
        BoardState {
            info: Mutex::new(info),
            status: Mutex::new(Status::empty()),
            status_changed: Condvar::new(),
            queues: Mutex::new(StatusQueues::new(config.status_queue_capacity)),
            watchdog: Watchdog::new(),
            bus_lock: Mutex::new(()),
            online: AtomicBool::new(false),
            stuck_srq: AtomicBool::new(false),
            abort_requested: AtomicBool::new(false),
            config,
        }
    }

    pub fn config(&self) -> &BoardConfig {
        &self.config
    }

    pub fn info(&self) -> BoardInfo {
        lock(&self.info).clone()
    }

    pub fn update_info(&self, f: impl FnOnce(&mut BoardInfo)) {
        f(&mut lock(&self.info));
    }

    pub fn status(&self) -> Status {
        *lock(&self.status)
    }

    /// ### Merge Status
    ///
    /// Clear the `clear` bits then set the `set` bits, atomically for
    /// concurrent readers, and wake anyone waiting on a status change.
    ///
    pub fn merge_status(&self, set: Status, clear: Status) -> Status {
        let mut status = lock(&self.status);
        *status = (*status - clear) | set;
        self.status_changed.notify_all();
        *status
    }

    /// Wake status waiters without changing the status word
    pub fn notify(&self) {
        let _status = lock(&self.status);
        self.status_changed.notify_all();
    }

    /// Block until the status changes or `timeout` passes, returns the status
    pub fn wait_for_change(&self, timeout: Duration) -> Status {
        let status = lock(&self.status);
        let (status, _) = self
            .status_changed
            .wait_timeout(status, timeout)
            .unwrap_or_else(PoisonError::into_inner);
        *status
    }

    pub fn queues(&self) -> MutexGuard<'_, StatusQueues> {
        lock(&self.queues)
    }

    /// Take the big bus lock, held for any bus affecting call
    pub fn lock_bus(&self) -> MutexGuard<'_, ()> {
        lock(&self.bus_lock)
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// SRQ was asserted but no device answered the autopoll sweep
    pub fn stuck_srq(&self) -> bool {
        self.stuck_srq.load(Ordering::SeqCst)
    }

    pub fn set_stuck_srq(&self, stuck: bool) {
        self.stuck_srq.store(stuck, Ordering::SeqCst);
        self.notify();
    }

    /// ### Request Abort
    ///
    /// Mark the operation holding the bus lock as stopped. The mark stays
    /// until [`BoardState::clear_abort`], so a stop landing between two
    /// transfers still cancels the next one.
    ///
    pub fn request_abort(&self) {
        self.abort_requested.store(true, Ordering::SeqCst);
    }

    pub fn abort_requested(&self) -> bool {
        self.abort_requested.load(Ordering::SeqCst)
    }

    pub fn clear_abort(&self) {
        self.abort_requested.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn merge_clears_then_sets() {
        let state = BoardState::new(BoardConfig::default());
        state.merge_status(Status::CIC | Status::ATN, Status::empty());
        let status = state.merge_status(Status::TACS, Status::ATN);
        assert_eq!(status, Status::CIC | Status::TACS);
        assert_eq!(state.status(), status);
    }

    #[test]
    fn waiters_are_woken() {
        let state = Arc::new(BoardState::new(BoardConfig::default()));
        let waiter = {
            let state = Arc::clone(&state);
            std::thread::spawn(move || {
                let start = std::time::Instant::now();
                while !state.status().contains(Status::SRQI) {
                    state.wait_for_change(Duration::from_secs(5));
                }
                start.elapsed()
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        state.merge_status(Status::SRQI, Status::empty());
        assert!(waiter.join().unwrap() < Duration::from_secs(5));
    }

    #[test]
    fn info_follows_config() {
        let config = BoardConfig {
            pad: 7,
            ..BoardConfig::default()
        };
        let state = BoardState::new(config);
        assert_eq!(state.info().pad, 7);
        state.update_info(|info| info.t1_delay = 336);
        assert_eq!(state.info().t1_delay, 336);
        assert_eq!(state.queues().capacity(), 16);
    }

    #[test]
    fn abort_request_sticks_until_cleared() {
        let state = BoardState::new(BoardConfig::default());
        assert!(!state.abort_requested());
        state.request_abort();
        assert!(state.abort_requested());
        assert!(state.abort_requested());
        state.clear_abort();
        assert!(!state.abort_requested());
    }
}
