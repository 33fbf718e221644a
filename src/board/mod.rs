//! ## Board
//!
//! The capability set every bus transport implements, and the hardware
//! independent state composed into each implementation.
//!

pub mod queue;
pub mod state;
pub mod watchdog;

#[cfg(test)]
pub(crate) mod mock;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use queue::{StatusQueue, StatusQueues};
pub use state::BoardState;
pub use watchdog::{Watchdog, WatchdogGuard};

use crate::error::Result;
use crate::types::{LineStatus, ReadOutcome, Status};

/// Lock a mutex, recovering the data of a poisoned one
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// ### Board
///
/// One bus controller. Blocking calls honour the deadline armed on
/// [`BoardState::watchdog`]; callers hold [`BoardState::lock_bus`] around any
/// bus affecting call. [`Board::abort`] is the exception: it is meant to be
/// called from another thread while a transfer is in flight.
///
pub trait Board: Send + Sync + 'static {
    /// Human readable board name, used in logs
    fn name(&self) -> &str;

    fn state(&self) -> &BoardState;

    /// ### Attach
    ///
    /// Bring the adapter from power-up into a usable state, using the
    /// board configuration held in [`BoardState::config`].
    ///
    fn attach(&self) -> Result<()>;

    /// Put the adapter back to an idle state
    fn detach(&self) -> Result<()>;

    /// ### Abort
    ///
    /// Cancel the transfer in flight, if any. Returns once the adapter has
    /// acknowledged the flush or the acknowledgement wait has expired.
    ///
    fn abort(&self) -> Result<()>;

    /// ### Read
    ///
    /// Read data bytes into `buf` as a listener.
    ///
    /// #### Returns
    /// The number of bytes read and whether the read ended on EOI or EOS.
    ///
    fn read(&self, buf: &mut [u8]) -> Result<ReadOutcome>;

    /// Write data bytes as a talker, asserting EOI with the last byte when `send_eoi`
    fn write(&self, data: &[u8], send_eoi: bool) -> Result<usize>;

    /// Write command bytes with ATN asserted
    fn command(&self, data: &[u8]) -> Result<usize>;

    /// ### Take Control
    ///
    /// Assert ATN. A synchronous take control waits for the current
    /// handshake to finish first.
    ///
    fn take_control(&self, synchronous: bool) -> Result<()>;

    /// Release ATN
    fn go_to_standby(&self) -> Result<()>;

    fn request_system_control(&self, request: bool) -> Result<()>;

    fn interface_clear(&self, assert: bool) -> Result<()>;

    fn remote_enable(&self, enable: bool) -> Result<()>;

    /// ### Enable EOS
    ///
    /// Terminate reads on `eos`, comparing all 8 bits or only 7.
    ///
    fn enable_eos(&self, eos: u8, compare_8_bits: bool) -> Result<()>;

    fn disable_eos(&self);

    /// Configure the board's own parallel poll response
    fn parallel_poll_configure(&self, config: u8) -> Result<()>;

    /// Conduct a parallel poll, returns the byte read from the data lines
    fn parallel_poll(&self) -> Result<u8>;

    /// Set the individual status bit used in parallel poll responses
    fn parallel_poll_response(&self, ist: bool) -> Result<()>;

    fn line_status(&self) -> Result<LineStatus>;

    /// ### Update Status
    ///
    /// Refresh the hardware bits of the status word, clearing the bits of
    /// `clear`, and return it.
    ///
    fn update_status(&self, clear: Status) -> Result<Status>;

    fn primary_address(&self, pad: u8) -> Result<()>;

    fn secondary_address(&self, sad: Option<u8>) -> Result<()>;

    /// Set the status byte the board answers serial polls with
    fn serial_poll_response(&self, status_byte: u8) -> Result<()>;

    fn serial_poll_status(&self) -> Result<u8>;

    /// ### T1 Delay
    ///
    /// Program the source handshake T1 delay.
    ///
    /// #### Returns
    /// The delay actually programmed, in nanoseconds.
    ///
    fn t1_delay(&self, nanosec: u32) -> Result<u32>;

    fn return_to_local(&self) -> Result<()>;
}
