//! ## Wait
//!
//! Session status words and blocking on a combination of status bits.
//!

use std::time::Instant;

use log::debug;

use super::descriptor::Session;
use super::Gpib;
use crate::board::Board;
use crate::constants::misc::WAIT_POLL_INTERVAL;
use crate::error::{Error, Result};
use crate::types::{Handle, Status};

/// ### Session Status
///
/// Status word as seen by one session. Board sessions see the board bits,
/// device sessions only the bits they own.
///
pub(crate) fn session_status(board: &dyn Board, session: &Session) -> Status {
    let mut status = if session.is_board() {
        board.state().status() - Status::SESSION_BITS
    } else {
        Status::empty()
    };
    if !session.io_in_progress() {
        status |= Status::CMPL;
    }
    if session.end() {
        status |= Status::END;
    }
    if session.timed_out() {
        status |= Status::TIMO;
    }
    if !session.is_board() && board.state().queues().num_status_bytes(&session.address()) > 0 {
        status |= Status::RQS;
    }
    status
}

impl Gpib {
    /// ### Status
    ///
    /// Current status word of the session. For board sessions the hardware
    /// bits are refreshed first.
    ///
    pub fn status(&self, handle: Handle) -> Result<Status> {
        let session = self.session(handle)?;
        let board = self.board_of(&session)?;
        if session.is_board() && board.state().is_online() {
            if let Err(e) = board.update_status(Status::empty()) {
                debug!("{}: status refresh failed: {e}", board.name());
            }
        }
        Ok(session_status(board.as_ref(), &session))
    }

    /// ### Wait
    ///
    /// Block until any bit of `mask` is set in the session status. When
    /// `mask` contains `TIMO` the wait is bounded by the session timeout and
    /// returns with `TIMO` set on expiry. An empty mask returns at once.
    ///
    /// #### Errors
    /// `StuckServiceRequest` while waiting on `RQS` or `SRQI` with SRQ stuck.
    ///
    pub fn wait(&self, handle: Handle, mask: Status) -> Result<Status> {
        let session = self.session(handle)?;
        let board = self.board_of(&session)?;
        let mask = if session.is_board() {
            mask
        } else {
            mask & (Status::DEVICE_MASK | Status::TIMO)
        };
        let deadline = if mask.contains(Status::TIMO) {
            session
                .settings()
                .device
                .timeout
                .duration()
                .map(|t| Instant::now() + t)
        } else {
            None
        };

        loop {
            let status = self.status(handle)?;
            if mask.is_empty() || status.intersects(mask - Status::TIMO) {
                return Ok(status);
            }
            if board.state().stuck_srq() && mask.intersects(Status::RQS | Status::SRQI) {
                return Err(Error::StuckServiceRequest);
            }
            let pause = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(status | Status::TIMO);
                    }
                    (deadline - now).min(WAIT_POLL_INTERVAL)
                }
                None => WAIT_POLL_INTERVAL,
            };
            board.state().wait_for_change(pause);
        }
    }
}
