//! ## Autopoll
//!
//! Background thread serial polling the devices of a board whenever SRQ is
//! asserted, feeding their status queues.
//!

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{debug, warn};

use super::spoll::serial_poll_all;
use crate::board::Board;
use crate::constants::misc::AUTOPOLL_INTERVAL;
use crate::error::{Error, Result};
use crate::types::{LineStatus, Status};

#[derive(Debug)]
pub(crate) struct Autopoll {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Autopoll {
    pub fn spawn(board: Arc<dyn Board>) -> Result<Autopoll> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let stop = Arc::clone(&stop);
            std::thread::Builder::new()
                .name(format!("{}-autopoll", board.name()))
                .spawn(move || run(board.as_ref(), &stop))
                .map_err(|e| Error::Spawn(e.to_string()))?
        };
        Ok(Autopoll {
            stop,
            thread: Some(thread),
        })
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("autopoll thread panicked");
            }
        }
    }
}

impl Drop for Autopoll {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(board: &dyn Board, stop: &AtomicBool) {
    let state = board.state();
    let timeout = state.config().device_defaults.spoll_timeout.duration();
    debug!("{}: autopoll started", board.name());

    while !stop.load(Ordering::SeqCst) {
        let status = state.wait_for_change(AUTOPOLL_INTERVAL);
        if stop.load(Ordering::SeqCst) {
            break;
        }
        if !status.contains(Status::SRQI | Status::CIC) || state.stuck_srq() || !state.is_online() {
            continue;
        }

        let _bus = state.lock_bus();
        match serial_poll_all(board, timeout) {
            Ok(found) if found > 0 => debug!("{}: autopoll found {found} device(s)", board.name()),
            Ok(_) => {
                warn!("{}: SRQ asserted but no device requested service", board.name());
                state.set_stuck_srq(true);
            }
            Err(e) => {
                warn!("{}: SRQ asserted and the autopoll sweep failed: {e}", board.name());
                state.set_stuck_srq(true);
            }
        }
        match board.line_status() {
            Ok(lines) if !lines.contains(LineStatus::BUS_SRQ) => {
                state.merge_status(Status::empty(), Status::SRQI);
            }
            Ok(_) => {}
            Err(e) => debug!("{}: line status failed: {e}", board.name()),
        }
    }
    debug!("{}: autopoll stopped", board.name());
}
