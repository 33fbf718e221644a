//! ## Asynchronous I/O
//!
//! One background operation per session. The worker takes the board's bus
//! lock itself, so the launching thread never blocks on the bus. The buffer
//! belongs to the operation and is handed back on [`Gpib::wait_async`].
//!

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::{debug, warn};

use super::descriptor::{IoGuard, Session};
use super::io::{command_locked, read_locked, write_locked};
use super::wait::session_status;
use super::Gpib;
use crate::board::{lock, Board};
use crate::error::{Error, Result};
use crate::types::{Handle, Outcome, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Waiting for the bus lock
    Pending,
    /// Handed to the transport
    Submitted,
    Done,
    /// Stopped before it reached the bus
    Aborted,
}

#[derive(Debug)]
enum Request {
    Read(usize),
    Write(Vec<u8>),
    Command(Vec<u8>),
}

/// ### Async Completion
///
/// Result of a finished asynchronous operation. `data` holds the bytes read
/// by a read operation and is empty otherwise.
///
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AsyncCompletion {
    pub outcome: Outcome,
    pub data: Vec<u8>,
}

#[derive(Debug)]
pub(crate) struct AsyncOperation {
    phase: Arc<Mutex<Phase>>,
    thread: Option<JoinHandle<AsyncCompletion>>,
    completion: Option<AsyncCompletion>,
}

impl AsyncOperation {
    /// Block until the worker exits, returns the stored completion
    fn join(&mut self) -> AsyncCompletion {
        if let Some(thread) = self.thread.take() {
            let completion = thread.join().unwrap_or_else(|_| {
                warn!("asynchronous worker panicked");
                AsyncCompletion {
                    outcome: Outcome::from_result(Status::CMPL, &Err(Error::Aborted)),
                    data: Vec::new(),
                }
            });
            self.completion = Some(completion);
        }
        self.completion.clone().unwrap_or_default()
    }
}

fn run(
    board: Arc<dyn Board>,
    session: Arc<Session>,
    phase: Arc<Mutex<Phase>>,
    request: Request,
    io: IoGuard,
) -> AsyncCompletion {
    let (result, data) = {
        let _bus = board.state().lock_bus();
        let go = {
            let mut phase = lock(&phase);
            if *phase == Phase::Pending {
                board.state().clear_abort();
                *phase = Phase::Submitted;
                true
            } else {
                false
            }
        };
        let finished = if go {
            match request {
                Request::Read(len) => {
                    let mut buf = vec![0u8; len];
                    let result = read_locked(board.as_ref(), &session, &mut buf);
                    buf.truncate(*result.as_ref().unwrap_or(&0));
                    (result, buf)
                }
                Request::Write(data) => (write_locked(board.as_ref(), &session, &data), Vec::new()),
                Request::Command(data) => {
                    (command_locked(board.as_ref(), &session, &data), Vec::new())
                }
            }
        } else {
            debug!("{:?}: asynchronous operation stopped before submission", session.handle());
            (Err(Error::Aborted), Vec::new())
        };

        // still under the bus lock, so a late stop cannot reach the next operation
        let mut phase = lock(&phase);
        if *phase == Phase::Submitted {
            *phase = Phase::Done;
            board.state().clear_abort();
        }
        finished
    };

    session.record(&result);
    drop(io);
    let outcome = Outcome::from_result(session_status(board.as_ref(), &session), &result);
    board.state().notify();

    AsyncCompletion { outcome, data }
}

impl Gpib {
    fn launch(&self, handle: Handle, request: Request) -> Result<()> {
        let session = self.session(handle)?;
        let board = Arc::clone(self.board_of(&session)?);
        if !board.state().is_online() {
            return Err(Error::Offline);
        }
        let io = session.begin_io()?;

        let mut aio = lock(&session.aio);
        // the previous operation released the session, so it has finished
        if let Some(mut previous) = aio.take() {
            *lock(&session.last_async) = Some(previous.join().outcome);
        }

        let phase = Arc::new(Mutex::new(Phase::Pending));
        let thread = {
            let session = Arc::clone(&session);
            let phase = Arc::clone(&phase);
            std::thread::Builder::new()
                .name(format!("gpib-aio-{}", handle.0))
                .spawn(move || run(board, session, phase, request, io))
                .map_err(|e| Error::Spawn(e.to_string()))?
        };

        *aio = Some(AsyncOperation {
            phase,
            thread: Some(thread),
            completion: None,
        });
        Ok(())
    }

    /// ### Read Async
    ///
    /// Start reading up to `len` bytes in the background. The data comes
    /// back with [`Gpib::wait_async`].
    ///
    /// #### Errors
    /// `IoInProgress` while another operation runs on the session.
    ///
    pub fn read_async(&self, handle: Handle, len: usize) -> Result<()> {
        self.launch(handle, Request::Read(len))
    }

    /// Start writing `data` in the background
    pub fn write_async(&self, handle: Handle, data: impl Into<Vec<u8>>) -> Result<()> {
        self.launch(handle, Request::Write(data.into()))
    }

    /// Start sending command bytes in the background, board sessions only
    pub fn command_async(&self, handle: Handle, data: impl Into<Vec<u8>>) -> Result<()> {
        self.launch(handle, Request::Command(data.into()))
    }

    /// ### Wait Async
    ///
    /// Block until the session's asynchronous operation finishes and take
    /// its completion.
    ///
    pub fn wait_async(&self, handle: Handle) -> Result<AsyncCompletion> {
        let session = self.session(handle)?;
        let mut operation = lock(&session.aio)
            .take()
            .ok_or(Error::InvalidArgument("no asynchronous operation"))?;
        let completion = operation.join();
        *lock(&session.last_async) = Some(completion.outcome.clone());
        Ok(completion)
    }

    /// ### Stop
    ///
    /// Abort the session's asynchronous operation. An operation still waiting
    /// for the bus never touches it; one already submitted is cancelled in
    /// the transport. Stopping a finished operation changes nothing and
    /// returns its stored outcome.
    ///
    pub fn stop(&self, handle: Handle) -> Result<Outcome> {
        let session = self.session(handle)?;
        let board = self.board_of(&session)?;
        Ok(self.stop_session(&session, board.as_ref()))
    }

    pub(crate) fn stop_session(&self, session: &Session, board: &dyn Board) -> Outcome {
        let mut aio = lock(&session.aio);
        let Some(operation) = aio.as_mut() else {
            return lock(&session.last_async)
                .clone()
                .unwrap_or_else(|| Outcome::from_result(session_status(board, session), &Ok(0)));
        };

        {
            let mut phase = lock(&operation.phase);
            match *phase {
                Phase::Pending => *phase = Phase::Aborted,
                Phase::Submitted => {
                    // the worker cannot finish while the phase is held
                    board.state().request_abort();
                    if let Err(e) = board.abort() {
                        warn!("{}: abort failed: {e}", board.name());
                    }
                }
                Phase::Done | Phase::Aborted => {}
            }
        }
        operation.join().outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::mock::MockBoard;
    use crate::session::tests::{manager, quiet};
    use crate::types::Timeout;
    use std::time::Duration;

    #[test]
    fn read_async_returns_the_data() {
        let (board, gpib) = manager(quiet());
        let dev = gpib.open_device(0, 5, -1).unwrap();
        board.queue_read(b"1.2345E+00\n", true);
        gpib.read_async(dev, 64).unwrap();

        let completion = gpib.wait_async(dev).unwrap();
        assert_eq!(completion.data, b"1.2345E+00\n");
        assert_eq!(completion.outcome.count, 11);
        assert!(completion.outcome.error.is_none());
        assert!(completion
            .outcome
            .status
            .contains(Status::CMPL | Status::END));
    }

    #[test]
    fn stop_after_completion_is_a_no_op() {
        let (board, gpib) = manager(quiet());
        let dev = gpib.open_device(0, 5, -1).unwrap();
        gpib.write_async(dev, b"*TRG".to_vec()).unwrap();
        gpib.wait(dev, Status::CMPL).unwrap();

        let first = gpib.stop(dev).unwrap();
        let second = gpib.stop(dev).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.count, 4);
        assert!(first.error.is_none());
        assert!(!board.bus().calls.contains(&"abort"));
    }

    #[test]
    fn blocked_read_is_exclusive_until_stopped() {
        let (board, gpib) = manager(quiet());
        let dev = gpib.open_device(0, 5, -1).unwrap();
        gpib.set_timeout(dev, Timeout::TNone).unwrap();
        gpib.read_async(dev, 16).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        assert!(!gpib.status(dev).unwrap().contains(Status::CMPL));
        assert_eq!(gpib.read_async(dev, 16).unwrap_err(), Error::IoInProgress);
        assert_eq!(gpib.write(dev, b"x").unwrap_err(), Error::IoInProgress);

        let outcome = gpib.stop(dev).unwrap();
        assert_eq!(outcome.error, Some(Error::Aborted));
        assert!(outcome.status.contains(Status::ERR));
        assert!(board.bus().calls.contains(&"abort"));

        assert_eq!(gpib.stop(dev).unwrap(), outcome);
        assert_eq!(gpib.write(dev, b"x").unwrap(), 1);
    }

    #[test]
    fn stop_between_transfers_cancels_the_rest() {
        let board = MockBoard::with_delay(quiet(), Duration::from_millis(50));
        let gpib = Gpib::new(vec![Arc::clone(&board) as Arc<dyn Board>]).unwrap();
        let dev = gpib.open_device(0, 5, -1).unwrap();
        gpib.set_timeout(dev, Timeout::TNone).unwrap();
        gpib.read_async(dev, 16).unwrap();
        while !board.wire_busy() {
            std::thread::sleep(Duration::from_millis(1));
        }

        // the addressing command is on the wire, nothing waits for the abort
        let outcome = gpib.stop(dev).unwrap();
        assert_eq!(outcome.error, Some(Error::Aborted));
        let calls = board.bus().calls.clone();
        assert!(calls.contains(&"abort"));
        assert!(!calls.contains(&"go_to_standby"));
        assert!(!board.state().abort_requested());

        assert_eq!(gpib.write(dev, b"x").unwrap(), 1);
    }

    #[test]
    fn pending_operation_never_reaches_the_bus() {
        let (board, gpib) = manager(quiet());
        let gpib = Arc::new(gpib);
        let dev = gpib.open_device(0, 5, -1).unwrap();
        let bus = board.state().lock_bus();
        gpib.write_async(dev, b"never".to_vec()).unwrap();

        let stopper = {
            let gpib = Arc::clone(&gpib);
            std::thread::spawn(move || gpib.stop(dev))
        };
        std::thread::sleep(Duration::from_millis(50));
        drop(bus);

        let outcome = stopper.join().unwrap().unwrap();
        assert_eq!(outcome.error, Some(Error::Aborted));
        assert!(board.bus().writes.is_empty());
        assert!(board.bus().commands.is_empty());
        assert!(!board.bus().calls.contains(&"abort"));
    }

    #[test]
    fn command_async_needs_a_board_session() {
        let (board, gpib) = manager(quiet());
        let brd = gpib.open_board(0).unwrap();
        gpib.command_async(brd, vec![0x3f]).unwrap();
        let completion = gpib.wait_async(brd).unwrap();
        assert_eq!(completion.outcome.count, 1);
        assert_eq!(board.bus().commands, vec![0x3f]);
        assert!(gpib.wait_async(brd).is_err());
    }
}
