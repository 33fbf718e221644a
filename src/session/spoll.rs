//! ## Serial Poll
//!
//! Serial poll orchestration: one device, or every open address on a board
//! within a single timeout budget. Callers hold the bus lock.
//!

use std::time::Duration;

use log::debug;

use super::{listen_address, require_cic, Gpib};
use crate::board::Board;
use crate::constants::bus_commands::{self, msa, mta};
use crate::constants::misc::RQS_BIT;
use crate::error::{Error, Result};
use crate::types::{Address, Handle};

/// Unlisten, make the board listener and enable serial poll mode
pub(crate) fn setup_serial_poll(board: &dyn Board) -> Result<()> {
    let info = board.state().info();
    let mut bytes = vec![bus_commands::UNL];
    bytes.extend(listen_address(Address {
        pad: info.pad,
        sad: info.sad,
    }));
    bytes.push(bus_commands::SPE);
    board.command(&bytes)?;
    Ok(())
}

/// ### Serial Poll Single
///
/// Address one device as talker and read its status byte. ATN is taken
/// back whether or not the read succeeded.
///
pub(crate) fn serial_poll_single(board: &dyn Board, address: Address) -> Result<u8> {
    let mut bytes = vec![mta(address.pad)];
    bytes.extend(address.sad.map(msa));
    board.command(&bytes)?;
    board.go_to_standby()?;

    let mut byte = [0u8; 1];
    let read = board.read(&mut byte);
    let retake = board.take_control(true);
    let outcome = read?;
    retake?;
    if outcome.count != 1 {
        return Err(Error::BusRead);
    }
    Ok(byte[0])
}

/// Disable serial poll mode and untalk
pub(crate) fn cleanup_serial_poll(board: &dyn Board) -> Result<()> {
    board.command(&[bus_commands::SPD, bus_commands::UNT])?;
    Ok(())
}

/// Run `poll` between setup and cleanup. The cleanup gets a fresh budget
/// since `poll` may have spent the whole of it.
fn in_serial_poll_mode<T>(
    board: &dyn Board,
    timeout: Option<Duration>,
    poll: impl FnOnce() -> Result<T>,
) -> Result<T> {
    let watchdog = &board.state().watchdog;
    let _guard = watchdog.start(timeout);
    let result = setup_serial_poll(board).and_then(|()| poll());
    watchdog.arm(timeout);
    let cleanup = cleanup_serial_poll(board);
    let value = result?;
    cleanup?;
    Ok(value)
}

/// Serial poll the device at `address`
pub(crate) fn serial_poll_device(
    board: &dyn Board,
    address: Address,
    timeout: Option<Duration>,
) -> Result<u8> {
    require_cic(board)?;
    in_serial_poll_mode(board, timeout, || serial_poll_single(board, address))
}

/// ### Serial Poll All
///
/// Poll every address with an open session. Bytes with RQS set go to that
/// address's status queue. Every poll gets the whole `timeout`, so a device
/// that does not answer costs one budget and the sweep moves on to the next.
///
/// #### Returns
/// The number of devices found requesting service, or the first failure when
/// none was found.
///
pub(crate) fn serial_poll_all(board: &dyn Board, timeout: Option<Duration>) -> Result<usize> {
    require_cic(board)?;
    let addresses = board.state().queues().open_addresses();
    if addresses.is_empty() {
        return Ok(0);
    }

    let watchdog = &board.state().watchdog;
    let mut found = 0;
    let mut failure = None;
    let sweep = in_serial_poll_mode(board, timeout, || {
        for address in &addresses {
            watchdog.arm(timeout);
            match serial_poll_single(board, *address) {
                Ok(byte) if byte & RQS_BIT != 0 => {
                    debug!("{}: device {address} requested service with 0x{byte:02x}", board.name());
                    board.state().queues().push_status_byte(*address, byte);
                    found += 1;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("{}: serial poll of device {address} failed: {e}", board.name());
                    failure.get_or_insert(e);
                }
            }
        }
        Ok(())
    });
    if found > 0 {
        board.state().notify();
    }

    match (sweep, failure) {
        (Err(e), _) | (Ok(()), Some(e)) if found == 0 => Err(e),
        _ => Ok(found),
    }
}

impl Gpib {
    /// ### Serial Poll
    ///
    /// Return the oldest status byte queued by autopoll for the device, or
    /// poll it live when its queue is empty.
    ///
    /// #### Errors
    /// - `LostStatusByte` once after the queue overflowed
    /// - `StuckServiceRequest` while autopoll reports SRQ stuck
    ///
    pub fn serial_poll(&self, handle: Handle) -> Result<u8> {
        self.with_device_bus(handle, |session, board| {
            let address = session.address();
            if let Some(byte) = board.state().queues().pop_status_byte(&address)? {
                return Ok(byte);
            }
            if board.state().stuck_srq() {
                return Err(Error::StuckServiceRequest);
            }
            let timeout = session.settings().device.spoll_timeout.duration();
            serial_poll_device(board, address, timeout)
        })
    }

    /// Number of status bytes queued for the device
    pub fn spoll_bytes(&self, handle: Handle) -> Result<usize> {
        let session = self.session(handle)?;
        let board = self.board_of(&session)?;
        Ok(board.state().queues().num_status_bytes(&session.address()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BoardConfig;
    use crate::session::tests::{manager, quiet};
    use crate::types::{Status, Timeout};

    #[test]
    fn queued_bytes_come_first() {
        let (board, gpib) = manager(quiet());
        let dev = gpib.open_device(0, 5, -1).unwrap();
        let address = Address::new(5, -1).unwrap();
        board.state().queues().push_status_byte(address, 0x42);
        assert_eq!(gpib.spoll_bytes(dev).unwrap(), 1);

        assert_eq!(gpib.serial_poll(dev).unwrap(), 0x42);
        assert!(board.bus().commands.is_empty());

        board.bus().spoll.entry(5).or_default().push_back(0x10);
        assert_eq!(gpib.serial_poll(dev).unwrap(), 0x10);
        assert_eq!(
            board.bus().commands,
            vec![
                bus_commands::UNL,
                0x20,
                bus_commands::SPE,
                0x45,
                bus_commands::SPD,
                bus_commands::UNT
            ]
        );
    }

    #[test]
    fn overflow_is_reported_once() {
        let (board, gpib) = manager(BoardConfig {
            status_queue_capacity: 2,
            ..quiet()
        });
        let dev = gpib.open_device(0, 5, -1).unwrap();
        let address = Address::new(5, -1).unwrap();
        for byte in [0x41, 0x42, 0x43] {
            board.state().queues().push_status_byte(address, byte);
        }
        assert_eq!(gpib.serial_poll(dev).unwrap_err(), Error::LostStatusByte);
        assert_eq!(gpib.serial_poll(dev).unwrap(), 0x42);
        assert_eq!(gpib.serial_poll(dev).unwrap(), 0x43);
    }

    #[test]
    fn silent_device_times_out_and_poll_mode_is_left() {
        let (board, gpib) = manager(quiet());
        let dev = gpib.open_device(0, 7, -1).unwrap();
        gpib.set_spoll_timeout(dev, Timeout::T10ms).unwrap();
        assert_eq!(gpib.serial_poll(dev).unwrap_err(), Error::Timeout);
        let commands = board.bus().commands.clone();
        assert_eq!(&commands[commands.len() - 2..], &[bus_commands::SPD, bus_commands::UNT]);
        assert!(board.bus().calls.contains(&"take_control"));
    }

    #[test]
    fn silent_device_does_not_hide_a_requester() {
        let (board, gpib) = manager(quiet());
        for pad in [3, 4] {
            gpib.open_device(0, pad, -1).unwrap();
        }
        board.raise_srq(4, 0x50);

        let _bus = board.state().lock_bus();
        assert_eq!(
            serial_poll_all(&*board, Some(Duration::from_millis(50))).unwrap(),
            1
        );
        let queues = board.state().queues();
        assert_eq!(queues.num_status_bytes(&Address::new(4, -1).unwrap()), 1);
        let commands = board.bus().commands.clone();
        assert_eq!(&commands[commands.len() - 2..], &[bus_commands::SPD, bus_commands::UNT]);
    }

    #[test]
    fn sweep_without_answers_reports_the_failure() {
        let (board, gpib) = manager(quiet());
        gpib.open_device(0, 3, -1).unwrap();
        let _bus = board.state().lock_bus();
        assert_eq!(
            serial_poll_all(&*board, Some(Duration::from_millis(10))).unwrap_err(),
            Error::Timeout
        );
    }

    #[test]
    fn sweep_queues_requesting_devices() {
        let (board, gpib) = manager(quiet());
        for pad in [3, 4] {
            gpib.open_device(0, pad, -1).unwrap();
        }
        board.raise_srq(4, 0x50);
        board.bus().spoll.entry(3).or_default().push_back(0x00);

        let _bus = board.state().lock_bus();
        assert_eq!(
            serial_poll_all(&*board, Some(Duration::from_secs(1))).unwrap(),
            1
        );
        let queues = board.state().queues();
        assert_eq!(queues.num_status_bytes(&Address::new(4, -1).unwrap()), 1);
        assert_eq!(queues.num_status_bytes(&Address::new(3, -1).unwrap()), 0);
        assert!(!board.state().status().contains(Status::SRQI));
    }
}
