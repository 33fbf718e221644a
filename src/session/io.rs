//! ## Session I/O
//!
//! Data reads and writes, and command bytes, for one session. The `_locked`
//! functions expect the caller to hold the board's bus lock and are shared
//! with the asynchronous workers.
//!

use log::trace;

use super::descriptor::Session;
use super::{listen_address, require_cic, Gpib};
use crate::board::Board;
use crate::config::DeviceSettings;
use crate::constants::bus_commands::{self, msa, mta};
use crate::error::{Error, Result};
use crate::types::{Address, EosFlags, Handle, Status};

/// Talk address followed by the secondary address, if any
fn talk_address(address: Address) -> Vec<u8> {
    let mut bytes = vec![mta(address.pad)];
    bytes.extend(address.sad.map(msa));
    bytes
}

fn board_address(board: &dyn Board) -> Address {
    let info = board.state().info();
    Address {
        pad: info.pad,
        sad: info.sad,
    }
}

/// Fail with `Aborted` once the running operation has been stopped
fn check_abort(board: &dyn Board) -> Result<()> {
    if board.state().abort_requested() {
        return Err(Error::Aborted);
    }
    Ok(())
}

fn configure_eos(board: &dyn Board, settings: &DeviceSettings) -> Result<()> {
    if settings.eos_flags.contains(EosFlags::REOS) {
        board.enable_eos(settings.eos, settings.eos_flags.contains(EosFlags::BIN))
    } else {
        board.disable_eos();
        Ok(())
    }
}

/// ### Read (locked)
///
/// Address the device as talker and the board as listener, then read up to
/// `buf.len()` bytes in chunks of the board buffer length.
///
pub(crate) fn read_locked(board: &dyn Board, session: &Session, buf: &mut [u8]) -> Result<usize> {
    let settings = session.settings();
    let _watchdog = board.state().watchdog.start(settings.device.timeout.duration());
    session.set_end(false);

    if !session.is_board() {
        require_cic(board)?;
        let mut bytes = vec![bus_commands::UNL];
        bytes.extend(listen_address(board_address(board)));
        bytes.extend(talk_address(settings.address));
        check_abort(board)?;
        board.command(&bytes)?;
        check_abort(board)?;
        board.go_to_standby()?;
    }
    configure_eos(board, &settings.device)?;

    let chunk = board.state().config().buffer_length.max(1);
    let mut count = 0;
    let mut end = false;
    while count < buf.len() && !end {
        let limit = buf.len().min(count + chunk);
        check_abort(board)?;
        let outcome = board.read(&mut buf[count..limit])?;
        count += outcome.count;
        end = outcome.end;
        if outcome.count == 0 {
            break;
        }
    }
    trace!("read {count} bytes (end: {end})");

    session.set_end(end);
    let end_bit = if end { Status::END } else { Status::empty() };
    board.state().merge_status(end_bit, Status::END);
    Ok(count)
}

/// ### Write (locked)
///
/// Address the device as listener and the board as talker, then write
/// `data` in chunks of the board buffer length. Only the last chunk may
/// carry EOI.
///
pub(crate) fn write_locked(board: &dyn Board, session: &Session, data: &[u8]) -> Result<usize> {
    let settings = session.settings();
    let _watchdog = board.state().watchdog.start(settings.device.timeout.duration());

    if !session.is_board() {
        require_cic(board)?;
        let mut bytes = vec![bus_commands::UNL];
        bytes.extend(listen_address(settings.address));
        bytes.extend(talk_address(board_address(board)));
        check_abort(board)?;
        board.command(&bytes)?;
        check_abort(board)?;
        board.go_to_standby()?;
    }

    let chunk = board.state().config().buffer_length.max(1);
    let mut count = 0;
    for piece in data.chunks(chunk) {
        let last = count + piece.len() == data.len();
        let eos_hit = settings.device.eos_flags.contains(EosFlags::XEOS)
            && piece.last() == Some(&settings.device.eos);
        let send_eoi = last && (settings.device.send_eoi || eos_hit);
        check_abort(board)?;
        let written = board.write(piece, send_eoi)?;
        count += written;
        if written < piece.len() {
            break;
        }
    }
    trace!("wrote {count} of {} bytes", data.len());

    Ok(count)
}

/// Send command bytes with ATN asserted, board sessions only
pub(crate) fn command_locked(board: &dyn Board, session: &Session, data: &[u8]) -> Result<usize> {
    if !session.is_board() {
        return Err(Error::InvalidArgument("operation needs a board session"));
    }
    require_cic(board)?;
    let _watchdog = board
        .state()
        .watchdog
        .start(session.settings().device.timeout.duration());
    check_abort(board)?;
    board.command(data)
}

impl Gpib {
    /// ### Read
    ///
    /// Read into `buf`, returns the number of bytes read. The session's END
    /// bit tells whether the read stopped on EOI or EOS.
    ///
    pub fn read(&self, handle: Handle, buf: &mut [u8]) -> Result<usize> {
        self.with_bus(handle, |session, board| read_locked(board, session, buf))
    }

    /// Read up to `len` bytes into a new vector
    pub fn read_to_vec(&self, handle: Handle, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let count = self.read(handle, &mut buf)?;
        buf.truncate(count);
        Ok(buf)
    }

    /// ### Write
    ///
    /// Write `data`, returns the number of bytes the adapter accepted.
    ///
    pub fn write(&self, handle: Handle, data: &[u8]) -> Result<usize> {
        self.with_bus(handle, |session, board| write_locked(board, session, data))
    }

    /// Send raw command bytes from a board session
    pub fn command(&self, handle: Handle, data: &[u8]) -> Result<usize> {
        self.with_bus(handle, |session, board| command_locked(board, session, data))
    }
}
