//! ## Session Manager
//!
//! [`Gpib`] owns the boards and the descriptor table, and exposes every bus
//! operation by session handle. Synchronous calls take the board's bus lock
//! on the calling thread; asynchronous ones hand it to a worker
//! thread. One autopoll thread per board keeps the status queues fed.
//!

mod aio;
mod autopoll;
mod descriptor;
mod io;
mod spoll;
mod wait;

use std::sync::{Arc, Mutex};

use log::{debug, info, warn};

pub use aio::AsyncCompletion;
pub use descriptor::SessionSettings;

use autopoll::Autopoll;
use descriptor::{Descriptors, Session};

use crate::board::{lock, Board};
use crate::config::DeviceSettings;
use crate::constants::bus_commands::{self, mla, msa, mta};
use crate::constants::misc::{IFC_PULSE_DURATION, LISTENER_SETTLE};
use crate::error::{Error, Result};
use crate::types::{Address, BoardInfo, EosFlags, Handle, LineStatus, Outcome, Status, Timeout};

struct BoardSlot {
    board: Arc<dyn Board>,
    autopoll: Mutex<Option<Autopoll>>,
}

/// ### Gpib
///
/// The session manager. Every call takes a [`Handle`] returned by
/// [`Gpib::open_board`] or [`Gpib::open_device`].
///
pub struct Gpib {
    boards: Vec<BoardSlot>,
    descriptors: Mutex<Descriptors>,
}

impl std::fmt::Debug for Gpib {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gpib")
            .field(
                "boards",
                &self.boards.iter().map(|s| s.board.name()).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

/// Fail unless the board is controller in charge
pub(crate) fn require_cic(board: &dyn Board) -> Result<()> {
    if board.state().status().contains(Status::CIC) {
        Ok(())
    } else {
        Err(Error::NotControllerInCharge)
    }
}

/// Listen address of a device followed by its secondary address, if any
fn listen_address(address: Address) -> Vec<u8> {
    let mut bytes = vec![mla(address.pad)];
    bytes.extend(address.sad.map(msa));
    bytes
}

impl Gpib {
    /// ### New
    ///
    /// Attach every board, make the system controllers controller in charge
    /// and start autopolling where configured.
    ///
    /// #### Arguments
    /// - `boards` -> the boards, indexed in order
    ///
    pub fn new(boards: Vec<Arc<dyn Board>>) -> Result<Gpib> {
        // dropping a partly built manager detaches the boards already online
        let mut gpib = Gpib {
            boards: Vec::with_capacity(boards.len()),
            descriptors: Mutex::new(Descriptors::default()),
        };
        for board in boards {
            let autopoll = match board.attach().and_then(|()| bring_online(&board)) {
                Ok(autopoll) => autopoll,
                Err(e) => {
                    warn!("{}: failed to come online: {e}", board.name());
                    if let Err(e) = board.detach() {
                        warn!("{}: detach failed: {e}", board.name());
                    }
                    return Err(e);
                }
            };
            info!("{} online", board.name());
            gpib.boards.push(BoardSlot {
                board,
                autopoll: Mutex::new(autopoll),
            });
        }
        Ok(gpib)
    }

    fn slot(&self, index: usize) -> Result<&BoardSlot> {
        self.boards.get(index).ok_or(Error::NonexistentBoard)
    }

    pub(crate) fn session(&self, handle: Handle) -> Result<Arc<Session>> {
        lock(&self.descriptors).get(handle)
    }

    pub(crate) fn board_of(&self, session: &Session) -> Result<&Arc<dyn Board>> {
        Ok(&self.slot(session.board_index())?.board)
    }

    /// ### With Bus
    ///
    /// Run `f` with the session marked busy and the board's bus lock held.
    /// Records whether the call timed out.
    ///
    pub(crate) fn with_bus<T>(
        &self,
        handle: Handle,
        f: impl FnOnce(&Session, &dyn Board) -> Result<T>,
    ) -> Result<T> {
        let session = self.session(handle)?;
        let board = self.board_of(&session)?;
        if !board.state().is_online() {
            return Err(Error::Offline);
        }
        let _io = session.begin_io()?;
        let result = {
            let _bus = board.state().lock_bus();
            f(&session, board.as_ref())
        };
        session.record(&result);
        result
    }

    /// Like [`Gpib::with_bus`], restricted to board sessions
    fn with_board_bus<T>(
        &self,
        handle: Handle,
        f: impl FnOnce(&Session, &dyn Board) -> Result<T>,
    ) -> Result<T> {
        self.with_bus(handle, |session, board| {
            if !session.is_board() {
                return Err(Error::InvalidArgument("operation needs a board session"));
            }
            f(session, board)
        })
    }

    /// Like [`Gpib::with_bus`], restricted to device sessions
    fn with_device_bus<T>(
        &self,
        handle: Handle,
        f: impl FnOnce(&Session, &dyn Board) -> Result<T>,
    ) -> Result<T> {
        self.with_bus(handle, |session, board| {
            if session.is_board() {
                return Err(Error::InvalidArgument("operation needs a device session"));
            }
            f(session, board)
        })
    }

    // ==========
    // SESSIONS
    // ==========

    /// ### Open Board
    ///
    /// Open a session on the interface board itself.
    ///
    pub fn open_board(&self, index: usize) -> Result<Handle> {
        let slot = self.slot(index)?;
        let info = slot.board.state().info();
        let settings = SessionSettings {
            address: Address {
                pad: info.pad,
                sad: info.sad,
            },
            device: slot.board.state().config().device_defaults.clone(),
        };
        let session = lock(&self.descriptors).insert(|h| Session::new(h, index, true, settings))?;
        debug!("opened board session {:?} on {}", session.handle(), slot.board.name());
        Ok(session.handle())
    }

    /// ### Open Device
    ///
    /// Open a session on the device at `pad`/`sad` with the board's default
    /// settings. A negative `sad` disables the secondary address.
    ///
    pub fn open_device(&self, index: usize, pad: i32, sad: i32) -> Result<Handle> {
        let defaults = self.slot(index)?.board.state().config().device_defaults.clone();
        self.open_device_with(index, Address::new(pad, sad)?, defaults)
    }

    /// Open a device session with explicit settings
    pub fn open_device_with(
        &self,
        index: usize,
        address: Address,
        device: DeviceSettings,
    ) -> Result<Handle> {
        let board = &self.slot(index)?.board;
        let settings = SessionSettings { address, device };
        let session = lock(&self.descriptors).insert(|h| Session::new(h, index, false, settings))?;
        board.state().queues().increment_open_count(address);
        debug!("opened {:?} for device {address}", session.handle());
        Ok(session.handle())
    }

    /// ### Close
    ///
    /// Abort any asynchronous operation and release the handle.
    ///
    pub fn close(&self, handle: Handle) -> Result<()> {
        let session = lock(&self.descriptors).remove(handle)?;
        self.release(&session)
    }

    fn release(&self, session: &Session) -> Result<()> {
        let board = self.board_of(session)?;
        self.stop_session(session, board.as_ref());
        if !session.is_board() {
            board
                .state()
                .queues()
                .decrement_open_count(&session.address())?;
        }
        Ok(())
    }

    /// ### Online
    ///
    /// Taking a session offline closes it. Bringing it online restores the
    /// settings it was opened with, re-attaching the board if needed.
    ///
    pub fn online(&self, handle: Handle, online: bool) -> Result<()> {
        if !online {
            return self.close(handle);
        }
        let session = self.session(handle)?;
        let board = self.board_of(&session)?;
        if !board.state().is_online() {
            board.attach()?;
        }

        let previous = session.address();
        let settings = session.restore_defaults();
        if session.is_board() {
            let _bus = board.state().lock_bus();
            board.primary_address(settings.address.pad)?;
            board.secondary_address(settings.address.sad)?;
        } else if previous != settings.address {
            let mut queues = board.state().queues();
            queues.decrement_open_count(&previous)?;
            queues.increment_open_count(settings.address);
        }

        if settings.device.local_lockout {
            self.with_bus(handle, |_, board| {
                require_cic(board)?;
                board.command(&[bus_commands::LLO]).map(drop)
            })?;
        }
        Ok(())
    }

    // ==========
    // DEVICE COMMANDS
    // ==========

    /// Address the session's device as listener then send `message`
    fn addressed_command(&self, handle: Handle, message: &[u8]) -> Result<()> {
        self.with_device_bus(handle, |session, board| {
            require_cic(board)?;
            let settings = session.settings();
            let _watchdog = board.state().watchdog.start(settings.device.timeout.duration());
            let mut bytes = vec![bus_commands::UNL];
            bytes.extend(listen_address(settings.address));
            bytes.extend_from_slice(message);
            board.command(&bytes)?;
            Ok(())
        })
    }

    /// Send group execute trigger to the device
    pub fn trigger(&self, handle: Handle) -> Result<()> {
        self.addressed_command(handle, &[bus_commands::GET])
    }

    /// Send selected device clear to the device
    pub fn clear(&self, handle: Handle) -> Result<()> {
        self.addressed_command(handle, &[bus_commands::SDC])
    }

    /// ### Local
    ///
    /// Return a device to local control with GTL, or release the board's
    /// own remote state for a board session.
    ///
    pub fn local(&self, handle: Handle) -> Result<()> {
        if self.session(handle)?.is_board() {
            self.with_board_bus(handle, |_, board| board.return_to_local())
        } else {
            self.addressed_command(handle, &[bus_commands::GTL])
        }
    }

    /// Send local lockout to every device on the bus
    pub fn local_lockout(&self, handle: Handle) -> Result<()> {
        self.with_bus(handle, |session, board| {
            require_cic(board)?;
            let _watchdog = board
                .state()
                .watchdog
                .start(session.settings().device.timeout.duration());
            board.command(&[bus_commands::LLO]).map(drop)
        })
    }

    // ==========
    // BOARD CONTROL
    // ==========

    /// ### Interface Clear
    ///
    /// Pulse IFC. Only the system controller may do this; it becomes
    /// controller in charge.
    ///
    pub fn interface_clear(&self, handle: Handle) -> Result<()> {
        self.with_board_bus(handle, |_, board| {
            if !board.state().info().is_system_controller {
                return Err(Error::NotSystemController);
            }
            pulse_interface_clear(board)
        })
    }

    /// Assert or release REN, system controller only
    pub fn remote_enable(&self, handle: Handle, enable: bool) -> Result<()> {
        self.with_board_bus(handle, |_, board| {
            if !board.state().info().is_system_controller {
                return Err(Error::NotSystemController);
            }
            board.remote_enable(enable)
        })
    }

    /// Assert ATN, waiting for the current handshake when `synchronous`
    pub fn take_control(&self, handle: Handle, synchronous: bool) -> Result<()> {
        self.with_board_bus(handle, |_, board| {
            require_cic(board)?;
            board.take_control(synchronous)
        })
    }

    /// Release ATN
    pub fn go_to_standby(&self, handle: Handle) -> Result<()> {
        self.with_board_bus(handle, |_, board| {
            require_cic(board)?;
            board.go_to_standby()
        })
    }

    /// ### Pass Control
    ///
    /// Make the session's device controller in charge: address it as talker,
    /// send TCT, then release ATN. The board stops being controller in
    /// charge.
    ///
    pub fn pass_control(&self, handle: Handle) -> Result<()> {
        self.with_device_bus(handle, |session, board| {
            require_cic(board)?;
            let settings = session.settings();
            let _watchdog = board.state().watchdog.start(settings.device.timeout.duration());
            let mut bytes = vec![bus_commands::UNT, mta(settings.address.pad)];
            bytes.extend(settings.address.sad.map(msa));
            bytes.push(bus_commands::TCT);
            board.command(&bytes)?;
            board.go_to_standby()?;
            board.state().merge_status(Status::empty(), Status::CIC | Status::ATN);
            info!("{}: passed control to {}", board.name(), settings.address);
            Ok(())
        })
    }

    /// ### Listener Present
    ///
    /// Address `pad`/`sad` as the only listener, release ATN and report
    /// whether a device answers by holding NDAC.
    ///
    /// #### Arguments
    /// - `handle` -> a board session
    /// - `pad` -> primary address to probe
    /// - `sad` -> secondary address, negative for none
    ///
    pub fn listener_present(&self, handle: Handle, pad: i32, sad: i32) -> Result<bool> {
        let address = Address::new(pad, sad)?;
        self.with_board_bus(handle, |session, board| {
            require_cic(board)?;
            let info = board.state().info();
            let _watchdog = board
                .state()
                .watchdog
                .start(session.settings().device.timeout.duration());
            let mut bytes = vec![bus_commands::UNT, bus_commands::UNL, mta(info.pad)];
            bytes.extend(info.sad.map(msa));
            bytes.extend(listen_address(address));
            board.command(&bytes)?;

            // with ATN released only the addressed listener holds NDAC
            board.go_to_standby()?;
            std::thread::sleep(LISTENER_SETTLE);
            let lines = board.line_status();
            board.take_control(true)?;
            board.command(&[bus_commands::UNL])?;
            let lines = lines?;
            if !lines.contains(LineStatus::VALID_NDAC) {
                return Err(Error::Unsupported);
            }
            Ok(lines.contains(LineStatus::BUS_NDAC))
        })
    }

    /// State of the bus management lines
    pub fn lines(&self, handle: Handle) -> Result<LineStatus> {
        let session = self.session(handle)?;
        if !session.is_board() {
            return Err(Error::InvalidArgument("operation needs a board session"));
        }
        self.board_of(&session)?.line_status()
    }

    /// ### Parallel Poll
    ///
    /// Conduct a parallel poll, bounded by the session's parallel poll timeout.
    ///
    pub fn parallel_poll(&self, handle: Handle) -> Result<u8> {
        self.with_bus(handle, |session, board| {
            require_cic(board)?;
            let _watchdog = board
                .state()
                .watchdog
                .start(session.settings().device.ppoll_timeout.duration());
            board.parallel_poll()
        })
    }

    /// ### Parallel Poll Configure
    ///
    /// For a device session send PPC followed by the PPE byte `config`, or
    /// PPD when `config` is zero. For a board session configure the board's
    /// own response, which needs local parallel poll configuration.
    ///
    pub fn parallel_poll_configure(&self, handle: Handle, config: u8) -> Result<()> {
        if config != 0 && !(bus_commands::PPE..bus_commands::PPD).contains(&config) {
            return Err(Error::InvalidArgument("parallel poll configuration"));
        }
        let session = self.session(handle)?;
        if session.is_board() {
            self.with_board_bus(handle, |session, board| {
                if !session.settings().device.local_ppc {
                    return Err(Error::Unsupported);
                }
                board.parallel_poll_configure(config)
            })?;
        } else {
            let enable = if config == 0 { bus_commands::PPD } else { config };
            self.addressed_command(handle, &[bus_commands::PPC, enable])?;
        }
        session.update_settings(|s| s.device.ppoll_config = config);
        Ok(())
    }

    /// Allow a board session to configure the board's parallel poll response
    pub fn set_local_ppc(&self, handle: Handle, enable: bool) -> Result<()> {
        self.session(handle)?
            .update_settings(|s| s.device.local_ppc = enable);
        Ok(())
    }

    /// Set the individual status bit the board answers parallel polls with
    pub fn set_ist(&self, handle: Handle, ist: bool) -> Result<()> {
        self.with_board_bus(handle, |_, board| board.parallel_poll_response(ist))
    }

    /// Set the board's serial poll status byte, requesting service when it carries RQS
    pub fn request_service(&self, handle: Handle, status_byte: u8) -> Result<()> {
        self.with_board_bus(handle, |_, board| board.serial_poll_response(status_byte))
    }

    pub fn request_system_control(&self, handle: Handle, request: bool) -> Result<()> {
        self.with_board_bus(handle, |_, board| board.request_system_control(request))
    }

    /// Program the T1 delay, returns the delay actually used in nanoseconds
    pub fn set_t1_delay(&self, handle: Handle, nanosec: u32) -> Result<u32> {
        self.with_board_bus(handle, |_, board| board.t1_delay(nanosec))
    }

    /// ### Set Autopoll
    ///
    /// Start or stop the board's autopoll thread. Enabling it also clears a
    /// stuck service request.
    ///
    pub fn set_autopoll(&self, handle: Handle, enable: bool) -> Result<()> {
        let session = self.session(handle)?;
        let slot = self.slot(session.board_index())?;
        let state = slot.board.state();
        let mut autopoll = lock(&slot.autopoll);
        if enable {
            state.set_stuck_srq(false);
            if autopoll.is_none() {
                *autopoll = Some(Autopoll::spawn(Arc::clone(&slot.board))?);
            }
        } else if let Some(mut running) = autopoll.take() {
            running.stop();
        }
        state.update_info(|info| info.autopolling = enable);
        Ok(())
    }

    // ==========
    // SETTINGS
    // ==========

    /// ### Set Primary Address
    ///
    /// Re-targets a device session, moving its status queue reference, or
    /// re-addresses the board for a board session.
    ///
    pub fn set_pad(&self, handle: Handle, pad: i32) -> Result<()> {
        let session = self.session(handle)?;
        let address = Address::new(pad, session.address().sad_raw())?;
        self.readdress(&session, address)
    }

    /// Same as [`Gpib::set_pad`] for the secondary address, negative disables it
    pub fn set_sad(&self, handle: Handle, sad: i32) -> Result<()> {
        let session = self.session(handle)?;
        let address = Address::new(i32::from(session.address().pad), sad)?;
        self.readdress(&session, address)
    }

    fn readdress(&self, session: &Session, address: Address) -> Result<()> {
        let board = self.board_of(session)?;
        let previous = session.address();
        if session.is_board() {
            let _bus = board.state().lock_bus();
            board.primary_address(address.pad)?;
            board.secondary_address(address.sad)?;
        } else if previous != address {
            let mut queues = board.state().queues();
            queues.decrement_open_count(&previous)?;
            queues.increment_open_count(address);
        }
        session.update_settings(|s| s.address = address);
        Ok(())
    }

    pub fn set_timeout(&self, handle: Handle, timeout: Timeout) -> Result<()> {
        self.session(handle)?
            .update_settings(|s| s.device.timeout = timeout);
        Ok(())
    }

    pub fn set_spoll_timeout(&self, handle: Handle, timeout: Timeout) -> Result<()> {
        self.session(handle)?
            .update_settings(|s| s.device.spoll_timeout = timeout);
        Ok(())
    }

    pub fn set_ppoll_timeout(&self, handle: Handle, timeout: Timeout) -> Result<()> {
        self.session(handle)?
            .update_settings(|s| s.device.ppoll_timeout = timeout);
        Ok(())
    }

    /// Set the end-of-string character and how reads and writes use it
    pub fn set_eos(&self, handle: Handle, eos: u8, flags: EosFlags) -> Result<()> {
        self.session(handle)?.update_settings(|s| {
            s.device.eos = eos;
            s.device.eos_flags = flags;
        });
        Ok(())
    }

    /// Assert EOI with the last byte of every write
    pub fn set_eot(&self, handle: Handle, send_eoi: bool) -> Result<()> {
        self.session(handle)?
            .update_settings(|s| s.device.send_eoi = send_eoi);
        Ok(())
    }

    // ==========
    // QUERIES
    // ==========

    pub fn settings(&self, handle: Handle) -> Result<SessionSettings> {
        Ok(self.session(handle)?.settings())
    }

    pub fn board_info(&self, handle: Handle) -> Result<BoardInfo> {
        let session = self.session(handle)?;
        Ok(self.board_of(&session)?.state().info())
    }

    /// ### Outcome
    ///
    /// Status, error and count triple for a finished call on `handle`.
    ///
    pub fn outcome(&self, handle: Handle, result: &Result<usize>) -> Outcome {
        let status = self.status(handle).unwrap_or(Status::empty());
        Outcome::from_result(status, result)
    }
}

/// Take the bus on an attached board and start its autopoll thread
fn bring_online(board: &Arc<dyn Board>) -> Result<Option<Autopoll>> {
    if board.state().info().is_system_controller {
        // assert IFC and REN so the bus starts in a known state
        pulse_interface_clear(board.as_ref())?;
        board.remote_enable(true)?;
    }
    if board.state().config().autopoll {
        Ok(Some(Autopoll::spawn(Arc::clone(board))?))
    } else {
        Ok(None)
    }
}

fn pulse_interface_clear(board: &dyn Board) -> Result<()> {
    board.interface_clear(true)?;
    std::thread::sleep(IFC_PULSE_DURATION);
    board.interface_clear(false)
}

impl Drop for Gpib {
    fn drop(&mut self) {
        for slot in &self.boards {
            if let Some(mut autopoll) = lock(&slot.autopoll).take() {
                autopoll.stop();
            }
        }
        let sessions = lock(&self.descriptors).drain();
        for session in sessions {
            if let Err(e) = self.release(&session) {
                debug!("closing {:?}: {e}", session.handle());
            }
        }
        for slot in &self.boards {
            if let Err(e) = slot.board.detach() {
                warn!("{}: detach failed: {e}", slot.board.name());
            }
        }
    }
}
