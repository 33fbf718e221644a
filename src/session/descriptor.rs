//! ## Descriptors
//!
//! Open sessions and the table mapping handles to them.
//!

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::board::lock;
use crate::config::DeviceSettings;
use crate::constants::misc::MAX_DESCRIPTORS;
use crate::error::{Error, Result};
use crate::types::{Address, Handle, Outcome};

use super::aio::AsyncOperation;

/// ### Session Settings
///
/// Address and software settings of one session.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub address: Address,
    pub device: DeviceSettings,
}

/// ### Session
///
/// One open logical connection, to a device or to the interface board itself.
///
#[derive(Debug)]
pub struct Session {
    handle: Handle,
    board_index: usize,
    is_board: bool,
    settings: Mutex<SessionSettings>,
    defaults: SessionSettings,
    end: AtomicBool,
    timed_out: AtomicBool,
    io_in_progress: AtomicBool,
    pub(crate) aio: Mutex<Option<AsyncOperation>>,
    pub(crate) last_async: Mutex<Option<Outcome>>,
}

impl Session {
    pub(crate) fn new(
        handle: Handle,
        board_index: usize,
        is_board: bool,
        settings: SessionSettings,
    ) -> Session {
        Session {
            handle,
            board_index,
            is_board,
            defaults: settings.clone(),
            settings: Mutex::new(settings),
            end: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
            io_in_progress: AtomicBool::new(false),
            aio: Mutex::new(None),
            last_async: Mutex::new(None),
        }
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn board_index(&self) -> usize {
        self.board_index
    }

    /// The session talks to the interface board rather than a device
    pub fn is_board(&self) -> bool {
        self.is_board
    }

    pub fn settings(&self) -> SessionSettings {
        lock(&self.settings).clone()
    }

    pub fn address(&self) -> Address {
        lock(&self.settings).address
    }

    pub(crate) fn update_settings<T>(&self, f: impl FnOnce(&mut SessionSettings) -> T) -> T {
        f(&mut lock(&self.settings))
    }

    /// Put back the settings the session was opened with, returns them
    pub(crate) fn restore_defaults(&self) -> SessionSettings {
        *lock(&self.settings) = self.defaults.clone();
        self.defaults.clone()
    }

    /// The last read ended on EOI or EOS
    pub fn end(&self) -> bool {
        self.end.load(Ordering::SeqCst)
    }

    pub(crate) fn set_end(&self, end: bool) {
        self.end.store(end, Ordering::SeqCst);
    }

    /// The last I/O call ran out of time
    pub fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }

    /// Remember how the last I/O call went
    pub(crate) fn record<T>(&self, result: &Result<T>) {
        let timed_out = matches!(result, Err(e) if e.is_timeout());
        self.timed_out.store(timed_out, Ordering::SeqCst);
    }

    pub fn io_in_progress(&self) -> bool {
        self.io_in_progress.load(Ordering::SeqCst)
    }

    /// ### Begin I/O
    ///
    /// Mark the session busy until the returned guard is dropped. Fails with
    /// [`Error::IoInProgress`] when another operation already holds it.
    ///
    pub(crate) fn begin_io(self: &Arc<Self>) -> Result<IoGuard> {
        self.io_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| Error::IoInProgress)?;
        Ok(IoGuard {
            session: Arc::clone(self),
        })
    }
}

/// Clears the owning session's I/O in progress flag when dropped
#[derive(Debug)]
pub(crate) struct IoGuard {
    session: Arc<Session>,
}

impl Drop for IoGuard {
    fn drop(&mut self) {
        self.session.io_in_progress.store(false, Ordering::SeqCst);
    }
}

/// ### Descriptors
///
/// Handle table. Handles are reused lowest first once closed.
///
#[derive(Debug, Default)]
pub(crate) struct Descriptors {
    table: HashMap<Handle, Arc<Session>>,
}

impl Descriptors {
    pub fn insert(&mut self, build: impl FnOnce(Handle) -> Session) -> Result<Arc<Session>> {
        let handle = (0..MAX_DESCRIPTORS as i32)
            .map(Handle)
            .find(|handle| !self.table.contains_key(handle))
            .ok_or(Error::TableFull)?;
        let session = Arc::new(build(handle));
        self.table.insert(handle, Arc::clone(&session));
        Ok(session)
    }

    pub fn get(&self, handle: Handle) -> Result<Arc<Session>> {
        self.table
            .get(&handle)
            .cloned()
            .ok_or(Error::NonexistentDevice)
    }

    pub fn remove(&mut self, handle: Handle) -> Result<Arc<Session>> {
        self.table.remove(&handle).ok_or(Error::NonexistentDevice)
    }

    /// Drain every session, in handle order
    pub fn drain(&mut self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<Arc<Session>> = self.table.drain().map(|(_, s)| s).collect();
        sessions.sort_by_key(|s| s.handle());
        sessions
    }
}
