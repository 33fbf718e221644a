//! Scripted [`Board`] used to exercise the session layer.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use super::{Board, BoardState};
use crate::config::BoardConfig;
use crate::constants::{bus_commands, misc::RQS_BIT};
use crate::error::{Error, Result};
use crate::types::{LineStatus, ReadOutcome, Status};

#[derive(Debug, Default)]
pub(crate) struct MockBus {
    /// every command byte, in order
    pub commands: Vec<u8>,
    /// data writes and their EOI flag
    pub writes: Vec<(Vec<u8>, bool)>,
    /// replies served to data reads
    pub reads: VecDeque<(Vec<u8>, bool)>,
    /// poll bytes each primary address answers serial polls with
    pub spoll: HashMap<u8, VecDeque<u8>>,
    /// order in which wire transactions finished
    pub completions: Vec<usize>,
    pub calls: Vec<&'static str>,
    pub ppoll_byte: u8,
    pub status_byte: u8,
    /// primary addresses with a device connected
    pub present: HashSet<u8>,
    talker: Option<u8>,
    listeners: Vec<u8>,
    serial_poll_mode: bool,
}

pub(crate) struct MockBoard {
    state: BoardState,
    bus: Mutex<MockBus>,
    aborts: (Sender<()>, Receiver<()>),
    /// a read is blocked waiting for a talker
    blocked: Mutex<bool>,
    in_flight: AtomicBool,
    attach_fails: AtomicBool,
    overlaps: AtomicUsize,
    completed: AtomicUsize,
    io_delay: Duration,
}

impl MockBoard {
    pub fn new(config: BoardConfig) -> Arc<MockBoard> {
        MockBoard::with_delay(config, Duration::ZERO)
    }

    /// Every write and command occupies the wire for `io_delay`
    pub fn with_delay(config: BoardConfig, io_delay: Duration) -> Arc<MockBoard> {
        Arc::new(MockBoard {
            state: BoardState::new(config),
            bus: Mutex::new(MockBus::default()),
            aborts: bounded(1),
            blocked: Mutex::new(false),
            in_flight: AtomicBool::new(false),
            attach_fails: AtomicBool::new(false),
            overlaps: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            io_delay,
        })
    }

    pub fn bus(&self) -> MutexGuard<'_, MockBus> {
        self.bus.lock().unwrap()
    }

    /// Make the next attach fail
    pub fn fail_attach(&self) {
        self.attach_fails.store(true, Ordering::SeqCst);
    }

    /// A write or command is occupying the wire right now
    pub fn wire_busy(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Transactions that started while another was on the wire
    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    pub fn queue_read(&self, data: &[u8], end: bool) {
        self.bus().reads.push_back((data.to_vec(), end));
    }

    /// Make device `pad` request service with `byte`
    pub fn raise_srq(&self, pad: u8, byte: u8) {
        self.bus().spoll.entry(pad).or_default().push_back(byte);
        self.state.merge_status(Status::SRQI, Status::empty());
    }

    fn srq_asserted(bus: &MockBus) -> bool {
        bus.spoll
            .values()
            .any(|bytes| bytes.iter().any(|b| b & RQS_BIT != 0))
    }

    fn occupy_wire(&self) {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        std::thread::sleep(self.io_delay);
        let n = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        self.bus().completions.push(n);
        self.in_flight.store(false, Ordering::SeqCst);
    }

    fn record(&self, call: &'static str) {
        self.bus().calls.push(call);
    }

    fn check_abort(&self) -> Result<()> {
        if self.state.abort_requested() {
            return Err(Error::Aborted);
        }
        Ok(())
    }

    /// Block until the deadline or an abort, like a read with no talker
    fn block(&self) -> Result<ReadOutcome> {
        {
            let mut blocked = self.blocked.lock().unwrap();
            self.check_abort()?;
            while self.aborts.1.try_recv().is_ok() {}
            *blocked = true;
        }
        let result = loop {
            if self.state.watchdog.io_timed_out() {
                break Err(Error::Timeout);
            }
            match self.aborts.1.recv_timeout(Duration::from_millis(1)) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break Err(Error::Aborted),
                Err(RecvTimeoutError::Timeout) => continue,
            }
        };
        *self.blocked.lock().unwrap() = false;
        result
    }
}

impl Board for MockBoard {
    fn name(&self) -> &str {
        "mock"
    }

    fn state(&self) -> &BoardState {
        &self.state
    }

    fn attach(&self) -> Result<()> {
        self.record("attach");
        if self.attach_fails.load(Ordering::SeqCst) {
            return Err(Error::Offline);
        }
        self.state.set_online(true);
        Ok(())
    }

    fn detach(&self) -> Result<()> {
        self.record("detach");
        self.state.set_online(false);
        Ok(())
    }

    fn abort(&self) -> Result<()> {
        self.record("abort");
        // an idle adapter acknowledges the abort and forgets it
        if *self.blocked.lock().unwrap() {
            let _ = self.aborts.0.try_send(());
        }
        Ok(())
    }

    fn read(&self, buf: &mut [u8]) -> Result<ReadOutcome> {
        self.check_abort()?;
        {
            let mut bus = self.bus();
            if bus.serial_poll_mode {
                let talker = bus.talker;
                let byte = talker
                    .and_then(|pad| bus.spoll.get_mut(&pad))
                    .and_then(VecDeque::pop_front);
                if let Some(byte) = byte {
                    buf[0] = byte;
                    if !MockBoard::srq_asserted(&bus) {
                        self.state.merge_status(Status::empty(), Status::SRQI);
                    }
                    return Ok(ReadOutcome { count: 1, end: true });
                }
            } else if let Some((data, end)) = bus.reads.pop_front() {
                let count = data.len().min(buf.len());
                buf[..count].copy_from_slice(&data[..count]);
                return Ok(ReadOutcome { count, end });
            }
        }
        self.block()
    }

    fn write(&self, data: &[u8], send_eoi: bool) -> Result<usize> {
        self.check_abort()?;
        self.occupy_wire();
        self.bus().writes.push((data.to_vec(), send_eoi));
        Ok(data.len())
    }

    fn command(&self, data: &[u8]) -> Result<usize> {
        self.check_abort()?;
        self.occupy_wire();
        let mut bus = self.bus();
        for byte in data {
            match *byte {
                bus_commands::UNT => bus.talker = None,
                bus_commands::UNL => bus.listeners.clear(),
                b if b & 0x60 == bus_commands::TAD => bus.talker = Some(b & 0x1f),
                b if b & 0x60 == bus_commands::LAD => bus.listeners.push(b & 0x1f),
                bus_commands::SPE => bus.serial_poll_mode = true,
                bus_commands::SPD => bus.serial_poll_mode = false,
                _ => {}
            }
            bus.commands.push(*byte);
        }
        Ok(data.len())
    }

    fn take_control(&self, _synchronous: bool) -> Result<()> {
        self.record("take_control");
        self.state.merge_status(Status::CIC | Status::ATN, Status::empty());
        Ok(())
    }

    fn go_to_standby(&self) -> Result<()> {
        self.record("go_to_standby");
        self.state.merge_status(Status::empty(), Status::ATN);
        Ok(())
    }

    fn request_system_control(&self, request: bool) -> Result<()> {
        self.record("request_system_control");
        self.state
            .update_info(|info| info.is_system_controller = request);
        Ok(())
    }

    fn interface_clear(&self, assert: bool) -> Result<()> {
        if assert {
            self.record("interface_clear");
            self.state.merge_status(Status::CIC, Status::empty());
        }
        Ok(())
    }

    fn remote_enable(&self, enable: bool) -> Result<()> {
        self.record(if enable { "remote_enable" } else { "remote_disable" });
        Ok(())
    }

    fn enable_eos(&self, _eos: u8, _compare_8_bits: bool) -> Result<()> {
        Ok(())
    }

    fn disable_eos(&self) {}

    fn parallel_poll_configure(&self, config: u8) -> Result<()> {
        self.state
            .update_info(|info| info.parallel_poll_configuration = config);
        Ok(())
    }

    fn parallel_poll(&self) -> Result<u8> {
        Ok(self.bus().ppoll_byte)
    }

    fn parallel_poll_response(&self, ist: bool) -> Result<()> {
        self.state.update_info(|info| info.ist = ist);
        Ok(())
    }

    fn line_status(&self) -> Result<LineStatus> {
        let mut lines = LineStatus::VALID_ALL;
        let bus = self.bus();
        if MockBoard::srq_asserted(&bus) {
            lines |= LineStatus::BUS_SRQ;
        }
        let listening = bus.listeners.iter().any(|pad| bus.present.contains(pad));
        if listening && !self.state.status().contains(Status::ATN) {
            lines |= LineStatus::BUS_NDAC;
        }
        Ok(lines)
    }

    fn update_status(&self, clear: Status) -> Result<Status> {
        Ok(self.state.merge_status(Status::empty(), clear))
    }

    fn primary_address(&self, pad: u8) -> Result<()> {
        self.state.update_info(|info| info.pad = pad);
        Ok(())
    }

    fn secondary_address(&self, sad: Option<u8>) -> Result<()> {
        self.state.update_info(|info| info.sad = sad);
        Ok(())
    }

    fn serial_poll_response(&self, status_byte: u8) -> Result<()> {
        self.bus().status_byte = status_byte;
        Ok(())
    }

    fn serial_poll_status(&self) -> Result<u8> {
        Ok(self.bus().status_byte)
    }

    fn t1_delay(&self, nanosec: u32) -> Result<u32> {
        self.state.update_info(|info| info.t1_delay = nanosec);
        Ok(nanosec)
    }

    fn return_to_local(&self) -> Result<()> {
        self.record("return_to_local");
        Ok(())
    }
}
