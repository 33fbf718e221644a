//! Simulated 82357 firmware behind a [`UsbLink`], for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use super::UsbLink;
use crate::codec::{RegisterPair, TrailingFlags, TransferStatus, XferState};
use crate::constants::{bulk_commands, control_requests};

#[derive(Default)]
pub(crate) struct MockState {
    /// every frame written to the bulk-out pipe
    pub frames: Vec<Vec<u8>>,
    /// every register write, in order
    pub register_writes: Vec<RegisterPair>,
    /// values served to register reads
    pub register_values: HashMap<u8, u8>,
    /// replies (data + trailing flags) served to READ frames
    pub read_replies: VecDeque<Vec<u8>>,
    /// never signal write completion
    pub stall_writes: bool,
    /// make every register command fail with this UGP code
    pub register_error: Option<u8>,
    pub read_outstanding: bool,
    pub last_write_len: u32,
    pub aborts: usize,
}

pub(crate) struct MockLink {
    state: Mutex<MockState>,
    bulk_in: (Sender<Vec<u8>>, Receiver<Vec<u8>>),
    interrupts: (Sender<Vec<u8>>, Receiver<Vec<u8>>),
}

impl MockLink {
    pub fn new() -> Arc<MockLink> {
        Arc::new(MockLink {
            state: Mutex::new(MockState::default()),
            bulk_in: unbounded(),
            interrupts: unbounded(),
        })
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn queue_read(&self, data: &[u8], flags: TrailingFlags) {
        let mut reply = data.to_vec();
        reply.push(flags.bits());
        self.state().read_replies.push_back(reply);
    }

    pub fn raise_interrupt(&self, packet: &[u8]) {
        self.interrupts.0.send(packet.to_vec()).unwrap();
    }

    /// Data frames (WRITE and READ) written so far, register traffic excluded
    pub fn data_frames(&self) -> Vec<Vec<u8>> {
        self.state()
            .frames
            .iter()
            .filter(|f| {
                f[0] == bulk_commands::DATA_PIPE_CMD_WRITE || f[0] == bulk_commands::DATA_PIPE_CMD_READ
            })
            .cloned()
            .collect()
    }

    /// Last value written to `address`
    pub fn register(&self, address: u8) -> Option<u8> {
        self.state()
            .register_writes
            .iter()
            .rev()
            .find(|w| w.address == address)
            .map(|w| w.value)
    }

    fn recv(rx: &Receiver<Vec<u8>>, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize> {
        let packet = if timeout.is_zero() {
            rx.recv().map_err(|_| rusb::Error::NoDevice)?
        } else {
            match rx.recv_timeout(timeout) {
                Ok(p) => p,
                Err(RecvTimeoutError::Timeout) => return Err(rusb::Error::Timeout),
                Err(RecvTimeoutError::Disconnected) => return Err(rusb::Error::NoDevice),
            }
        };
        let n = packet.len().min(buf.len());
        buf[..n].copy_from_slice(&packet[..n]);
        Ok(n)
    }
}

impl UsbLink for MockLink {
    fn write_bulk(&self, _endpoint: u8, data: &[u8], _timeout: Duration) -> rusb::Result<usize> {
        let mut state = self.state();
        state.frames.push(data.to_vec());
        match data[0] {
            bulk_commands::DATA_PIPE_CMD_WR_REGS => {
                for pair in data[2..].chunks(2) {
                    state.register_writes.push(RegisterPair {
                        address: pair[0],
                        value: pair[1],
                    });
                }
                let code = state.register_error.unwrap_or(0);
                self.bulk_in.0.send(vec![!data[0], code]).unwrap();
            }
            bulk_commands::DATA_PIPE_CMD_RD_REGS => {
                let mut reply = vec![!data[0], state.register_error.unwrap_or(0)];
                for address in &data[2..] {
                    reply.push(state.register_values.get(address).copied().unwrap_or(0));
                }
                self.bulk_in.0.send(reply).unwrap();
            }
            bulk_commands::DATA_PIPE_CMD_WRITE => {
                state.last_write_len = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
                if !state.stall_writes {
                    self.interrupts.0.send(vec![0x02, 0, 0, 0]).unwrap();
                }
            }
            bulk_commands::DATA_PIPE_CMD_READ => match state.read_replies.pop_front() {
                Some(reply) => self.bulk_in.0.send(reply).unwrap(),
                None => state.read_outstanding = true,
            },
            _ => {}
        }
        Ok(data.len())
    }

    fn read_bulk(&self, _endpoint: u8, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize> {
        MockLink::recv(&self.bulk_in.1, buf, timeout)
    }

    fn read_interrupt(
        &self,
        _endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        MockLink::recv(&self.interrupts.1, buf, timeout)
    }

    fn read_control(
        &self,
        _request_type: u8,
        _request: u8,
        value: u16,
        _index: u16,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> rusb::Result<usize> {
        let mut state = self.state();
        let reply: Vec<u8> = match value {
            control_requests::XFER_ABORT => {
                state.aborts += 1;
                if state.read_outstanding {
                    state.read_outstanding = false;
                    self.bulk_in.0.send(vec![TrailingFlags::ABORT.bits()]).unwrap();
                }
                vec![!(control_requests::XFER_ABORT as u8), 0]
            }
            control_requests::XFER_STATUS => TransferStatus {
                state: XferState::COMPLETED,
                count: state.last_write_len,
                completion: TrailingFlags::empty(),
            }
            .encode()
            .to_vec(),
            _ => return Err(rusb::Error::InvalidParam),
        };
        let n = reply.len().min(buf.len());
        buf[..n].copy_from_slice(&reply[..n]);
        Ok(n)
    }
}
