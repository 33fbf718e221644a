//! ## Agilent 82357
//!
//! Bus transport for the Agilent (Keysight) 82357A and 82357B USB-GPIB
//! adapters. Data and register traffic share the bulk pipes, completion and
//! SRQ arrive on the interrupt pipe, aborts go through the control endpoint.
//!

use std::sync::{Arc, Mutex, TryLockError};
use std::time::Duration;

use log::{debug, info, warn};

use crate::board::{lock, Board, BoardState};
use crate::codec::{self, InterruptFlags, ReadFlags, RegisterPair, TransferStatus, WriteFlags};
use crate::communication::interrupt::{Completion, CompletionSlot, InterruptListener};
use crate::communication::{bulk, control};
use crate::config::BoardConfig;
use crate::constants::misc::{
    ABORT_ACK_TIMEOUT, REGISTER_REPLY_SIZE, REGISTER_TIMEOUT, T1_NANOSEC_PER_CLOCK,
    TAKE_CONTROL_POLLS,
};
use crate::constants::{aux_commands::*, registers::*};
use crate::error::{Error, Result};
use crate::types::{AdapterEndpoints, DeviceInfo, LineStatus, ReadOutcome, Status};
use crate::usb::{UsbDevice, UsbLink};
use crate::{init, DeviceFilter};

/// Address bits refreshed from ADSR by `update_status`
const ADDRESS_STATUS_BITS: Status = Status::TACS
    .union(Status::LACS)
    .union(Status::ATN)
    .union(Status::REM)
    .union(Status::LOK);

fn reg(address: u8, value: u8) -> RegisterPair {
    RegisterPair { address, value }
}

/// ### Agilent 82357
///
/// One attached adapter. Implements [`Board`].
///
pub struct Agilent82357<L: UsbLink> {
    name: String,
    link: Arc<L>,
    endpoints: AdapterEndpoints,
    state: Arc<BoardState>,
    completion: Arc<CompletionSlot>,
    /// held for a whole wire transaction, register frames included
    bulk_transfer_lock: Mutex<()>,
    /// reusable receive buffer for data reads
    bulk_alloc_lock: Mutex<Vec<u8>>,
    control_alloc_lock: Mutex<()>,
    /// shadow of the write-only HW_CONTROL register
    hw_control: Mutex<u8>,
    eos: Mutex<Option<u8>>,
    status_byte: Mutex<u8>,
    listener: Mutex<Option<InterruptListener>>,
}

impl Agilent82357<UsbDevice> {
    /// ### Adapters
    ///
    /// Get a list of attached adapters with their firmware loaded
    ///
    pub fn devices() -> anyhow::Result<Vec<DeviceInfo>> {
        // setup context
        let mut context = rusb::Context::new()?;

        init::list_devices(&mut context)
    }

    /// ### Connect
    ///
    /// Open an adapter and claim its interface. The adapter still needs
    /// [`Board::attach`] before use.
    ///
    /// Use `filter` argument to select the adapter:
    /// - `()` - first found adapter
    /// - `DeviceId` - adapter by USB identifiers
    /// - `(bus, device)` or `DeviceAddr` - adapter by USB bus and device number
    /// - `DeviceInfo` - adapter by both USB identifiers and address
    ///
    pub fn connect(filter: impl DeviceFilter, config: BoardConfig) -> anyhow::Result<Self> {
        // setup context
        let mut context = rusb::Context::new()?;
        // attempt to open the device
        let (device, mut handle, product_id) = init::open_device(&mut context, filter)?;

        // GET THE DEVICE MODE
        // ==========
        let mut mode = init::get_adapter_mode(&device)?;
        init::detach_kernel_driver(&mut mode, &mut handle)?;

        // GET ENDPOINTS
        // ==========
        let endpoints = match init::get_endpoints(&mode, &device) {
            Ok(endpoints) => endpoints,
            Err(e) => {
                warn!("falling back to default endpoints: {e}");
                AdapterEndpoints::for_product(product_id)
            }
        };

        // CONFIGURE DEVICE
        // ==========
        handle.set_active_configuration(mode.config_number)?;
        handle.claim_interface(mode.interface_number)?;
        handle.set_alternate_setting(mode.interface_number, mode.setting_number)?;

        let name = format!(
            "agilent_82357{}-{}:{}",
            if product_id == crate::constants::usb::AGILENT_82357A_PRODUCT_ID { "a" } else { "b" },
            device.bus_number(),
            device.address()
        );
        let link = UsbDevice::new(handle, mode.interface_number, mode.has_kernel_driver);

        Ok(Agilent82357::new(name, link, endpoints, config))
    }
}

impl<L: UsbLink> Agilent82357<L> {
    pub fn new(name: String, link: L, endpoints: AdapterEndpoints, config: BoardConfig) -> Self {
        let buffer_length = config.buffer_length;
        Agilent82357 {
            name,
            link: Arc::new(link),
            endpoints,
            state: Arc::new(BoardState::new(config)),
            completion: Arc::new(CompletionSlot::new()),
            bulk_transfer_lock: Mutex::new(()),
            bulk_alloc_lock: Mutex::new(Vec::with_capacity(buffer_length + 1)),
            control_alloc_lock: Mutex::new(()),
            hw_control: Mutex::new(NOT_TI_RESET | NOT_PARALLEL_POLL),
            eos: Mutex::new(None),
            status_byte: Mutex::new(0),
            listener: Mutex::new(None),
        }
    }

    fn start_listener(&self) -> Result<()> {
        let state = Arc::clone(&self.state);
        let completion = Arc::clone(&self.completion);
        let listener = InterruptListener::spawn(
            format!("{}-interrupt", self.name),
            Arc::clone(&self.link),
            &self.endpoints.interrupt_in,
            move |flags| {
                if flags.contains(InterruptFlags::SRQ) {
                    state.merge_status(Status::SRQI, Status::empty());
                }
                if flags.intersects(InterruptFlags::WRITE_COMPLETE | InterruptFlags::READ_COMPLETE) {
                    completion.notify(Completion::Interrupt(flags));
                }
            },
        )?;
        *lock(&self.listener) = Some(listener);
        Ok(())
    }

    fn check_deadline(&self) -> Result<()> {
        if self.state.watchdog.io_timed_out() {
            return Err(Error::Timeout);
        }
        Ok(())
    }

    /// ### Submit
    ///
    /// Send a READ or WRITE frame unless the running operation was stopped.
    /// The check and the send happen under the control lock, so an abort
    /// either finds the frame in flight or is seen here.
    ///
    fn submit(&self, frame: &[u8]) -> Result<bulk::BulkTransfer> {
        let _control = lock(&self.control_alloc_lock);
        if self.state.abort_requested() {
            debug!("{}: transfer stopped before submission", self.name);
            return Err(Error::Aborted);
        }
        bulk::send(
            &*self.link,
            &self.endpoints.bulk_out,
            frame,
            self.state.watchdog.remaining(),
        )
    }

    // REGISTERS
    // ==========

    fn register_exchange(&self, frame: &[u8]) -> Result<Vec<u8>> {
        bulk::send(
            &*self.link,
            &self.endpoints.bulk_out,
            frame,
            Some(REGISTER_TIMEOUT),
        )?
        .into_result()?;

        let mut reply = [0u8; REGISTER_REPLY_SIZE];
        let count = bulk::receive(
            &*self.link,
            &self.endpoints.bulk_in,
            &mut reply,
            Some(REGISTER_TIMEOUT),
        )?
        .into_result()?;

        Ok(reply[..count].to_vec())
    }

    /// ### Write Registers
    ///
    /// Write register values in one WR_REGS frame.
    ///
    pub fn write_registers(&self, writes: &[RegisterPair]) -> Result<()> {
        let frame = codec::encode_write_registers(writes)?;
        debug!("{}: write registers {:02x?}", self.name, writes);

        let _transfer = lock(&self.bulk_transfer_lock);
        let reply = self.register_exchange(&frame)?;
        codec::decode_write_registers_reply(&reply)
    }

    /// ### Read Registers
    ///
    /// Read register values in one RD_REGS frame. A non-blocking read gives
    /// up with [`Error::IoInProgress`] when a transfer holds the pipe.
    ///
    pub fn read_registers(&self, addresses: &[u8], blocking: bool) -> Result<Vec<u8>> {
        let frame = codec::encode_read_registers(addresses)?;

        let _transfer = if blocking {
            lock(&self.bulk_transfer_lock)
        } else {
            match self.bulk_transfer_lock.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => return Err(Error::IoInProgress),
            }
        };
        let reply = self.register_exchange(&frame)?;
        let values = codec::decode_read_registers_reply(&reply, addresses)?;
        debug!("{}: read registers {:02x?}", self.name, values);

        Ok(values.into_iter().map(|pair| pair.value).collect())
    }

    fn read_register(&self, address: u8) -> Result<u8> {
        let values = self.read_registers(&[address], true)?;
        values
            .first()
            .copied()
            .ok_or_else(|| Error::Protocol("empty register reply".to_string()))
    }

    // TRANSFERS
    // ==========

    fn abort_transfer(&self, flush: bool) -> Result<()> {
        let result = {
            let _control = lock(&self.control_alloc_lock);
            control::xfer_abort(&*self.link, flush, ABORT_ACK_TIMEOUT)
        };
        self.completion.notify(Completion::Cancelled);
        if let Err(e) = &result {
            warn!("{}: abort not acknowledged: {e}", self.name);
        }
        result
    }

    fn transfer_status(&self) -> Result<TransferStatus> {
        let _control = lock(&self.control_alloc_lock);
        control::xfer_status(&*self.link, REGISTER_TIMEOUT)
    }

    /// Swallow whatever the adapter still sends after an aborted read
    fn drain(&self, buffer: &mut [u8]) {
        match bulk::receive(
            &*self.link,
            &self.endpoints.bulk_in,
            buffer,
            Some(ABORT_ACK_TIMEOUT),
        )
        .and_then(bulk::BulkTransfer::into_result)
        {
            Ok(count) => debug!("{}: drained {count} bytes", self.name),
            Err(e) => debug!("{}: nothing drained: {e}", self.name),
        }
    }

    fn generic_write(&self, data: &[u8], flags: WriteFlags) -> Result<usize> {
        self.check_deadline()?;
        let frame = codec::encode_write(data, flags)?;

        let _transfer = lock(&self.bulk_transfer_lock);
        let waiter = self.completion.register();

        let sent = self.submit(&frame)?;
        if sent.timed_out {
            warn!("{}: write frame timed out", self.name);
            let _ = self.abort_transfer(true);
            return Err(Error::Timeout);
        }
        sent.into_result()?;

        match waiter.wait(InterruptFlags::WRITE_COMPLETE, self.state.watchdog.remaining()) {
            Ok(()) => {}
            Err(Error::Timeout) => {
                warn!("{}: write timed out, aborting", self.name);
                let _ = self.abort_transfer(true);
                return Err(Error::Timeout);
            }
            Err(e) => return Err(e),
        }
        drop(waiter);

        let status = self.transfer_status()?;
        if let Some(e) = status.completion.error() {
            return Err(e);
        }
        Ok(status.count as usize)
    }
}

impl<L: UsbLink> Board for Agilent82357<L> {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> &BoardState {
        &self.state
    }

    fn attach(&self) -> Result<()> {
        let config = self.state.config().clone();
        self.start_listener()?;

        // RESET THE ADAPTER
        // ==========
        self.write_registers(&[
            reg(LED_CONTROL, FAIL_LED_ON),
            reg(RESET_TO_POWERUP, RESET_SPACEBALL),
        ])?;
        std::thread::sleep(Duration::from_millis(2));
        let _ = self.abort_transfer(false);

        // CONFIGURE THE TMS9914
        // ==========
        let hw_control = NOT_TI_RESET | NOT_PARALLEL_POLL;
        *lock(&self.hw_control) = hw_control;
        let t1_clocks = 0x10;
        self.write_registers(&[
            reg(AUXCR, AUX_NBAF),
            reg(AUXCR, AUX_HLDE),
            reg(AUXCR, AUX_TON),
            reg(AUXCR, AUX_LON),
            reg(AUXCR, AUX_RSV2),
            reg(AUXCR, AUX_INVAL),
            reg(AUXCR, AUX_RPP),
            reg(AUXCR, AUX_STDL),
            reg(AUXCR, AUX_VSTDL),
            reg(FAST_TALKER_T1, t1_clocks),
            reg(IMR0, HR_BOIE | HR_BIIE),
            reg(IMR1, HR_SRQIE),
            reg(HW_CONTROL, hw_control),
            reg(PROTOCOL_CONTROL, WRITE_COMPLETE_INTERRUPT_EN),
        ])?;
        self.write_registers(&[reg(LED_CONTROL, FIRMWARE_LED_CONTROL)])?;
        self.state.update_info(|info| {
            info.t1_delay = u32::from(t1_clocks) * T1_NANOSEC_PER_CLOCK;
            info.no_7_bit_eos = true;
        });

        // ADDRESSING AND CONTROL
        // ==========
        self.request_system_control(config.system_controller)?;
        self.primary_address(config.pad)?;
        self.secondary_address(config.sad)?;

        self.state.set_online(true);
        info!("{}: attached", self.name);
        Ok(())
    }

    fn detach(&self) -> Result<()> {
        self.state.set_online(false);
        let hw_control = *lock(&self.hw_control) & !NOT_TI_RESET;
        let result = self.write_registers(&[
            reg(AUXCR, AUX_CHIP_RESET | AUX_CS),
            reg(HW_CONTROL, hw_control),
            reg(LED_CONTROL, 0),
        ]);
        if let Some(mut listener) = lock(&self.listener).take() {
            listener.stop();
        }
        info!("{}: detached", self.name);
        result
    }

    fn abort(&self) -> Result<()> {
        info!("{}: aborting transfer", self.name);
        self.abort_transfer(true)
    }

    fn read(&self, buf: &mut [u8]) -> Result<ReadOutcome> {
        if buf.is_empty() {
            return Ok(ReadOutcome::default());
        }
        self.check_deadline()?;

        let mut flags = ReadFlags::END_ON_EOI | ReadFlags::NO_ADDRESS;
        let eos = match *lock(&self.eos) {
            Some(eos) => {
                flags |= ReadFlags::END_ON_EOS_CHAR;
                eos
            }
            None => 0,
        };
        let frame = codec::encode_read(buf.len(), flags, eos)?;

        let _transfer = lock(&self.bulk_transfer_lock);
        let mut buffer = lock(&self.bulk_alloc_lock);
        buffer.clear();
        // data plus the trailing flags byte
        buffer.resize(buf.len() + 1, 0);

        let sent = self.submit(&frame)?;
        if sent.timed_out {
            warn!("{}: read request timed out", self.name);
            let _ = self.abort_transfer(true);
            return Err(Error::Timeout);
        }
        sent.into_result()?;

        let received = bulk::receive(
            &*self.link,
            &self.endpoints.bulk_in,
            &mut buffer,
            self.state.watchdog.remaining(),
        )?;
        if received.timed_out {
            warn!("{}: read timed out, aborting", self.name);
            let _ = self.abort_transfer(true);
            self.drain(&mut buffer);
            return Err(Error::Timeout);
        }
        let count = received.into_result()?;

        let (data, trailing) = codec::decode_read_reply(&buffer[..count])?;
        if data.len() > buf.len() {
            return Err(Error::Protocol(format!(
                "read reply of {} bytes for a {} byte request",
                data.len(),
                buf.len()
            )));
        }
        buf[..data.len()].copy_from_slice(data);
        if let Some(e) = trailing.error() {
            return Err(e);
        }

        Ok(ReadOutcome {
            count: data.len(),
            end: trailing.ended(),
        })
    }

    fn write(&self, data: &[u8], send_eoi: bool) -> Result<usize> {
        let mut flags = WriteFlags::NO_ADDRESS;
        if send_eoi {
            flags |= WriteFlags::SEND_EOI;
        }
        self.generic_write(data, flags)
    }

    fn command(&self, data: &[u8]) -> Result<usize> {
        self.generic_write(data, WriteFlags::ATN | WriteFlags::NO_ADDRESS)
    }

    fn take_control(&self, synchronous: bool) -> Result<()> {
        let aux = if synchronous { AUX_TCS } else { AUX_TCA };
        self.write_registers(&[reg(AUXCR, aux)])?;

        for _ in 0..TAKE_CONTROL_POLLS {
            let adsr = self.read_register(ADSR)?;
            if adsr & HR_ATN != 0 {
                self.state
                    .merge_status(Status::CIC | Status::ATN, Status::empty());
                return Ok(());
            }
            std::thread::sleep(Duration::from_micros(1));
        }

        warn!("{}: ATN not asserted after take control", self.name);
        Err(Error::Timeout)
    }

    fn go_to_standby(&self) -> Result<()> {
        self.write_registers(&[reg(AUXCR, AUX_GTS)])?;
        self.state.merge_status(Status::empty(), Status::ATN);
        Ok(())
    }

    fn request_system_control(&self, request: bool) -> Result<()> {
        let mut hw_control = lock(&self.hw_control);
        let (aux, bits) = if request {
            (AUX_RQC, *hw_control | SYSTEM_CONTROLLER)
        } else {
            (AUX_RLC, *hw_control & !SYSTEM_CONTROLLER)
        };
        self.write_registers(&[reg(AUXCR, aux), reg(HW_CONTROL, bits)])?;
        *hw_control = bits;
        drop(hw_control);

        if !request {
            self.state.merge_status(Status::empty(), Status::CIC);
        }
        self.state
            .update_info(|info| info.is_system_controller = request);
        Ok(())
    }

    fn interface_clear(&self, assert: bool) -> Result<()> {
        let aux = if assert { AUX_SIC | AUX_CS } else { AUX_SIC };
        self.write_registers(&[reg(AUXCR, aux)])?;
        if assert && self.state.info().is_system_controller {
            self.state.merge_status(Status::CIC, Status::empty());
        }
        Ok(())
    }

    fn remote_enable(&self, enable: bool) -> Result<()> {
        let aux = if enable { AUX_SRE | AUX_CS } else { AUX_SRE };
        self.write_registers(&[reg(AUXCR, aux)])
    }

    fn enable_eos(&self, eos: u8, compare_8_bits: bool) -> Result<()> {
        if !compare_8_bits {
            warn!("{}: adapter only supports 8-bit EOS compare", self.name);
            return Err(Error::Unsupported);
        }
        *lock(&self.eos) = Some(eos);
        Ok(())
    }

    fn disable_eos(&self) {
        *lock(&self.eos) = None;
    }

    fn parallel_poll_configure(&self, config: u8) -> Result<()> {
        let ist = self.state.info().ist;
        self.write_registers(&[reg(PPR, codec::parallel_poll_response(config, ist))])?;
        self.state
            .update_info(|info| info.parallel_poll_configuration = config);
        Ok(())
    }

    fn parallel_poll(&self) -> Result<u8> {
        let hw_control = lock(&self.hw_control);
        self.write_registers(&[
            reg(AUXCR, AUX_RPP | AUX_CS),
            reg(HW_CONTROL, *hw_control & !NOT_PARALLEL_POLL),
        ])?;
        std::thread::sleep(Duration::from_micros(2));
        let result = self.read_register(CPTR);

        // release the poll even if the read failed
        self.write_registers(&[
            reg(HW_CONTROL, *hw_control | NOT_PARALLEL_POLL),
            reg(AUXCR, AUX_RPP),
        ])?;
        result
    }

    fn parallel_poll_response(&self, ist: bool) -> Result<()> {
        let config = self.state.info().parallel_poll_configuration;
        self.write_registers(&[reg(PPR, codec::parallel_poll_response(config, ist))])?;
        self.state.update_info(|info| info.ist = ist);
        Ok(())
    }

    fn line_status(&self) -> Result<LineStatus> {
        let bsr = self.read_register(BSR)?;
        Ok(codec::decode_bus_status(bsr))
    }

    fn update_status(&self, clear: Status) -> Result<Status> {
        let mut set = Status::empty();
        let mut unset = clear;
        match self.read_registers(&[ADSR], false) {
            Ok(values) => {
                if let Some(adsr) = values.first() {
                    set = codec::decode_address_status(*adsr);
                    unset |= ADDRESS_STATUS_BITS;
                }
            }
            // a transfer holds the pipe, keep the cached bits
            Err(Error::IoInProgress) => {}
            Err(e) => return Err(e),
        }
        Ok(self.state.merge_status(set, unset))
    }

    fn primary_address(&self, pad: u8) -> Result<()> {
        self.write_registers(&[reg(ADR, pad & ADDRESS_MASK)])?;
        self.state.update_info(|info| info.pad = pad);
        Ok(())
    }

    fn secondary_address(&self, sad: Option<u8>) -> Result<()> {
        if sad.is_some() {
            warn!("{}: adapter has no secondary address support", self.name);
        }
        self.state.update_info(|info| info.sad = sad);
        Ok(())
    }

    fn serial_poll_response(&self, status_byte: u8) -> Result<()> {
        self.write_registers(&[reg(SPMR, status_byte)])?;
        *lock(&self.status_byte) = status_byte;
        Ok(())
    }

    fn serial_poll_status(&self) -> Result<u8> {
        Ok(*lock(&self.status_byte))
    }

    fn t1_delay(&self, nanosec: u32) -> Result<u32> {
        let clocks = nanosec.div_ceil(T1_NANOSEC_PER_CLOCK).min(0xff);
        self.write_registers(&[reg(FAST_TALKER_T1, clocks as u8)])?;
        let actual = clocks * T1_NANOSEC_PER_CLOCK;
        self.state.update_info(|info| info.t1_delay = actual);
        Ok(actual)
    }

    fn return_to_local(&self) -> Result<()> {
        self.write_registers(&[reg(AUXCR, AUX_RTL | AUX_CS), reg(AUXCR, AUX_RTL)])
    }
}
