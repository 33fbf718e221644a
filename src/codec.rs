//! ## Codec
//!
//! Translation between logical bus actions and the 82357 wire format. Pure
//! functions only: every frame sent on the bulk pipe, every register reply,
//! control reply and interrupt packet is built or parsed here.
//!

use bitflags::bitflags;

use crate::constants::{bulk_commands, control_requests, registers, ugp_status};
use crate::error::{Error, Result};
use crate::types::{LineStatus, Status};

bitflags! {
    /// Flags of a READ frame
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ReadFlags: u8 {
        const END_ON_EOI = 0x1;
        const NO_ADDRESS = 0x2;
        const END_ON_EOS_CHAR = 0x4;
        /// serial poll piggy-back
        const SPOLL = 0x8;
    }
}

bitflags! {
    /// Flags of a WRITE frame
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct WriteFlags: u8 {
        const SEND_EOI = 0x1;
        const NO_FAST_TALKER_FIRST_BYTE = 0x2;
        const NO_FAST_TALKER = 0x4;
        const NO_ADDRESS = 0x8;
        /// send the payload as commands
        const ATN = 0x10;
        const SEPARATE_HEADER = 0x80;
    }
}

bitflags! {
    /// Flags trailing a read reply, also used as the completion byte of XFER_STATUS
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TrailingFlags: u8 {
        const EOI = 0x1;
        const ATN = 0x2;
        const IFC = 0x4;
        const EOS = 0x8;
        const ABORT = 0x10;
        const COUNT = 0x20;
        const DEAD_BUS = 0x40;
        const UNADDRESSED = 0x80;
    }
}

bitflags! {
    /// Bits of the interrupt-in packet
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct InterruptFlags: u32 {
        const SRQ = 1 << 0;
        const WRITE_COMPLETE = 1 << 1;
        const READ_COMPLETE = 1 << 2;
    }
}

bitflags! {
    /// Transfer state bits of an XFER_STATUS reply
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct XferState: u8 {
        const COMPLETED = 0x1;
        const READ = 0x2;
    }
}

impl TrailingFlags {
    /// Status bits implied by the flags
    pub fn status(&self) -> Status {
        let mut status = Status::empty();
        if self.intersects(TrailingFlags::EOI | TrailingFlags::EOS) {
            status |= Status::END;
        }
        if self.contains(TrailingFlags::ATN) {
            status |= Status::ATN;
        }
        status
    }

    /// The transfer ended on END (EOI or EOS)
    pub fn ended(&self) -> bool {
        self.intersects(TrailingFlags::EOI | TrailingFlags::EOS)
    }

    /// Error reported by the flags, if any
    pub fn error(&self) -> Option<Error> {
        if self.contains(TrailingFlags::DEAD_BUS) {
            Some(Error::DeadBus)
        } else if self.contains(TrailingFlags::UNADDRESSED) {
            Some(Error::BusNotAddressed)
        } else if self.intersects(TrailingFlags::ABORT | TrailingFlags::IFC) {
            Some(Error::Aborted)
        } else {
            None
        }
    }
}

/// ### Bulk Command
///
/// First byte of every frame on the bulk-out pipe.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BulkCommand {
    Write = bulk_commands::DATA_PIPE_CMD_WRITE,
    Read = bulk_commands::DATA_PIPE_CMD_READ,
    WriteRegisters = bulk_commands::DATA_PIPE_CMD_WR_REGS,
    ReadRegisters = bulk_commands::DATA_PIPE_CMD_RD_REGS,
}

impl BulkCommand {
    pub fn decode(byte: u8) -> Result<BulkCommand> {
        match byte {
            bulk_commands::DATA_PIPE_CMD_WRITE => Ok(BulkCommand::Write),
            bulk_commands::DATA_PIPE_CMD_READ => Ok(BulkCommand::Read),
            bulk_commands::DATA_PIPE_CMD_WR_REGS => Ok(BulkCommand::WriteRegisters),
            bulk_commands::DATA_PIPE_CMD_RD_REGS => Ok(BulkCommand::ReadRegisters),
            _ => Err(Error::InvalidCommand),
        }
    }

    /// The byte the adapter echoes back in front of a reply
    pub fn reply_id(&self) -> u8 {
        !(*self as u8)
    }
}

/// True for TMS9914 registers and the firmware registers
pub fn is_valid_register(address: u8) -> bool {
    address <= registers::TMS9914_LAST_REGISTER
        || (registers::HW_CONTROL..=registers::FAST_TALKER_T1).contains(&address)
}

/// ### Register Pair
///
/// An address/value pair for a register write (or a register read result).
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterPair {
    pub address: u8,
    pub value: u8,
}

impl RegisterPair {
    pub fn new(address: u8, value: u8) -> Result<RegisterPair> {
        if !is_valid_register(address) {
            return Err(Error::InvalidRegister(address));
        }
        Ok(RegisterPair { address, value })
    }

    pub fn encode(&self) -> [u8; 2] {
        [self.address, self.value]
    }

    pub fn decode(bytes: [u8; 2]) -> Result<RegisterPair> {
        RegisterPair::new(bytes[0], bytes[1])
    }
}

/// Map a firmware UGP error code onto the crate's errors
pub fn ugp_result(code: u8) -> Result<()> {
    match code {
        ugp_status::UGP_SUCCESS => Ok(()),
        ugp_status::UGP_ERR_INVALID_CMD => Err(Error::InvalidCommand),
        ugp_status::UGP_ERR_INVALID_PARAM => Err(Error::InvalidParameter),
        ugp_status::UGP_ERR_INVALID_REG => {
            Err(Error::InvalidArgument("adapter reported an invalid register"))
        }
        ugp_status::UGP_ERR_GPIB_READ => Err(Error::BusRead),
        ugp_status::UGP_ERR_GPIB_WRITE => Err(Error::BusWrite),
        ugp_status::UGP_ERR_FLUSHING | ugp_status::UGP_ERR_FLUSHING_ALREADY => {
            Err(Error::Aborted)
        }
        ugp_status::UGP_ERR_UNSUPPORTED => Err(Error::Unsupported),
        other => Err(Error::Protocol(format!("adapter error code 0x{other:02x}"))),
    }
}

fn data_header(command: BulkCommand, flags: u8, length: u32) -> Vec<u8> {
    let mut frame = Vec::with_capacity(crate::constants::misc::DATA_PIPE_HEADER_SIZE);
    frame.push(command as u8);
    // primary and secondary address, unused since frames carry NO_ADDRESS
    frame.push(0x00);
    frame.push(0x00);
    frame.push(flags);
    frame.extend_from_slice(&length.to_le_bytes());
    frame
}

/// ### Encode Write
///
/// Build a WRITE frame carrying `data` (commands when `flags` has ATN).
///
pub fn encode_write(data: &[u8], flags: WriteFlags) -> Result<Vec<u8>> {
    let length = u32::try_from(data.len()).map_err(|_| Error::InvalidArgument("write too long"))?;
    let mut frame = data_header(BulkCommand::Write, flags.bits(), length);
    frame.extend_from_slice(data);
    Ok(frame)
}

/// ### Encode Read
///
/// Build a READ request for at most `length` bytes.
///
pub fn encode_read(length: usize, flags: ReadFlags, eos: u8) -> Result<Vec<u8>> {
    let length = u32::try_from(length).map_err(|_| Error::InvalidArgument("read too long"))?;
    let mut frame = data_header(BulkCommand::Read, flags.bits(), length);
    frame.push(eos);
    frame.push(bulk_commands::ACK_ID);
    Ok(frame)
}

/// Split a read reply into its data and trailing flags
pub fn decode_read_reply(reply: &[u8]) -> Result<(&[u8], TrailingFlags)> {
    match reply.split_last() {
        Some((flags, data)) => Ok((data, TrailingFlags::from_bits_retain(*flags))),
        None => Err(Error::Protocol("empty read reply".to_string())),
    }
}

/// ### Encode Write Registers
///
/// Build a WR_REGS frame.
///
pub fn encode_write_registers(writes: &[RegisterPair]) -> Result<Vec<u8>> {
    let count = u8::try_from(writes.len()).map_err(|_| Error::InvalidArgument("too many registers"))?;
    let mut frame = Vec::with_capacity(2 + 2 * writes.len());
    frame.push(BulkCommand::WriteRegisters as u8);
    frame.push(count);
    for write in writes {
        if !is_valid_register(write.address) {
            return Err(Error::InvalidRegister(write.address));
        }
        frame.extend_from_slice(&write.encode());
    }
    Ok(frame)
}

/// ### Encode Read Registers
///
/// Build a RD_REGS frame for the listed register addresses.
///
pub fn encode_read_registers(addresses: &[u8]) -> Result<Vec<u8>> {
    let count =
        u8::try_from(addresses.len()).map_err(|_| Error::InvalidArgument("too many registers"))?;
    let mut frame = Vec::with_capacity(2 + addresses.len());
    frame.push(BulkCommand::ReadRegisters as u8);
    frame.push(count);
    for address in addresses {
        if !is_valid_register(*address) {
            return Err(Error::InvalidRegister(*address));
        }
        frame.push(*address);
    }
    Ok(frame)
}

fn check_register_reply(reply: &[u8], command: BulkCommand) -> Result<()> {
    if reply.len() < 2 {
        return Err(Error::Protocol(format!(
            "short {command:?} reply ({} bytes)",
            reply.len()
        )));
    }
    if reply[0] != command.reply_id() {
        return Err(Error::Protocol(format!(
            "reply id 0x{:02x} does not match {command:?}",
            reply[0]
        )));
    }
    ugp_result(reply[1])
}

/// Check the reply to a WR_REGS frame
pub fn decode_write_registers_reply(reply: &[u8]) -> Result<()> {
    check_register_reply(reply, BulkCommand::WriteRegisters)
}

/// ### Decode Read Registers Reply
///
/// Pair the values of a RD_REGS reply with the addresses that were requested.
///
pub fn decode_read_registers_reply(reply: &[u8], addresses: &[u8]) -> Result<Vec<RegisterPair>> {
    check_register_reply(reply, BulkCommand::ReadRegisters)?;
    let values = &reply[2..];
    if values.len() < addresses.len() {
        return Err(Error::Protocol(format!(
            "expected {} register values, got {}",
            addresses.len(),
            values.len()
        )));
    }
    addresses
        .iter()
        .zip(values)
        .map(|(address, value)| RegisterPair::new(*address, *value))
        .collect()
}

/// ### Decode Abort Reply
///
/// Check the acknowledgement of an XFER_ABORT request. A flush that finds the
/// adapter already flushing is still a success.
///
pub fn decode_abort_reply(reply: &[u8], flush: bool) -> Result<()> {
    let expected = !(control_requests::XFER_ABORT as u8);
    match reply {
        [major, _] if *major != expected => Err(Error::Protocol(format!(
            "abort reply id 0x{major:02x} != 0x{expected:02x}"
        ))),
        [_, ugp_status::UGP_SUCCESS] => Ok(()),
        [_, ugp_status::UGP_ERR_FLUSHING] if flush => Ok(()),
        [_, code] => ugp_result(*code),
        _ => Err(Error::Protocol("short abort reply".to_string())),
    }
}

/// ### Transfer Status
///
/// Decoded XFER_STATUS reply.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferStatus {
    pub state: XferState,
    pub count: u32,
    pub completion: TrailingFlags,
}

impl TransferStatus {
    pub fn decode(reply: &[u8]) -> Result<TransferStatus> {
        if reply.len() < control_requests::XFER_STATUS_REPLY_SIZE {
            return Err(Error::Protocol("short transfer status reply".to_string()));
        }
        let expected = !(control_requests::XFER_STATUS as u8);
        if reply[0] != expected {
            return Err(Error::Protocol(format!(
                "transfer status reply id 0x{:02x} != 0x{expected:02x}",
                reply[0]
            )));
        }
        Ok(TransferStatus {
            state: XferState::from_bits_retain(reply[1]),
            count: u32::from_le_bytes([reply[2], reply[3], reply[4], reply[5]]),
            completion: TrailingFlags::from_bits_retain(reply[6]),
        })
    }

    pub fn encode(&self) -> [u8; control_requests::XFER_STATUS_REPLY_SIZE] {
        let count = self.count.to_le_bytes();
        [
            !(control_requests::XFER_STATUS as u8),
            self.state.bits(),
            count[0],
            count[1],
            count[2],
            count[3],
            self.completion.bits(),
            0x00,
        ]
    }
}

/// Decode an interrupt-in packet
pub fn decode_interrupt(packet: &[u8]) -> InterruptFlags {
    let mut word = [0u8; 4];
    for (dst, src) in word.iter_mut().zip(packet) {
        *dst = *src;
    }
    InterruptFlags::from_bits_truncate(u32::from_le_bytes(word))
}

/// Convert a BSR register value into line status bits
pub fn decode_bus_status(bsr: u8) -> LineStatus {
    let mut lines = LineStatus::VALID_ALL;
    let map = [
        (registers::BSR_REN_BIT, LineStatus::BUS_REN),
        (registers::BSR_IFC_BIT, LineStatus::BUS_IFC),
        (registers::BSR_SRQ_BIT, LineStatus::BUS_SRQ),
        (registers::BSR_EOI_BIT, LineStatus::BUS_EOI),
        (registers::BSR_NRFD_BIT, LineStatus::BUS_NRFD),
        (registers::BSR_NDAC_BIT, LineStatus::BUS_NDAC),
        (registers::BSR_DAV_BIT, LineStatus::BUS_DAV),
        (registers::BSR_ATN_BIT, LineStatus::BUS_ATN),
    ];
    for (bit, line) in map {
        if bsr & bit != 0 {
            lines |= line;
        }
    }
    lines
}

/// Talker/listener/ATN bits from the ADSR register
pub fn decode_address_status(adsr: u8) -> Status {
    let mut status = Status::empty();
    let atn = adsr & registers::HR_ATN != 0;
    if adsr & registers::HR_TA != 0 && !atn {
        status |= Status::TACS;
    }
    if adsr & registers::HR_LA != 0 && !atn {
        status |= Status::LACS;
    }
    if atn {
        status |= Status::ATN;
    }
    if adsr & registers::HR_REM != 0 {
        status |= Status::REM;
    }
    if adsr & registers::HR_LLO != 0 {
        status |= Status::LOK;
    }
    status
}

/// ### Parallel Poll Response
///
/// PPR register value for a parallel poll configuration byte and ist.
/// A configuration of PPE | sense << 3 | line drives `line` when ist
/// equals sense; anything else leaves the lines released.
///
pub fn parallel_poll_response(config: u8, ist: bool) -> u8 {
    use crate::constants::bus_commands::PPE;

    if config & 0xf0 != PPE {
        return 0;
    }
    let sense = config & 0x8 != 0;
    if sense == ist {
        1 << (config & 0x7)
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn write_frame_layout() {
        let frame = encode_write(b"*IDN?", WriteFlags::SEND_EOI | WriteFlags::NO_ADDRESS).unwrap();
        assert_eq!(&frame[..8], &[0x01, 0, 0, 0x09, 5, 0, 0, 0]);
        assert_eq!(&frame[8..], b"*IDN?");
    }

    #[test]
    fn read_frame_layout() {
        let frame = encode_read(0x1234, ReadFlags::END_ON_EOI | ReadFlags::NO_ADDRESS, b'\n').unwrap();
        assert_eq!(frame, vec![0x03, 0, 0, 0x03, 0x34, 0x12, 0, 0, b'\n', 0xff]);
    }

    #[test]
    fn read_reply_splits_trailing_flags() {
        let (data, flags) = decode_read_reply(&[b'o', b'k', 0x01]).unwrap();
        assert_eq!(data, b"ok");
        assert!(flags.ended());
        assert!(flags.error().is_none());
        assert!(decode_read_reply(&[]).is_err());
    }

    #[test]
    fn trailing_flags_round_trip() {
        for byte in 0..=u8::MAX {
            let flags = TrailingFlags::from_bits_retain(byte);
            assert_eq!(flags.bits(), byte);
        }
        for byte in 0..=ReadFlags::all().bits() {
            if let Some(flags) = ReadFlags::from_bits(byte) {
                assert_eq!(flags.bits(), byte);
            }
        }
        for byte in 0..=u8::MAX {
            if let Some(flags) = WriteFlags::from_bits(byte) {
                assert_eq!(flags.bits(), byte);
            }
        }
    }

    #[test]
    fn trailing_flags_errors() {
        assert_eq!(TrailingFlags::DEAD_BUS.error(), Some(Error::DeadBus));
        assert_eq!(TrailingFlags::UNADDRESSED.error(), Some(Error::BusNotAddressed));
        assert_eq!(TrailingFlags::ABORT.error(), Some(Error::Aborted));
        assert_eq!(TrailingFlags::EOS.status(), Status::END);
    }

    #[test]
    fn register_pairs_round_trip_within_register_set() {
        for address in (0..=7).chain(0xa..=0xe) {
            for value in [0x00, 0x5a, 0xff] {
                let pair = RegisterPair::new(address, value).unwrap();
                assert_eq!(RegisterPair::decode(pair.encode()).unwrap(), pair);
            }
        }
    }

    #[test]
    fn out_of_range_registers_are_invalid() {
        for address in [0x8, 0x9, 0xf, 0x10, 0xff] {
            assert_eq!(
                RegisterPair::decode([address, 0]),
                Err(Error::InvalidRegister(address))
            );
            assert_eq!(
                encode_read_registers(&[address]),
                Err(Error::InvalidRegister(address))
            );
        }
    }

    #[test]
    fn register_frames() {
        let writes = [
            RegisterPair::new(registers::AUXCR, 0x8f).unwrap(),
            RegisterPair::new(registers::HW_CONTROL, 0x07).unwrap(),
        ];
        assert_eq!(
            encode_write_registers(&writes).unwrap(),
            vec![0x04, 2, 0x03, 0x8f, 0x0a, 0x07]
        );
        assert_eq!(
            encode_read_registers(&[registers::ADSR, registers::BSR]).unwrap(),
            vec![0x05, 2, 0x02, 0x03]
        );
    }

    #[test]
    fn register_replies() {
        assert!(decode_write_registers_reply(&[!0x04, 0]).is_ok());
        assert_eq!(
            decode_write_registers_reply(&[!0x04, ugp_status::UGP_ERR_INVALID_PARAM]),
            Err(Error::InvalidParameter)
        );
        let invalid = decode_write_registers_reply(&[!0x04, ugp_status::UGP_ERR_INVALID_REG]);
        assert!(matches!(invalid, Err(Error::InvalidArgument(_))));
        assert_eq!(invalid.unwrap_err().code(), ErrorCode::Earg);
        assert!(matches!(
            decode_write_registers_reply(&[0x04, 0]),
            Err(Error::Protocol(_))
        ));

        let values = decode_read_registers_reply(&[!0x05, 0, 0x22, 0x84], &[2, 3]).unwrap();
        assert_eq!(values[0], RegisterPair { address: 2, value: 0x22 });
        assert_eq!(values[1], RegisterPair { address: 3, value: 0x84 });
    }

    #[test]
    fn abort_replies() {
        assert!(decode_abort_reply(&[!0xa0, 0], false).is_ok());
        assert!(decode_abort_reply(&[!0xa0, ugp_status::UGP_ERR_FLUSHING], true).is_ok());
        assert!(decode_abort_reply(&[!0xa0, ugp_status::UGP_ERR_FLUSHING], false).is_err());
        assert!(decode_abort_reply(&[0xa0, 0], true).is_err());
    }

    #[test]
    fn transfer_status_round_trip() {
        let status = TransferStatus {
            state: XferState::COMPLETED,
            count: 70_000,
            completion: TrailingFlags::EOI,
        };
        assert_eq!(TransferStatus::decode(&status.encode()).unwrap(), status);
    }

    #[test]
    fn interrupt_packets() {
        assert_eq!(decode_interrupt(&[0x01, 0, 0, 0]), InterruptFlags::SRQ);
        assert_eq!(
            decode_interrupt(&[0x06]),
            InterruptFlags::WRITE_COMPLETE | InterruptFlags::READ_COMPLETE
        );
    }

    #[test]
    fn bus_and_address_status() {
        let lines = decode_bus_status(registers::BSR_SRQ_BIT | registers::BSR_ATN_BIT);
        assert!(lines.contains(LineStatus::VALID_ALL | LineStatus::BUS_SRQ | LineStatus::BUS_ATN));
        assert!(!lines.contains(LineStatus::BUS_EOI));

        assert_eq!(decode_address_status(registers::HR_TA), Status::TACS);
        assert_eq!(
            decode_address_status(registers::HR_TA | registers::HR_ATN),
            Status::ATN
        );
    }

    #[test]
    fn parallel_poll_response_byte() {
        // PPE, sense 1, line 3
        assert_eq!(parallel_poll_response(0x6b, true), 0x08);
        assert_eq!(parallel_poll_response(0x6b, false), 0);
        assert_eq!(parallel_poll_response(0x00, true), 0);
        assert_eq!(parallel_poll_response(0x70, true), 0);
    }
}
