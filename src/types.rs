//! ## Types
//!
//! The different types used across the crate
//!

use std::time::Duration;

use bitflags::bitflags;
use rusb::{Direction, TransferType};

use crate::constants::misc::MAX_ADDRESS;
use crate::error::{Error, ErrorCode, Result};

bitflags! {
    /// ### Status
    ///
    /// The board/session status word (`ibsta`).
    ///
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Status: u32 {
        /// device clear active
        const DCAS = 0x1;
        /// device trigger active
        const DTAS = 0x2;
        /// listener addressed
        const LACS = 0x4;
        /// talker addressed
        const TACS = 0x8;
        const ATN = 0x10;
        /// controller in charge
        const CIC = 0x20;
        const REM = 0x40;
        const LOK = 0x80;
        /// I/O complete
        const CMPL = 0x100;
        const EVENT = 0x200;
        /// serial poll active
        const SPOLL = 0x400;
        /// device requesting service
        const RQS = 0x800;
        /// SRQ line asserted
        const SRQI = 0x1000;
        const END = 0x2000;
        const TIMO = 0x4000;
        const ERR = 0x8000;
    }
}

impl Status {
    /// Bits a device (non board) session is allowed to see
    pub const DEVICE_MASK: Status = Status::CMPL
        .union(Status::END)
        .union(Status::TIMO)
        .union(Status::ERR)
        .union(Status::RQS);

    /// Bits owned by the session rather than the board
    pub const SESSION_BITS: Status = Status::CMPL
        .union(Status::END)
        .union(Status::TIMO)
        .union(Status::ERR)
        .union(Status::RQS);
}

bitflags! {
    /// ### Line Status
    ///
    /// State of the bus management lines as reported by `iblines`.
    ///
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct LineStatus: u16 {
        const VALID_DAV = 0x1;
        const VALID_NDAC = 0x2;
        const VALID_NRFD = 0x4;
        const VALID_IFC = 0x8;
        const VALID_REN = 0x10;
        const VALID_SRQ = 0x20;
        const VALID_ATN = 0x40;
        const VALID_EOI = 0x80;
        const BUS_DAV = 0x100;
        const BUS_NDAC = 0x200;
        const BUS_NRFD = 0x400;
        const BUS_IFC = 0x800;
        const BUS_REN = 0x1000;
        const BUS_SRQ = 0x2000;
        const BUS_ATN = 0x4000;
        const BUS_EOI = 0x8000;
    }
}

impl LineStatus {
    pub const VALID_ALL: LineStatus = LineStatus::from_bits_truncate(0xff);
}

bitflags! {
    /// ### EOS Flags
    ///
    /// End-of-string modes, as passed to `ibeos`.
    ///
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EosFlags: u16 {
        /// terminate reads on the EOS character
        const REOS = 0x400;
        /// assert EOI when the EOS character is written
        const XEOS = 0x800;
        /// compare all 8 bits of the EOS character
        const BIN = 0x1000;
    }
}

/// ### Address
///
/// A validated primary/secondary GPIB address pair.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    /// Primary address, 0 to 30
    pub pad: u8,
    /// Secondary address, 0 to 30, `None` when disabled
    pub sad: Option<u8>,
}

impl Address {
    /// ### New
    ///
    /// Validate an address pair. A negative secondary address disables it.
    ///
    pub fn new(pad: i32, sad: i32) -> Result<Address> {
        if !(0..=MAX_ADDRESS as i32).contains(&pad) {
            return Err(Error::InvalidAddress);
        }
        let sad = match sad {
            s if s < 0 => None,
            s if s <= MAX_ADDRESS as i32 => Some(s as u8),
            _ => return Err(Error::InvalidAddress),
        };

        Ok(Address {
            pad: pad as u8,
            sad,
        })
    }

    /// Secondary address in the signed convention (-1 when disabled)
    pub fn sad_raw(&self) -> i32 {
        self.sad.map_or(-1, i32::from)
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.sad {
            Some(sad) => write!(f, "{}:{}", self.pad, sad),
            None => write!(f, "{}", self.pad),
        }
    }
}

/// ### Timeout
///
/// The classic timeout codes. `TNone` waits forever.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timeout {
    TNone,
    T10us,
    T30us,
    T100us,
    T300us,
    T1ms,
    T3ms,
    T10ms,
    T30ms,
    T100ms,
    T300ms,
    T1s,
    T3s,
    T10s,
    T30s,
    T100s,
    T300s,
    T1000s,
}

impl Timeout {
    const ALL: [Timeout; 18] = [
        Timeout::TNone,
        Timeout::T10us,
        Timeout::T30us,
        Timeout::T100us,
        Timeout::T300us,
        Timeout::T1ms,
        Timeout::T3ms,
        Timeout::T10ms,
        Timeout::T30ms,
        Timeout::T100ms,
        Timeout::T300ms,
        Timeout::T1s,
        Timeout::T3s,
        Timeout::T10s,
        Timeout::T30s,
        Timeout::T100s,
        Timeout::T300s,
        Timeout::T1000s,
    ];

    /// Timeout for a classic code (0 = TNONE .. 17 = T1000s)
    pub fn from_code(code: i32) -> Result<Timeout> {
        usize::try_from(code)
            .ok()
            .and_then(|i| Timeout::ALL.get(i).copied())
            .ok_or(Error::InvalidArgument("timeout code out of range"))
    }

    pub fn code(&self) -> i32 {
        *self as i32
    }

    /// The duration, or `None` for an infinite wait
    pub fn duration(&self) -> Option<Duration> {
        let usec: u64 = match self {
            Timeout::TNone => return None,
            Timeout::T10us => 10,
            Timeout::T30us => 30,
            Timeout::T100us => 100,
            Timeout::T300us => 300,
            Timeout::T1ms => 1_000,
            Timeout::T3ms => 3_000,
            Timeout::T10ms => 10_000,
            Timeout::T30ms => 30_000,
            Timeout::T100ms => 100_000,
            Timeout::T300ms => 300_000,
            Timeout::T1s => 1_000_000,
            Timeout::T3s => 3_000_000,
            Timeout::T10s => 10_000_000,
            Timeout::T30s => 30_000_000,
            Timeout::T100s => 100_000_000,
            Timeout::T300s => 300_000_000,
            Timeout::T1000s => 1_000_000_000,
        };
        Some(Duration::from_micros(usec))
    }

    /// Smallest code whose duration is at least `duration`
    pub fn from_duration(duration: Option<Duration>) -> Timeout {
        match duration {
            None => Timeout::TNone,
            Some(d) => Timeout::ALL[1..]
                .iter()
                .copied()
                .find(|t| t.duration().is_some_and(|td| td >= d))
                .unwrap_or(Timeout::T1000s),
        }
    }
}

/// ### Read Outcome
///
/// What a board read produced.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadOutcome {
    /// Number of bytes placed in the caller's buffer
    pub count: usize,
    /// The read ended on EOI or the EOS character
    pub end: bool,
}

/// ### Outcome
///
/// The status/error/count triple every call produces.
///
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Outcome {
    pub status: Status,
    pub error: Option<Error>,
    pub count: usize,
}

impl Outcome {
    /// Build the triple from a session status and an operation result.
    pub fn from_result(mut status: Status, result: &Result<usize>) -> Outcome {
        match result {
            Ok(count) => Outcome {
                status,
                error: None,
                count: *count,
            },
            Err(e) => {
                status |= Status::ERR;
                if e.is_timeout() {
                    status |= Status::TIMO;
                }
                Outcome {
                    status,
                    error: Some(e.clone()),
                    count: 0,
                }
            }
        }
    }

    /// Classic error code, if any
    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error.as_ref().map(Error::code)
    }
}

/// ### Board Info
///
/// Snapshot of the board-wide configuration (`IBBOARD_INFO`).
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardInfo {
    pub pad: u8,
    pub sad: Option<u8>,
    pub parallel_poll_configuration: u8,
    pub autopolling: bool,
    pub is_system_controller: bool,
    pub t1_delay: u32,
    pub ist: bool,
    pub no_7_bit_eos: bool,
}

/// ### Device Id
///
/// USB identifiers of an adapter.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId {
    pub vendor_id: u16,
    pub product_id: u16,
}

/// ### Device Address
///
/// Location of an adapter on the USB bus.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceAddr {
    pub bus: u8,
    pub device: u8,
}

/// ### Device Info
///
/// Identifiers and location of an attached adapter.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub address: DeviceAddr,
}

/// ### Device Mode
///
/// The configuration and interface the adapter is driven through. Also if the interface has a kernel driver attached.
///
#[derive(Debug, Clone, Default)]
pub struct DeviceMode {
    /// The USB configuration number
    pub config_number: u8,
    /// The interface number specific to the configuration
    pub interface_number: u8,
    /// The setting number specific to the interface
    pub setting_number: u8,
    /// If the device has a kernel driver. Important for returning control to the OS (on Linux).
    pub has_kernel_driver: bool,
}

/// ### Endpoint
///
/// Properties of an endpoint.
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    /// Address of the endpoint on the interface
    pub address: u8,
    /// The maximal size a packet can have on this endpoint
    pub max_packet_size: u16,
    /// The transfer type of the endpoint (Bulk or Interrupt)
    pub transfer_type: TransferType,
    /// The direction of the endpoint
    pub direction: Direction,
}

/// ### Adapter Endpoints
///
/// The three pipes of the adapter protocol.
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdapterEndpoints {
    /// Commands and write data
    pub bulk_out: Endpoint,
    /// Read data and register replies
    pub bulk_in: Endpoint,
    /// Completion and SRQ notifications
    pub interrupt_in: Endpoint,
}

impl AdapterEndpoints {
    /// Endpoints of a given product when the descriptors cannot be read
    pub fn for_product(product_id: u16) -> AdapterEndpoints {
        use crate::constants::usb::*;

        let (bulk_out, interrupt_in) = match product_id {
            AGILENT_82357A_PRODUCT_ID => (
                AGILENT_82357A_BULK_OUT_ENDPOINT,
                AGILENT_82357A_INTERRUPT_IN_ENDPOINT,
            ),
            _ => (
                AGILENT_82357B_BULK_OUT_ENDPOINT,
                AGILENT_82357B_INTERRUPT_IN_ENDPOINT,
            ),
        };
        AdapterEndpoints {
            bulk_out: Endpoint {
                address: bulk_out,
                max_packet_size: 512,
                transfer_type: TransferType::Bulk,
                direction: Direction::Out,
            },
            bulk_in: Endpoint {
                address: BULK_IN_ENDPOINT,
                max_packet_size: 512,
                transfer_type: TransferType::Bulk,
                direction: Direction::In,
            },
            interrupt_in: Endpoint {
                address: interrupt_in,
                max_packet_size: 4,
                transfer_type: TransferType::Interrupt,
                direction: Direction::In,
            },
        }
    }
}

/// Handle identifying an open session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(pub i32);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_addresses_are_accepted() {
        for pad in 0..=30 {
            assert!(Address::new(pad, -1).is_ok());
            for sad in 0..=30 {
                let addr = Address::new(pad, sad).unwrap();
                assert_eq!(addr.pad as i32, pad);
                assert_eq!(addr.sad, Some(sad as u8));
            }
        }
        assert_eq!(Address::new(4, -7).unwrap().sad, None);
    }

    #[test]
    fn out_of_range_addresses_are_rejected() {
        assert_eq!(Address::new(31, -1), Err(Error::InvalidAddress));
        assert_eq!(Address::new(-1, -1), Err(Error::InvalidAddress));
        assert_eq!(Address::new(0, 31), Err(Error::InvalidAddress));
        assert_eq!(Address::new(0, 0x60), Err(Error::InvalidAddress));
    }

    #[test]
    fn timeout_codes() {
        assert_eq!(Timeout::from_code(0).unwrap().duration(), None);
        assert_eq!(
            Timeout::from_code(11).unwrap().duration(),
            Some(Duration::from_secs(1))
        );
        assert!(Timeout::from_code(18).is_err());
        assert_eq!(
            Timeout::from_duration(Some(Duration::from_millis(20))),
            Timeout::T30ms
        );
        assert_eq!(Timeout::from_duration(None), Timeout::TNone);
    }

    #[test]
    fn outcome_marks_timeouts() {
        let outcome = Outcome::from_result(Status::CMPL, &Err(Error::Timeout));
        assert!(outcome.status.contains(Status::ERR | Status::TIMO));
        assert_eq!(outcome.error_code(), Some(ErrorCode::Eabo));

        let outcome = Outcome::from_result(Status::CMPL | Status::END, &Ok(12));
        assert_eq!(outcome.count, 12);
        assert!(outcome.error.is_none());
    }
}
