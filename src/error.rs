//! ## GPIB Errors
//!
//! The errors used throughout the crate, and the classic error codes they map to.
//!

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    // codec and firmware level
    #[error("adapter rejected the command")]
    InvalidCommand,
    #[error("adapter rejected a parameter")]
    InvalidParameter,
    #[error("register 0x{0:02x} does not exist on the adapter")]
    InvalidRegister(u8),
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("invalid GPIB address")]
    InvalidAddress,
    #[error("operation not supported by the adapter")]
    Unsupported,
    #[error("protocol error: {0}")]
    Protocol(String),

    // bus level
    #[error("GPIB read failed")]
    BusRead,
    #[error("GPIB write failed")]
    BusWrite,
    #[error("board is not addressed")]
    BusNotAddressed,
    #[error("no active controller on the bus")]
    DeadBus,
    #[error("board is not controller in charge")]
    NotControllerInCharge,
    #[error("board is not system controller")]
    NotSystemController,

    // transaction life cycle
    #[error("operation timed out")]
    Timeout,
    #[error("operation aborted")]
    Aborted,
    #[error("I/O operation in progress")]
    IoInProgress,

    // session level
    #[error("lost status byte")]
    LostStatusByte,
    #[error("stuck service request")]
    StuckServiceRequest,
    #[error("non-existent board")]
    NonexistentBoard,
    #[error("non-existent device handle")]
    NonexistentDevice,
    #[error("board is offline")]
    Offline,
    #[error("descriptor table is full")]
    TableFull,
    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),

    // usb and discovery
    #[error("usb error: {0}")]
    Usb(#[from] rusb::Error),
    #[error("device not found")]
    DeviceNotFound,
    #[error("device is not an Agilent 82357 adapter")]
    DeviceIncompatible,
    #[error("specified interface not found")]
    InterfaceNotFound,
    #[error("{0} endpoint not found")]
    EndpointNotFound(&'static str),
}

/// ### Error Code
///
/// The classic `iberr` values handed back to callers.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    Edvr = 0,
    Ecic = 1,
    Enol = 2,
    Eadr = 3,
    Earg = 4,
    Esac = 5,
    Eabo = 6,
    Eneb = 7,
    Edma = 8,
    Eoip = 10,
    Ecap = 11,
    Efso = 12,
    Ebus = 14,
    Estb = 15,
    Esrq = 16,
    Etab = 20,
}

impl ErrorCode {
    pub fn description(&self) -> &'static str {
        match self {
            ErrorCode::Edvr => "EDVR 0: OS error",
            ErrorCode::Ecic => "ECIC 1: Board not controller in charge",
            ErrorCode::Enol => "ENOL 2: No listeners",
            ErrorCode::Eadr => "EADR 3: Improper addressing",
            ErrorCode::Earg => "EARG 4: Bad argument",
            ErrorCode::Esac => "ESAC 5: Board not system controller",
            ErrorCode::Eabo => "EABO 6: Operation aborted",
            ErrorCode::Eneb => "ENEB 7: Non-existent board",
            ErrorCode::Edma => "EDMA 8: DMA error",
            ErrorCode::Eoip => "EOIP 10: IO operation in progress",
            ErrorCode::Ecap => "ECAP 11: Capability does not exist",
            ErrorCode::Efso => "EFSO 12: File system error",
            ErrorCode::Ebus => "EBUS 14: Bus error",
            ErrorCode::Estb => "ESTB 15: Lost status byte",
            ErrorCode::Esrq => "ESRQ 16: Stuck service request",
            ErrorCode::Etab => "ETAB 20: Table problem",
        }
    }
}

impl Error {
    /// Classic error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::InvalidArgument(_) | Error::InvalidParameter => ErrorCode::Earg,
            Error::InvalidCommand | Error::InvalidRegister(_) | Error::Unsupported => {
                ErrorCode::Ecap
            }
            Error::InvalidAddress | Error::BusNotAddressed => ErrorCode::Eadr,
            Error::BusRead | Error::BusWrite | Error::DeadBus => ErrorCode::Ebus,
            Error::NotControllerInCharge => ErrorCode::Ecic,
            Error::NotSystemController => ErrorCode::Esac,
            Error::Timeout | Error::Aborted => ErrorCode::Eabo,
            Error::IoInProgress => ErrorCode::Eoip,
            Error::LostStatusByte => ErrorCode::Estb,
            Error::StuckServiceRequest => ErrorCode::Esrq,
            Error::NonexistentBoard | Error::Offline => ErrorCode::Eneb,
            Error::NonexistentDevice => ErrorCode::Earg,
            Error::TableFull => ErrorCode::Etab,
            Error::Protocol(_)
            | Error::Spawn(_)
            | Error::Usb(_)
            | Error::DeviceNotFound
            | Error::DeviceIncompatible
            | Error::InterfaceNotFound
            | Error::EndpointNotFound(_) => ErrorCode::Edvr,
        }
    }

    /// True when the error leaves TIMO set in the status word
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }
}
