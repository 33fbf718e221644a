//! ## Configuration
//!
//! Board defaults and the per-session settings inherited from them.
//!

use crate::constants::misc;
use crate::types::{EosFlags, Timeout};

/// ### Board Config
///
/// Settings applied when a board is attached.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardConfig {
    /// Primary address of the interface board
    pub pad: u8,
    /// Secondary address of the interface board
    pub sad: Option<u8>,
    /// Largest chunk handed to the adapter in one transfer
    pub buffer_length: usize,
    /// Serial poll bytes kept per device before the oldest is dropped
    pub status_queue_capacity: usize,
    /// Request system control on attach
    pub system_controller: bool,
    /// Start the autopoll task on attach
    pub autopoll: bool,
    /// Settings every new session starts from
    pub device_defaults: DeviceSettings,
}

impl Default for BoardConfig {
    fn default() -> Self {
        BoardConfig {
            pad: 0,
            sad: None,
            buffer_length: misc::DEFAULT_BUFFER_LENGTH,
            status_queue_capacity: misc::DEFAULT_STATUS_QUEUE_CAPACITY,
            system_controller: true,
            autopoll: true,
            device_defaults: DeviceSettings::default(),
        }
    }
}

/// ### Device Settings
///
/// Software settings of one session. A snapshot taken at open time is
/// restored when the session is brought back online.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSettings {
    pub timeout: Timeout,
    pub spoll_timeout: Timeout,
    pub ppoll_timeout: Timeout,
    pub eos: u8,
    pub eos_flags: EosFlags,
    /// Current parallel poll configuration byte
    pub ppoll_config: u8,
    /// Assert EOI with the last byte of a write
    pub send_eoi: bool,
    /// Send local lockout when the session is brought online
    pub local_lockout: bool,
    /// Allow local configuration of the board's parallel poll response
    pub local_ppc: bool,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        DeviceSettings {
            timeout: Timeout::from_duration(Some(misc::DEFAULT_TIMEOUT_DURATION)),
            spoll_timeout: Timeout::from_duration(Some(misc::DEFAULT_SPOLL_TIMEOUT_DURATION)),
            ppoll_timeout: Timeout::from_duration(Some(misc::DEFAULT_PPOLL_TIMEOUT_DURATION)),
            eos: 0,
            eos_flags: EosFlags::empty(),
            ppoll_config: 0,
            send_eoi: true,
            local_lockout: false,
            local_ppc: false,
        }
    }
}
