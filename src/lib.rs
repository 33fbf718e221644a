//! # Rust GPIB
//!
//! Pure Rust user-space GPIB (IEEE-488) driver for the Agilent (Keysight)
//! 82357A and 82357B USB adapters.
//!
//! The crate is layered:
//!
//! - [`codec`] encodes the adapter's bulk frames, register pairs and replies
//! - [`Agilent82357`] drives one adapter over USB and implements [`Board`]
//! - [`Board`] is the capability set a bus controller offers, with the
//!   hardware independent [`BoardState`] (status word, status queues,
//!   watchdog and bus lock)
//! - [`Gpib`] multiplexes sessions, asynchronous calls and autopolling onto
//!   the boards
//!
//! ## Usage
//!
//! To use, add the following line to your project's Cargo.toml dependencies:
//! ```toml
//! rs-gpib = "0.1"
//! ```
//!
//! ## Example
//!
//! The example below connects to the first adapter, then queries the
//! instrument at primary address 5.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use rs_gpib::{Agilent82357, Board, BoardConfig, Gpib};
//!
//! fn main() -> anyhow::Result<()> {
//!     // connect to the adapter
//!     let adapter = Agilent82357::connect((), BoardConfig::default())?;
//!     let gpib = Gpib::new(vec![Arc::new(adapter) as Arc<dyn Board>])?;
//!
//!     // open the instrument
//!     let dev = gpib.open_device(0, 5, -1)?;
//!
//!     // query it
//!     gpib.write(dev, b"*IDN?\n")?;
//!     let response = gpib.read_to_vec(dev, 256)?;
//!     println!("{}", String::from_utf8_lossy(&response));
//!
//!     gpib.close(dev)?;
//!     Ok(())
//! }
//! ```
//!

mod agilent;
mod board;
pub mod codec;
mod config;
mod constants;
mod error;
mod init;
mod session;
mod types;
mod usb;
mod communication {
    pub mod bulk;
    pub mod control;
    pub mod interrupt;
}

use rusb::DeviceDescriptor;

pub use agilent::Agilent82357;
pub use board::{Board, BoardState, StatusQueue, StatusQueues, Watchdog, WatchdogGuard};
pub use config::{BoardConfig, DeviceSettings};
pub use error::{Error, ErrorCode, Result};
pub use session::{AsyncCompletion, Gpib, SessionSettings};
pub use types::{
    Address, BoardInfo, DeviceAddr, DeviceId, DeviceInfo, EosFlags, Handle, LineStatus, Outcome,
    ReadOutcome, Status, Timeout,
};
pub use usb::{UsbDevice, UsbLink};

/// Device filter
pub trait DeviceFilter {
    fn apply_filter<T: rusb::UsbContext>(
        &self,
        device: &rusb::Device<T>,
        device_desc: &DeviceDescriptor,
    ) -> bool;
}
