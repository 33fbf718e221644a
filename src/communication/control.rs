//! ## Control
//!
//! Vendor requests sent to the adapter on the control endpoint. These do not
//! go through the bulk pipe, so they can be issued while a bulk transfer is
//! in flight.
//!

use std::time::Duration;

use crate::codec::{self, TransferStatus};
use crate::constants::control_requests;
use crate::error::Result;
use crate::usb::UsbLink;

use log::debug;

fn vendor_request_type() -> u8 {
    rusb::request_type(
        rusb::Direction::In,
        rusb::RequestType::Vendor,
        rusb::Recipient::Device,
    )
}

/// ### Transfer Abort
///
/// Abort the transfer the adapter is working on.
///
/// #### Arguments
/// - `link` -> the USB link to the adapter
/// - `flush` -> also flush the data the adapter has buffered
/// - `timeout` -> how long to wait for the acknowledgement
///
pub fn xfer_abort<L: UsbLink + ?Sized>(link: &L, flush: bool, timeout: Duration) -> Result<()> {
    let w_index: u16 = if flush { control_requests::XA_FLUSH } else { 0x0000 };
    let mut buffer = [0x00; control_requests::XFER_ABORT_REPLY_SIZE];

    // execute the request
    let count = link.read_control(
        vendor_request_type(),
        control_requests::CONTROL_REQUEST,
        control_requests::XFER_ABORT,
        w_index,
        &mut buffer,
        timeout,
    )?;
    debug!("transfer abort (flush: {flush}) acknowledged with {:02x?}", &buffer[..count]);

    codec::decode_abort_reply(&buffer[..count], flush)
}

/// ### Transfer Status
///
/// Query the state and byte count of the last transfer.
///
pub fn xfer_status<L: UsbLink + ?Sized>(link: &L, timeout: Duration) -> Result<TransferStatus> {
    let mut buffer = [0x00; control_requests::XFER_STATUS_REPLY_SIZE];

    let count = link.read_control(
        vendor_request_type(),
        control_requests::CONTROL_REQUEST,
        control_requests::XFER_STATUS,
        0x0000,
        &mut buffer,
        timeout,
    )?;

    TransferStatus::decode(&buffer[..count])
}
