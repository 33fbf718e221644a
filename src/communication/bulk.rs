//! Bulk
//!
//! Low level functions to send frames to the BULK OUT endpoint and receive
//! replies from the BULK IN endpoint.
//!

use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::Endpoint;
use crate::usb::{usb_timeout, UsbLink};

use log::trace;
use rusb::{Direction, TransferType};

/// ### Bulk Transfer
///
/// Bookkeeping of one transaction on a bulk pipe.
///
#[derive(Debug, Default)]
pub struct BulkTransfer {
    /// Bytes handed to (or room offered to) the adapter
    pub expected: usize,
    /// Bytes actually moved
    pub actual: usize,
    /// Failure reported by the USB stack
    pub result: Option<Error>,
    /// The timeout expired before the transfer finished
    pub timed_out: bool,
    /// The transfer finished, successfully or not
    pub triggered: bool,
}

impl BulkTransfer {
    fn new(expected: usize) -> BulkTransfer {
        BulkTransfer {
            expected,
            ..BulkTransfer::default()
        }
    }

    fn complete(&mut self, outcome: rusb::Result<usize>) {
        match outcome {
            Ok(actual) => {
                self.actual = actual;
                self.triggered = true;
            }
            Err(rusb::Error::Timeout) => self.timed_out = true,
            Err(e) => {
                self.result = Some(e.into());
                self.triggered = true;
            }
        }
    }

    /// Byte count of a finished transfer, or why it did not finish
    pub fn into_result(self) -> Result<usize> {
        if self.timed_out {
            return Err(Error::Timeout);
        }
        match self.result {
            Some(e) => Err(e),
            None => Ok(self.actual),
        }
    }
}

fn check_endpoint(endpoint: &Endpoint, direction: Direction) -> Result<()> {
    if endpoint.direction != direction || endpoint.transfer_type != TransferType::Bulk {
        return Err(Error::EndpointNotFound(match direction {
            Direction::Out => "bulk out",
            Direction::In => "bulk in",
        }));
    }
    Ok(())
}

/// ### Send
///
/// Write one frame to the BULK OUT endpoint.
///
/// #### Arguments
/// - `link` -> the USB link to the adapter
/// - `endpoint` -> the BULK OUT endpoint
/// - `frame` -> the encoded frame
/// - `timeout` -> time left for the transfer, `None` to wait forever
///
pub fn send<L: UsbLink + ?Sized>(
    link: &L,
    endpoint: &Endpoint,
    frame: &[u8],
    timeout: Option<Duration>,
) -> Result<BulkTransfer> {
    check_endpoint(endpoint, Direction::Out)?;
    trace!("bulk out {:02x?}", frame);

    let mut transfer = BulkTransfer::new(frame.len());
    transfer.complete(link.write_bulk(endpoint.address, frame, usb_timeout(timeout)));

    // a short write leaves the adapter waiting for the rest of the frame
    if transfer.triggered && transfer.result.is_none() && transfer.actual != transfer.expected {
        transfer.result = Some(Error::Protocol(format!(
            "short bulk write ({} of {} bytes)",
            transfer.actual, transfer.expected
        )));
    }

    Ok(transfer)
}

/// ### Receive
///
/// Read one reply from the BULK IN endpoint into `buffer`.
///
/// #### Arguments
/// - `link` -> the USB link to the adapter
/// - `endpoint` -> the BULK IN endpoint
/// - `buffer` -> room for the reply
/// - `timeout` -> time left for the transfer, `None` to wait forever
///
pub fn receive<L: UsbLink + ?Sized>(
    link: &L,
    endpoint: &Endpoint,
    buffer: &mut [u8],
    timeout: Option<Duration>,
) -> Result<BulkTransfer> {
    check_endpoint(endpoint, Direction::In)?;

    let mut transfer = BulkTransfer::new(buffer.len());
    transfer.complete(link.read_bulk(endpoint.address, buffer, usb_timeout(timeout)));
    if transfer.triggered && transfer.result.is_none() {
        trace!("bulk in {:02x?}", &buffer[..transfer.actual]);
    }

    Ok(transfer)
}
