//! ## USB
//!
//! The USB seam of the driver. The transport only ever talks to a
//! [`UsbLink`]; [`UsbDevice`] is the libusb backed implementation.
//!

use std::time::Duration;

use log::warn;
use rusb::{Context, DeviceHandle};

#[cfg(test)]
pub(crate) mod mock;

/// ### USB Link
///
/// The four USB primitives the adapter protocol is built on. Every call
/// blocks at most `timeout`; a zero timeout blocks until the transfer ends.
///
pub trait UsbLink: Send + Sync + 'static {
    fn write_bulk(&self, endpoint: u8, data: &[u8], timeout: Duration) -> rusb::Result<usize>;

    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize>;

    fn read_interrupt(&self, endpoint: u8, buf: &mut [u8], timeout: Duration)
        -> rusb::Result<usize>;

    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize>;
}

/// Allow sharing a link with the interrupt listener
impl<L: UsbLink> UsbLink for std::sync::Arc<L> {
    fn write_bulk(&self, endpoint: u8, data: &[u8], timeout: Duration) -> rusb::Result<usize> {
        (**self).write_bulk(endpoint, data, timeout)
    }

    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize> {
        (**self).read_bulk(endpoint, buf, timeout)
    }

    fn read_interrupt(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        (**self).read_interrupt(endpoint, buf, timeout)
    }

    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        (**self).read_control(request_type, request, value, index, buf, timeout)
    }
}

/// Convert an optional deadline budget into a libusb timeout.
///
/// `None` maps to zero (no timeout), anything else is kept at 1ms or more so a
/// nearly expired budget never turns into an infinite wait.
pub fn usb_timeout(remaining: Option<Duration>) -> Duration {
    match remaining {
        None => Duration::ZERO,
        Some(d) => d.max(Duration::from_millis(1)),
    }
}

/// ### USB Device
///
/// An opened and claimed adapter interface.
///
#[derive(Debug)]
pub struct UsbDevice {
    handle: DeviceHandle<Context>,
    interface_number: u8,
    has_kernel_driver: bool,
}

impl UsbDevice {
    pub fn new(handle: DeviceHandle<Context>, interface_number: u8, has_kernel_driver: bool) -> Self {
        UsbDevice {
            handle,
            interface_number,
            has_kernel_driver,
        }
    }
}

impl UsbLink for UsbDevice {
    fn write_bulk(&self, endpoint: u8, data: &[u8], timeout: Duration) -> rusb::Result<usize> {
        self.handle.write_bulk(endpoint, data, timeout)
    }

    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize> {
        self.handle.read_bulk(endpoint, buf, timeout)
    }

    fn read_interrupt(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        self.handle.read_interrupt(endpoint, buf, timeout)
    }

    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        self.handle
            .read_control(request_type, request, value, index, buf, timeout)
    }
}

impl Drop for UsbDevice {
    fn drop(&mut self) {
        // Release the interface
        if let Err(e) = self.handle.release_interface(self.interface_number) {
            warn!("failed to release adapter usb interface: {e}");
        }
        // Reattach the kernel driver if it was disconnected
        if self.has_kernel_driver {
            if let Err(e) = self.handle.attach_kernel_driver(self.interface_number) {
                warn!("failed to attach kernel driver to adapter: {e}");
            }
        }
    }
}
