//! ## Initialization
//!
//! A set of functions to help find an adapter and open a connection to it.
//!

use crate::{
    constants::usb::*,
    error::Error,
    types::{AdapterEndpoints, DeviceAddr, DeviceId, DeviceInfo, DeviceMode, Endpoint},
    DeviceFilter,
};

use anyhow::Result;
use log::{info, warn};
use rusb::{Context, Device, DeviceDescriptor, DeviceHandle, Direction, TransferType, UsbContext};

/// Get first found adapter
impl DeviceFilter for () {
    fn apply_filter<T: UsbContext>(
        &self,
        _device: &Device<T>,
        _device_desc: &DeviceDescriptor,
    ) -> bool {
        true
    }
}

/// Get adapter by USB device address
impl DeviceFilter for DeviceAddr {
    fn apply_filter<T: UsbContext>(
        &self,
        device: &Device<T>,
        _device_desc: &DeviceDescriptor,
    ) -> bool {
        self.bus == device.bus_number() && self.device == device.address()
    }
}

/// Get adapter by USB device address (bus, address)
impl DeviceFilter for (u8, u8) {
    fn apply_filter<T: UsbContext>(
        &self,
        device: &Device<T>,
        _device_desc: &DeviceDescriptor,
    ) -> bool {
        self.0 == device.bus_number() && self.1 == device.address()
    }
}

/// Get adapter by USB identifiers
impl DeviceFilter for DeviceId {
    fn apply_filter<T: UsbContext>(
        &self,
        _device: &Device<T>,
        device_desc: &DeviceDescriptor,
    ) -> bool {
        self.vendor_id == device_desc.vendor_id() && self.product_id == device_desc.product_id()
    }
}

/// Get adapter by info (both USB identifiers and address)
impl DeviceFilter for DeviceInfo {
    fn apply_filter<T: UsbContext>(
        &self,
        device: &Device<T>,
        device_desc: &DeviceDescriptor,
    ) -> bool {
        self.id.apply_filter(device, device_desc) && self.address.apply_filter(device, device_desc)
    }
}

/// Allow apply filter by reference
impl<T: DeviceFilter> DeviceFilter for &T {
    fn apply_filter<X: UsbContext>(
        &self,
        device: &Device<X>,
        device_desc: &DeviceDescriptor,
    ) -> bool {
        (**self).apply_filter(device, device_desc)
    }
}

/// Adapter with its firmware loaded
fn is_adapter(device_desc: &DeviceDescriptor) -> bool {
    device_desc.vendor_id() == AGILENT_VENDOR_ID
        && matches!(
            device_desc.product_id(),
            AGILENT_82357A_PRODUCT_ID | AGILENT_82357B_PRODUCT_ID
        )
}

/// Adapter still waiting for its firmware
fn is_preinit_adapter(device_desc: &DeviceDescriptor) -> bool {
    device_desc.vendor_id() == AGILENT_VENDOR_ID
        && matches!(
            device_desc.product_id(),
            AGILENT_82357A_PREINIT_PRODUCT_ID | AGILENT_82357B_PREINIT_PRODUCT_ID
        )
}

/// ### List Devices
///
/// List all adapters using a libusb context.
///
pub fn list_devices<T: UsbContext>(context: &mut T) -> Result<Vec<DeviceInfo>> {
    Ok(context
        .devices()?
        .iter()
        .filter_map(|device| {
            let device_desc = device.device_descriptor().ok()?;
            if is_preinit_adapter(&device_desc) {
                warn!(
                    "adapter at {}:{} has no firmware loaded, skipping",
                    device.bus_number(),
                    device.address()
                );
            }
            if is_adapter(&device_desc) {
                Some(DeviceInfo {
                    id: DeviceId {
                        vendor_id: device_desc.vendor_id(),
                        product_id: device_desc.product_id(),
                    },
                    address: DeviceAddr {
                        bus: device.bus_number(),
                        device: device.address(),
                    },
                })
            } else {
                None
            }
        })
        .collect())
}

/// ### Open Device
///
/// Open the first adapter accepted by `filter`.
///
pub fn open_device<T: UsbContext>(
    context: &mut T,
    filter: impl DeviceFilter,
) -> Result<(Device<T>, DeviceHandle<T>, u16)> {
    // list the devices
    let devices = context.devices()?;

    // find the one device we want and open it
    for device in devices.iter() {
        // get the descriptor
        if let Ok(device_desc) = device.device_descriptor() {
            // check the IDs
            if is_adapter(&device_desc) && filter.apply_filter(&device, &device_desc) {
                // try open the device
                if let Ok(handle) = device.open() {
                    info!(
                        "opened adapter {:04x}:{:04x} at {}:{}",
                        device_desc.vendor_id(),
                        device_desc.product_id(),
                        device.bus_number(),
                        device.address()
                    );
                    return Ok((device, handle, device_desc.product_id()));
                }
            }
        }
    }

    Err(Error::DeviceNotFound.into())
}

/// ### Get Adapter Mode
///
/// Get the device mode (configuration, interface and interface setting) carrying the adapter's three pipes.
///
pub fn get_adapter_mode(device: &Device<Context>) -> Result<DeviceMode> {
    // get the device descriptor
    let device_desc = device.device_descriptor()?;

    // go through the configurations
    for n in 0..device_desc.num_configurations() {
        // get the config descriptor
        let config_desc = device.config_descriptor(n)?;
        // go through the interfaces
        for interface in config_desc.interfaces() {
            for interface_desc in interface.descriptors() {
                // bulk out, bulk in and interrupt in
                if interface_desc.num_endpoints() >= 3 {
                    return Ok(DeviceMode {
                        config_number: config_desc.number(),
                        interface_number: interface_desc.interface_number(),
                        setting_number: interface_desc.setting_number(),
                        has_kernel_driver: false,
                    });
                }
            }
        }
    }

    Err(Error::DeviceIncompatible.into())
}

/// ### Detach Kernel Driver
///
/// If the interface uses a kernel driver, detach it for the duration of the program.
///
pub fn detach_kernel_driver(
    mode: &mut DeviceMode,
    handle: &mut DeviceHandle<Context>,
) -> Result<()> {
    mode.has_kernel_driver = match handle.kernel_driver_active(mode.interface_number) {
        Ok(true) => {
            handle.detach_kernel_driver(mode.interface_number)?;
            true
        }
        _ => false,
    };

    Ok(())
}

/// ### Get Endpoints
///
/// Get the adapter endpoints, with their max packet sizes, from the interface descriptor.
///
pub fn get_endpoints(mode: &DeviceMode, device: &Device<Context>) -> Result<AdapterEndpoints> {
    // Endpoints list
    let mut endpoints_list: Vec<Endpoint> = Vec::new();

    // get the config descriptor
    let device_desc = device.device_descriptor()?;
    let config_desc = (0..device_desc.num_configurations())
        .filter_map(|n| device.config_descriptor(n).ok())
        .find(|config| config.number() == mode.config_number)
        .ok_or(Error::InterfaceNotFound)?;
    // get the interface
    let interface = match config_desc
        .interfaces()
        .find(|inter| inter.number() == mode.interface_number)
    {
        Some(i) => i,
        None => return Err(Error::InterfaceNotFound.into()),
    };
    // get the interface descriptor (setting)
    let interface_desc = match interface
        .descriptors()
        .find(|d| d.setting_number() == mode.setting_number)
    {
        Some(desc) => desc,
        None => return Err(Error::InterfaceNotFound.into()),
    };

    // With the descriptor, we can now iterate through the endpoints
    for endpoint in interface_desc.endpoint_descriptors() {
        endpoints_list.push(Endpoint {
            address: endpoint.address(),
            max_packet_size: endpoint.max_packet_size(),
            transfer_type: endpoint.transfer_type(),
            direction: endpoint.direction(),
        })
    }

    // Go through the list and identify the specific endpoints
    let find = |transfer_type: TransferType, direction: Direction, name: &'static str| {
        endpoints_list
            .iter()
            .find(|ep| ep.transfer_type == transfer_type && ep.direction == direction)
            .cloned()
            .ok_or(Error::EndpointNotFound(name))
    };

    Ok(AdapterEndpoints {
        bulk_out: find(TransferType::Bulk, Direction::Out, "bulk out")?,
        bulk_in: find(TransferType::Bulk, Direction::In, "bulk in")?,
        interrupt_in: find(TransferType::Interrupt, Direction::In, "interrupt in")?,
    })
}
