//! Types shared between the driver and its callers
//!
//! These are the values that cross the driver boundary: the opaque device
//! handle, the events delivered to the user callback, and the read-only
//! information exposed about an installed device.

use serde::{Deserialize, Serialize};

/// Opaque handle to an installed mass storage device
///
/// Returned by a successful device install and used for every subsequent
/// call on that device. The handle stays valid until the device is
/// uninstalled; afterwards every call with it fails with an invalid-argument
/// error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceHandle(pub u32);

/// Bulk endpoint direction, relative to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Device to host
    In,
    /// Host to device
    Out,
}

impl Direction {
    /// Direction bit of an endpoint address (bit 7 set means IN)
    pub const ENDPOINT_DIR_MASK: u8 = 0x80;

    /// Classify an endpoint address by its direction bit
    pub fn of_endpoint(address: u8) -> Self {
        if address & Self::ENDPOINT_DIR_MASK != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

/// Event delivered to the user callback
///
/// Only fully classified mass storage events are ever surfaced; raw host
/// library notifications never reach the callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MscEvent {
    /// A device exposing a SCSI Bulk-Only interface was attached
    DeviceConnected {
        /// Bus address to pass to device install
        address: u8,
    },
    /// An installed mass storage device was detached
    DeviceDisconnected {
        /// Handle of the installed device; it must still be uninstalled
        handle: DeviceHandle,
    },
}

/// Endpoint configuration extracted from the active configuration descriptor
///
/// Derived once at install time and immutable afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MscConfig {
    /// bInterfaceNumber of the Bulk-Only interface
    pub iface_num: u8,
    /// bAlternateSetting of the Bulk-Only interface
    pub alt_setting: u8,
    /// Bulk IN endpoint address (direction bit set)
    pub bulk_in_ep: u8,
    /// Max packet size of the bulk IN endpoint
    pub bulk_in_mps: u16,
    /// Bulk OUT endpoint address
    pub bulk_out_ep: u8,
}

impl MscConfig {
    /// Endpoint address for a direction
    pub fn endpoint(&self, direction: Direction) -> u8 {
        match direction {
            Direction::In => self.bulk_in_ep,
            Direction::Out => self.bulk_out_ep,
        }
    }
}

/// Disk geometry reported by READ CAPACITY
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DiskGeometry {
    /// Logical block length in bytes
    pub block_size: u32,
    /// Number of addressable logical blocks
    pub block_count: u32,
}

impl DiskGeometry {
    /// Total capacity in bytes
    pub fn capacity_bytes(&self) -> u64 {
        u64::from(self.block_size) * u64::from(self.block_count)
    }
}

/// Subset of the standard device descriptor the driver consumes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
    /// bDeviceClass
    pub class: u8,
    /// bDeviceSubClass
    pub subclass: u8,
    /// bDeviceProtocol
    pub protocol: u8,
    /// bMaxPacketSize0
    pub max_packet_size_0: u8,
    /// iManufacturer (0 = no string)
    pub manufacturer_index: u8,
    /// iProduct (0 = no string)
    pub product_index: u8,
    /// iSerialNumber (0 = no string)
    pub serial_number_index: u8,
    /// bNumConfigurations
    pub num_configurations: u8,
}

/// Device information query result
///
/// Geometry and identity are fixed at install time, so two consecutive
/// queries on the same handle return identical values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
    /// Logical block length in bytes
    pub sector_size: u32,
    /// Number of logical blocks
    pub sector_count: u32,
    /// Manufacturer string, truncated to the fixed text capacity
    pub manufacturer: String,
    /// Product string, truncated to the fixed text capacity
    pub product: String,
    /// Serial number string, truncated to the fixed text capacity
    pub serial_number: String,
}
