//! Test utilities for usb-msc-host
//!
//! Descriptor builders and async helpers shared by the test suites.
//!
//! # Example
//!
//! ```
//! use common::test_utils::ConfigDescriptorBuilder;
//! use msc_proto::extract_configuration;
//!
//! let config = ConfigDescriptorBuilder::new()
//!     .msc_interface(0)
//!     .bulk_endpoint(0x81, 512)
//!     .bulk_endpoint(0x02, 512)
//!     .build();
//!
//! let cfg = extract_configuration(&config).unwrap();
//! assert_eq!(cfg.bulk_in_mps, 512);
//! ```

use msc_proto::DeviceDescriptor;
use msc_proto::descriptor::{
    BULK_ONLY_TRANSPORT, DT_CONFIGURATION, DT_ENDPOINT, DT_INTERFACE, DT_STRING,
    SCSI_COMMAND_SET, USB_CLASS_MASS_STORAGE,
};
use std::future::Future;
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Builder for raw configuration descriptors
///
/// `wTotalLength` and `bNumInterfaces` are filled in by [`build`](Self::build).
#[derive(Debug, Clone, Default)]
pub struct ConfigDescriptorBuilder {
    body: Vec<u8>,
    interfaces: u8,
}

impl ConfigDescriptorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an interface descriptor
    pub fn interface(mut self, number: u8, class: u8, subclass: u8, protocol: u8) -> Self {
        self.body.extend_from_slice(&[
            0x09,
            DT_INTERFACE,
            number,
            0x00, // bAlternateSetting
            0x02, // bNumEndpoints
            class,
            subclass,
            protocol,
            0x00, // iInterface
        ]);
        self.interfaces = self.interfaces.saturating_add(1);
        self
    }

    /// Append a SCSI-transparent Bulk-Only interface descriptor
    pub fn msc_interface(self, number: u8) -> Self {
        self.interface(
            number,
            USB_CLASS_MASS_STORAGE,
            SCSI_COMMAND_SET,
            BULK_ONLY_TRANSPORT,
        )
    }

    /// Append an endpoint descriptor
    pub fn endpoint(mut self, address: u8, attributes: u8, max_packet_size: u16) -> Self {
        let mps = max_packet_size.to_le_bytes();
        self.body.extend_from_slice(&[
            0x07,
            DT_ENDPOINT,
            address,
            attributes,
            mps[0],
            mps[1],
            0x00, // bInterval
        ]);
        self
    }

    /// Append a bulk endpoint descriptor
    pub fn bulk_endpoint(self, address: u8, max_packet_size: u16) -> Self {
        self.endpoint(address, 0x02, max_packet_size)
    }

    /// Append arbitrary descriptor bytes (class-specific descriptors, garbage)
    pub fn raw(mut self, bytes: &[u8]) -> Self {
        self.body.extend_from_slice(bytes);
        self
    }

    pub fn build(self) -> Vec<u8> {
        let total = (9 + self.body.len()) as u16;
        let total = total.to_le_bytes();
        let mut data = vec![
            0x09,
            DT_CONFIGURATION,
            total[0],
            total[1],
            self.interfaces,
            0x01, // bConfigurationValue
            0x00, // iConfiguration
            0x80, // bmAttributes (bus-powered)
            0x32, // bMaxPower (100mA)
        ];
        data.extend_from_slice(&self.body);
        data
    }
}

/// Configuration of a typical flash drive: one BOT interface, bulk IN + OUT
pub fn create_mock_msc_config_descriptor(in_mps: u16) -> Vec<u8> {
    ConfigDescriptorBuilder::new()
        .msc_interface(0)
        .bulk_endpoint(0x81, in_mps)
        .bulk_endpoint(0x02, in_mps)
        .build()
}

/// Configuration of a device without mass storage (HID keyboard)
pub fn create_mock_hid_config_descriptor() -> Vec<u8> {
    ConfigDescriptorBuilder::new()
        .interface(0, 0x03, 0x01, 0x01)
        .raw(&[0x09, 0x21, 0x11, 0x01, 0x00, 0x01, 0x22, 0x3f, 0x00])
        .endpoint(0x81, 0x03, 8)
        .build()
}

/// Encode a string as a USB string descriptor (UTF-16LE)
pub fn create_mock_string_descriptor(s: &str) -> Vec<u8> {
    let units: Vec<u16> = s.encode_utf16().collect();
    let mut data = vec![(2 + units.len() * 2) as u8, DT_STRING];
    for unit in units {
        data.extend_from_slice(&unit.to_le_bytes());
    }
    data
}

/// Device descriptor with string indices 1, 2 and 3 populated
pub fn create_mock_device_descriptor(vendor_id: u16, product_id: u16) -> DeviceDescriptor {
    DeviceDescriptor {
        vendor_id,
        product_id,
        class: 0x00,
        subclass: 0x00,
        protocol: 0x00,
        max_packet_size_0: 64,
        manufacturer_index: 1,
        product_index: 2,
        serial_number_index: 3,
        num_configurations: 1,
    }
}

/// Run a future with a timeout
///
/// # Example
/// ```no_run
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// #[tokio::test]
/// async fn test_with_timeout() {
///     let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await.unwrap();
///     assert_eq!(result, 42);
/// }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}
