//! Wire layer for the USB Mass Storage host driver
//!
//! This crate holds everything that can be expressed without touching
//! hardware: the types shared by the driver and its callers, the descriptor
//! extractor that recognises SCSI-transparent Bulk-Only Transport interfaces,
//! and the BOT / SCSI codecs used to talk to a device once it is installed.
//!
//! # Example
//!
//! ```
//! use msc_proto::descriptor::{extract_configuration, find_msc_interface};
//!
//! // Configuration descriptor: one MSC/BOT interface, bulk IN 0x81 (MPS 64), bulk OUT 0x02
//! let config: [u8; 32] = [
//!     0x09, 0x02, 0x20, 0x00, 0x01, 0x01, 0x00, 0x80, 0x32,
//!     0x09, 0x04, 0x00, 0x00, 0x02, 0x08, 0x06, 0x50, 0x00,
//!     0x07, 0x05, 0x81, 0x02, 0x40, 0x00, 0x00,
//!     0x07, 0x05, 0x02, 0x02, 0x40, 0x00, 0x00,
//! ];
//!
//! assert!(find_msc_interface(&config).is_some());
//! let cfg = extract_configuration(&config).unwrap();
//! assert_eq!(cfg.bulk_in_ep, 0x81);
//! assert_eq!(cfg.bulk_in_mps, 64);
//! assert_eq!(cfg.bulk_out_ep, 0x02);
//! ```

pub mod bot;
pub mod descriptor;
pub mod error;
pub mod scsi;
pub mod types;

pub use descriptor::{
    MSC_STR_DESC_SIZE, MscInterface, decode_string_descriptor, extract_configuration,
    find_msc_interface, round_up_to_mps,
};
pub use error::{DescriptorError, ProtoError, Result};
pub use types::{
    DeviceDescriptor, DeviceHandle, DeviceInfo, Direction, DiskGeometry, MscConfig, MscEvent,
};
