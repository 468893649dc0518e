//! USB Mass Storage host driver
//!
//! Host-side class driver for SCSI-transparent Bulk-Only Transport devices.
//! [`usb::MscHost`] recognises mass storage devices among attach events,
//! installs them (interface claim, readiness handshake, capacity query) and
//! runs synchronous bulk and control transfers with timeout and stall
//! recovery, all on top of a pluggable host library ([`usb::UsbHost`]).

pub mod config;
pub mod error;
pub mod test_utils;
pub mod usb;

pub use error::{HostError, MscError, Result};
pub use usb::{DriverConfig, EventTaskConfig, MscHost, Timeouts};
