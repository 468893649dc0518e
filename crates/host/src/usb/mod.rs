//! USB subsystem
//!
//! This module implements the mass storage class driver on top of a host
//! library:
//! - Registry and client event dispatch (`driver`, `worker`)
//! - Device install / uninstall with rollback (`device`)
//! - The synchronous transfer executor (`transfers`)
//! - The SCSI command client used during install (`scsi`)
//! - The libusb-backed host library (`rusb_host`)

mod device;
pub mod driver;
pub mod host;
pub mod rusb_host;
mod scsi;
mod transfers;
mod worker;

use std::sync::{Mutex, MutexGuard, PoisonError};

// Re-export public types
pub use driver::{
    DEFAULT_TRANSFER_BUFFER_SIZE, DriverConfig, EventCallback, EventTaskConfig, MscHost,
    Timeouts, TransferBufferInfo,
};
pub use host::{
    ClientEvent, DmaBuffer, HostClient, HostResult, RawDevice, SetupPacket, SubmitError,
    Transfer, TransferStatus, UsbHost,
};
pub use rusb_host::RusbHost;

/// Lock a mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
