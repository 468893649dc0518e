//! Mass storage device lifecycle
//!
//! An [`MscDevice`] is created empty and registered before any I/O happens,
//! so that a disconnect arriving mid-install can already find it. Each
//! install step fills in one piece; teardown releases whatever was acquired.

use crate::error::{MscError, Result};
use crate::usb::driver::DriverState;
use crate::usb::host::{HostClient, HostResult, RawDevice, Transfer};
use crate::usb::lock;
use crate::usb::scsi;
use crate::usb::transfers::CompletionSignal;
use msc_proto::descriptor::describe;
use msc_proto::{
    DeviceHandle, DeviceInfo, DiskGeometry, MSC_STR_DESC_SIZE, MscConfig,
    decode_string_descriptor, extract_configuration, round_up_to_mps,
};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use tracing::{debug, warn};

/// An installed (or installing) mass storage device
pub(crate) struct MscDevice {
    pub(crate) handle: DeviceHandle,
    raw: OnceLock<RawDevice>,
    config: OnceLock<MscConfig>,
    capacity: OnceLock<usize>,
    geometry: OnceLock<DiskGeometry>,
    opened: AtomicBool,
    claimed: AtomicBool,
    /// Set once every install step has succeeded
    installed: AtomicBool,
    next_tag: AtomicU32,
    pub(super) signal: Arc<CompletionSignal>,
    /// The device's single transfer; empty while a call has it checked out
    pub(super) transfer: Mutex<Option<Transfer>>,
}

impl MscDevice {
    pub(crate) fn new(handle: DeviceHandle) -> Self {
        Self {
            handle,
            raw: OnceLock::new(),
            config: OnceLock::new(),
            capacity: OnceLock::new(),
            geometry: OnceLock::new(),
            opened: AtomicBool::new(false),
            claimed: AtomicBool::new(false),
            installed: AtomicBool::new(false),
            next_tag: AtomicU32::new(1),
            signal: Arc::new(CompletionSignal::new()),
            transfer: Mutex::new(None),
        }
    }

    pub(crate) fn raw(&self) -> Result<RawDevice> {
        self.raw
            .get()
            .copied()
            .ok_or(MscError::InvalidState("device is not open"))
    }

    pub(crate) fn is_raw(&self, raw: RawDevice) -> bool {
        self.raw.get() == Some(&raw)
    }

    pub(crate) fn config(&self) -> Result<MscConfig> {
        self.config
            .get()
            .copied()
            .ok_or(MscError::InvalidState("device is not configured"))
    }

    /// Capacity of the device's own transfer buffer
    pub(crate) fn capacity(&self) -> Result<usize> {
        self.capacity
            .get()
            .copied()
            .ok_or(MscError::InvalidState("device has no transfer buffer"))
    }

    pub(crate) fn geometry(&self) -> Result<DiskGeometry> {
        self.geometry
            .get()
            .copied()
            .ok_or(MscError::InvalidState("device install has not completed"))
    }

    pub(crate) fn mark_installed(&self) {
        self.installed.store(true, Ordering::Release);
    }

    pub(crate) fn is_installed(&self) -> bool {
        self.installed.load(Ordering::Acquire)
    }

    /// Tag for the next Command Block Wrapper
    pub(crate) fn next_tag(&self) -> u32 {
        self.next_tag.fetch_add(1, Ordering::Relaxed)
    }

    /// Bring the device up: open, configure, allocate, claim, query the unit
    pub(crate) fn init(&self, state: &DriverState, address: u8) -> Result<()> {
        let client = state.client.as_ref();

        let raw = client.open_device(address)?;
        let _ = self.raw.set(raw);
        self.opened.store(true, Ordering::Release);
        debug!("Opened device at address {} as {:?}", address, raw);

        let descriptor = client.active_config_descriptor(raw)?;
        let config = extract_configuration(&descriptor)?;
        let _ = self.config.set(config);
        debug!(
            "Device {:?}: interface {}, bulk IN {:#04x} (MPS {}), bulk OUT {:#04x}",
            self.handle, config.iface_num, config.bulk_in_ep, config.bulk_in_mps, config.bulk_out_ep
        );

        let size = round_up_to_mps(state.transfer_buffer_size, config.bulk_in_mps);
        let transfer = client.alloc_transfer(size)?;
        let _ = self.capacity.set(transfer.capacity());
        *lock(&self.transfer) = Some(transfer);

        client.claim_interface(raw, config.iface_num, config.alt_setting)?;
        self.claimed.store(true, Ordering::Release);
        debug!("Claimed interface {}", config.iface_num);

        let inquiry = scsi::inquiry(state, self)?;
        debug!(
            "INQUIRY: vendor '{}' product '{}' revision '{}'",
            inquiry.vendor, inquiry.product, inquiry.revision
        );

        self.wait_for_ready(state)?;

        let capacity = scsi::read_capacity(state, self)?;
        let _ = self.geometry.set(DiskGeometry {
            block_size: capacity.block_size,
            block_count: capacity.block_count,
        });
        debug!(
            "Device {:?}: {} blocks of {} bytes",
            self.handle, capacity.block_count, capacity.block_size
        );

        Ok(())
    }

    /// Poll TEST UNIT READY until the unit reports ready
    ///
    /// A failed poll is followed by REQUEST SENSE; only "not ready", "unit
    /// attention" and "no sense" keep the poll going.
    fn wait_for_ready(&self, state: &DriverState) -> Result<()> {
        let poll = state.timeouts.ready_poll;
        let budget = state.timeouts.ready_budget.as_millis();
        let trials = (budget / poll.as_millis().max(1)).max(1);

        let mut last_error = None;
        for trial in 0..trials {
            match scsi::test_unit_ready(state, self) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    let sense = scsi::request_sense(state, self)?;
                    if !sense.key.is_transient() {
                        return Err(MscError::Internal(format!(
                            "unit failed to become ready: sense key {:?} (ASC {:#04x}, ASCQ {:#04x})",
                            sense.key, sense.asc, sense.ascq
                        )));
                    }
                    debug!(
                        "Device {:?} not ready ({:?}), trial {}/{}",
                        self.handle,
                        sense.key,
                        trial + 1,
                        trials
                    );
                    last_error = Some(e);
                }
            }

            if trial + 1 < trials {
                thread::sleep(poll);
            }
        }

        Err(last_error.unwrap_or(MscError::InvalidState("unit never became ready")))
    }

    /// Release everything the device acquired
    ///
    /// After a failed install every error is ignored, since the failing step
    /// is not known here. Otherwise the first error is returned, after all
    /// steps have been attempted.
    pub(crate) fn deinit(&self, client: &dyn HostClient, install_failed: bool) -> Result<()> {
        let mut first_error: Option<MscError> = None;
        let mut check = |step: &str, result: HostResult<()>| {
            if let Err(e) = result {
                if install_failed {
                    debug!("Ignoring {} failure during rollback: {}", step, e);
                } else {
                    warn!("Failed to {} for device {:?}: {}", step, self.handle, e);
                    first_error.get_or_insert(e.into());
                }
            }
        };

        if let (Ok(raw), Ok(config)) = (self.raw(), self.config()) {
            if self.claimed.swap(false, Ordering::AcqRel) {
                check("release interface", client.release_interface(raw, config.iface_num));
            }
        }
        if let Ok(raw) = self.raw() {
            if self.opened.swap(false, Ordering::AcqRel) {
                check("close device", client.close_device(raw));
            }
        }
        if let Some(transfer) = lock(&self.transfer).take() {
            check("free transfer", client.free_transfer(transfer));
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Identity and geometry, as fixed at install time
    pub(crate) fn info(&self, client: &dyn HostClient) -> Result<DeviceInfo> {
        let raw = self.raw()?;
        let geometry = self.geometry()?;
        let descriptor = client.device_descriptor(raw)?;

        let string = |index: u8| {
            if index == 0 {
                return String::new();
            }
            match client.string_descriptor(raw, index) {
                Ok(desc) => decode_string_descriptor(&desc, MSC_STR_DESC_SIZE - 1),
                Err(e) => {
                    debug!("String descriptor {} unavailable: {}", index, e);
                    String::new()
                }
            }
        };

        Ok(DeviceInfo {
            vendor_id: descriptor.vendor_id,
            product_id: descriptor.product_id,
            sector_size: geometry.block_size,
            sector_count: geometry.block_count,
            manufacturer: string(descriptor.manufacturer_index),
            product: string(descriptor.product_index),
            serial_number: string(descriptor.serial_number_index),
        })
    }

    /// Device and configuration descriptors as text
    pub(crate) fn describe(&self, client: &dyn HostClient) -> Result<String> {
        let raw = self.raw()?;
        let descriptor = client.device_descriptor(raw)?;
        let config = client.active_config_descriptor(raw)?;
        Ok(describe(&descriptor, &config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_device_is_not_usable() {
        let device = MscDevice::new(DeviceHandle(1));
        assert!(matches!(device.raw(), Err(MscError::InvalidState(_))));
        assert!(matches!(device.config(), Err(MscError::InvalidState(_))));
        assert!(matches!(device.geometry(), Err(MscError::InvalidState(_))));
        assert!(!device.is_raw(RawDevice(0)));
        assert!(!device.is_installed());
    }

    #[test]
    fn test_tags_are_unique() {
        let device = MscDevice::new(DeviceHandle(1));
        let first = device.next_tag();
        assert_ne!(first, device.next_tag());
    }
}
