//! SCSI commands over Bulk-Only Transport
//!
//! Each command is a Command Block Wrapper on bulk OUT, an optional data
//! stage, and a Command Status Wrapper on bulk IN, all issued through the
//! device's transfer executor.

use crate::error::{MscError, Result};
use crate::usb::device::MscDevice;
use crate::usb::driver::DriverState;
use crate::usb::host::SetupPacket;
use msc_proto::Direction;
use msc_proto::bot::{
    CSW_LEN, CommandBlockWrapper, CommandStatusWrapper, CswStatus, REQUEST_BULK_ONLY_RESET,
    REQUEST_GET_MAX_LUN,
};
use msc_proto::scsi::{
    self, Capacity, INQUIRY_LEN, InquiryData, READ_CAPACITY_10_LEN, SENSE_LEN, SenseData,
};
use tracing::debug;

/// bmRequestType: class request to an interface, host to device
const CLASS_INTERFACE_OUT: u8 = 0x21;
/// bmRequestType: class request to an interface, device to host
const CLASS_INTERFACE_IN: u8 = 0xa1;

/// Run one command on LUN 0
///
/// Returns the number of data stage bytes the device actually moved: the
/// smaller of the transfer's own count and what the status residue allows.
fn execute(
    state: &DriverState,
    device: &MscDevice,
    cdb: &[u8],
    data: &mut [u8],
    direction: Direction,
) -> Result<usize> {
    let tag = device.next_tag();
    let cbw = CommandBlockWrapper::new(tag, data.len() as u32, direction, 0, cdb)?;
    let opcode = cbw.command()[0];

    let mut command = cbw.to_bytes();
    device.bulk_transfer(state, &mut command, Direction::Out)?;

    let mut moved = 0;
    if !data.is_empty() {
        match device.bulk_transfer(state, data, direction) {
            Ok(actual) => moved = actual,
            Err(MscError::Stall { endpoint }) => {
                // The status wrapper still follows a stalled data stage
                debug!(
                    "Data stage of command {:#04x} stalled, clearing endpoint {:#04x}",
                    opcode, endpoint
                );
                state.client.endpoint_clear(device.raw()?, endpoint)?;
            }
            Err(e) => return Err(e),
        }
    }

    let mut status = [0u8; CSW_LEN];
    device.bulk_transfer(state, &mut status, Direction::In)?;

    let csw = CommandStatusWrapper::parse(&status, tag)?;
    if csw.status != CswStatus::Passed {
        return Err(MscError::CommandFailed {
            opcode,
            status: csw.status,
        });
    }

    let reported = data.len().saturating_sub(csw.data_residue as usize);
    Ok(moved.min(reported))
}

pub(crate) fn inquiry(state: &DriverState, device: &MscDevice) -> Result<InquiryData> {
    let mut buf = [0u8; INQUIRY_LEN];
    let received = execute(state, device, &scsi::inquiry_cdb(), &mut buf, Direction::In)?;
    Ok(InquiryData::parse(&buf[..received])?)
}

pub(crate) fn test_unit_ready(state: &DriverState, device: &MscDevice) -> Result<()> {
    execute(state, device, &scsi::test_unit_ready_cdb(), &mut [], Direction::Out)?;
    Ok(())
}

pub(crate) fn request_sense(state: &DriverState, device: &MscDevice) -> Result<SenseData> {
    let mut buf = [0u8; SENSE_LEN];
    let received = execute(state, device, &scsi::request_sense_cdb(), &mut buf, Direction::In)?;
    Ok(SenseData::parse(&buf[..received])?)
}

pub(crate) fn read_capacity(state: &DriverState, device: &MscDevice) -> Result<Capacity> {
    let mut buf = [0u8; READ_CAPACITY_10_LEN];
    let received = execute(state, device, &scsi::read_capacity_10_cdb(), &mut buf, Direction::In)?;
    Ok(Capacity::parse(&buf[..received])?)
}

/// Bulk-Only Mass Storage Reset
pub(crate) fn mass_storage_reset(state: &DriverState, device: &MscDevice) -> Result<()> {
    let config = device.config()?;
    let setup = SetupPacket {
        request_type: CLASS_INTERFACE_OUT,
        request: REQUEST_BULK_ONLY_RESET,
        value: 0,
        index: u16::from(config.iface_num),
        length: 0,
    };
    device.control_transfer(state, setup, &mut [])?;
    Ok(())
}

/// Highest logical unit number on the device
///
/// Devices without multiple LUNs may stall the request; that means 0.
pub(crate) fn get_max_lun(state: &DriverState, device: &MscDevice) -> Result<u8> {
    let config = device.config()?;
    let setup = SetupPacket {
        request_type: CLASS_INTERFACE_IN,
        request: REQUEST_GET_MAX_LUN,
        value: 0,
        index: u16::from(config.iface_num),
        length: 1,
    };

    let mut lun = [0u8; 1];
    match device.control_transfer(state, setup, &mut lun) {
        Ok(1) => Ok(lun[0]),
        Ok(_) => Ok(0),
        Err(MscError::Stall { .. }) => Ok(0),
        Err(e) => Err(e),
    }
}
