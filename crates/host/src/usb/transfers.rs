//! USB transfer execution
//!
//! Every device owns exactly one [`Transfer`]. A call checks it out of the
//! device, submits it, and blocks on the device's completion signal until
//! the host library hands it back. Timeouts do not abandon the transfer:
//! the endpoint is halted and flushed and the executor keeps waiting for
//! the cancelled transfer, so the buffer is never reused while hardware
//! still owns it.

use crate::error::{MscError, Result};
use crate::usb::device::MscDevice;
use crate::usb::driver::{DriverState, TransferBufferInfo};
use crate::usb::host::{
    DmaBuffer, HostClient, RawDevice, SetupPacket, SubmitError, Transfer, TransferStatus,
};
use crate::usb::lock;
use msc_proto::{Direction, MscConfig, round_up_to_mps};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// One-shot completion channel between the transfer callback and the caller
///
/// A completion that arrives before anyone waits is kept until consumed.
pub(crate) struct CompletionSignal {
    done: Mutex<Option<Transfer>>,
    cond: Condvar,
}

impl CompletionSignal {
    pub(crate) fn new() -> Self {
        Self {
            done: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    /// Producer side, called from the host library's completion context
    pub(crate) fn complete(&self, transfer: Transfer) {
        *lock(&self.done) = Some(transfer);
        self.cond.notify_one();
    }

    /// Wait up to `timeout` for the transfer to come back
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> Option<Transfer> {
        let guard = lock(&self.done);
        let (mut guard, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |done| done.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        guard.take()
    }

    /// Wait until the transfer comes back
    pub(crate) fn wait(&self) -> Transfer {
        let mut guard = lock(&self.done);
        loop {
            if let Some(transfer) = guard.take() {
                return transfer;
            }
            guard = self
                .cond
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pipe {
    Bulk,
    Control,
}

/// A device's transfer, checked out for one call
///
/// Dropping the lease puts the transfer back into the device, first
/// detaching any buffer lent by a zero-copy caller, on every exit path.
struct TransferLease<'a> {
    slot: &'a Mutex<Option<Transfer>>,
    transfer: Option<Transfer>,
    lent: Option<&'a mut DmaBuffer>,
}

impl<'a> TransferLease<'a> {
    fn checkout(slot: &'a Mutex<Option<Transfer>>) -> Result<Self> {
        let transfer = lock(slot).take().ok_or(MscError::InvalidState(
            "a transfer is already in progress on this device",
        ))?;

        Ok(Self {
            slot,
            transfer: Some(transfer),
            lent: None,
        })
    }

    fn transfer(&mut self) -> Result<&mut Transfer> {
        self.transfer
            .as_mut()
            .ok_or_else(|| MscError::Internal("transfer resource lost".to_string()))
    }

    /// Attach the caller's buffer in place of the device buffer
    fn lend(&mut self, buffer: &'a mut DmaBuffer) -> Result<()> {
        self.transfer()?.swap_buffer(buffer);
        self.lent = Some(buffer);
        Ok(())
    }

    fn run(
        &mut self,
        state: &DriverState,
        device: &MscDevice,
        endpoint: u8,
        len: usize,
        pipe: Pipe,
    ) -> Result<usize> {
        let transfer = self
            .transfer
            .take()
            .ok_or_else(|| MscError::Internal("transfer resource lost".to_string()))?;
        let (transfer, result) = execute(state, device, transfer, endpoint, len, pipe);
        self.transfer = Some(transfer);
        result
    }
}

impl Drop for TransferLease<'_> {
    fn drop(&mut self) {
        if let Some(mut transfer) = self.transfer.take() {
            if let Some(buffer) = self.lent.take() {
                transfer.swap_buffer(buffer);
            }
            *lock(self.slot) = Some(transfer);
        }
    }
}

/// Submit one transfer and wait for it to come back
fn execute(
    state: &DriverState,
    device: &MscDevice,
    mut transfer: Transfer,
    endpoint: u8,
    len: usize,
    pipe: Pipe,
) -> (Transfer, Result<usize>) {
    let raw = match device.raw() {
        Ok(raw) => raw,
        Err(e) => return (transfer, Err(e)),
    };

    transfer.device = raw;
    transfer.endpoint = endpoint;
    transfer.num_bytes = len;
    transfer.actual_num_bytes = 0;
    transfer.status = TransferStatus::Pending;
    transfer.timeout = state.timeouts.transfer;

    let signal = device.signal.clone();
    transfer.set_callback(move |done| signal.complete(done));

    trace!("Submitting {} bytes on endpoint {:#04x}", len, endpoint);
    let client = state.client.as_ref();
    let submitted = match pipe {
        Pipe::Bulk => client.submit(transfer),
        Pipe::Control => client.submit_control(transfer),
    };
    if let Err(SubmitError { error, transfer }) = submitted {
        warn!(
            "Failed to submit transfer on endpoint {:#04x}: {}",
            endpoint, error
        );
        return (transfer, Err(error.into()));
    }

    let transfer = match device.signal.wait_timeout(state.timeouts.transfer) {
        Some(transfer) => transfer,
        None => return recover_timeout(client, device, raw, endpoint),
    };

    let result = match transfer.status {
        TransferStatus::Completed => Ok(transfer.actual_num_bytes),
        TransferStatus::Stall => {
            debug!("Endpoint {:#04x} stalled", endpoint);
            Err(MscError::Stall { endpoint })
        }
        status => Err(MscError::Internal(format!(
            "transfer on endpoint {:#04x} failed: {:?}",
            endpoint, status
        ))),
    };
    (transfer, result)
}

/// Halt and flush the endpoint, then wait for the cancelled transfer
fn recover_timeout(
    client: &dyn HostClient,
    device: &MscDevice,
    raw: RawDevice,
    endpoint: u8,
) -> (Transfer, Result<usize>) {
    warn!(
        "Transfer on endpoint {:#04x} timed out, halting and flushing",
        endpoint
    );

    if let Err(e) = client.endpoint_halt(raw, endpoint) {
        warn!("Failed to halt endpoint {:#04x}: {}", endpoint, e);
    }
    if let Err(e) = client.endpoint_flush(raw, endpoint) {
        warn!("Failed to flush endpoint {:#04x}: {}", endpoint, e);
    }

    let transfer = device.signal.wait();
    debug!(
        "Flushed transfer on endpoint {:#04x} returned with {:?}",
        endpoint, transfer.status
    );

    if let Err(e) = client.endpoint_clear(raw, endpoint) {
        warn!("Failed to clear endpoint {:#04x}: {}", endpoint, e);
    }

    (transfer, Err(MscError::Timeout { endpoint }))
}

/// Length to submit: bulk IN transfers are whole packets
fn submit_len(config: &MscConfig, size: usize, direction: Direction) -> usize {
    match direction {
        Direction::In => round_up_to_mps(size, config.bulk_in_mps),
        Direction::Out => size,
    }
}

impl MscDevice {
    /// Move `data` through the bulk endpoint of `direction`
    ///
    /// Returns the number of bytes transferred, at most `data.len()`.
    pub(crate) fn bulk_transfer(
        &self,
        state: &DriverState,
        data: &mut [u8],
        direction: Direction,
    ) -> Result<usize> {
        let config = self.config()?;
        let size = data.len();
        let len = submit_len(&config, size, direction);

        let capacity = self.capacity()?;
        if len > capacity {
            return Err(MscError::InvalidSize {
                requested: len,
                capacity,
            });
        }

        let mut lease = TransferLease::checkout(&self.transfer)?;
        if direction == Direction::Out {
            lease.transfer()?.data_mut()[..size].copy_from_slice(data);
        }

        let actual = lease.run(state, self, config.endpoint(direction), len, Pipe::Bulk)?;

        let actual = actual.min(size);
        if direction == Direction::In {
            // Bytes past `actual` were never written by this transfer
            data[..actual].copy_from_slice(&lease.transfer()?.data()[..actual]);
            data[actual..].fill(0);
        }
        Ok(actual)
    }

    /// Bulk transfer straight into or out of a caller buffer
    pub(crate) fn bulk_transfer_zero_copy(
        &self,
        state: &DriverState,
        buffer: &mut DmaBuffer,
        size: usize,
        direction: Direction,
    ) -> Result<usize> {
        if !buffer.is_dma_capable() {
            return Err(MscError::InvalidArgument(
                "zero-copy buffer must be DMA capable",
            ));
        }

        let config = self.config()?;
        let len = submit_len(&config, size, direction);
        if len > buffer.len() {
            return Err(MscError::InvalidSize {
                requested: len,
                capacity: buffer.len(),
            });
        }

        let mut lease = TransferLease::checkout(&self.transfer)?;
        lease.lend(buffer)?;
        let actual = lease.run(state, self, config.endpoint(direction), len, Pipe::Bulk)?;
        Ok(actual.min(size))
    }

    /// Control transfer on the default pipe
    ///
    /// `data` is the data stage; its length must match `setup.length`.
    /// Returns the number of data stage bytes transferred.
    pub(crate) fn control_transfer(
        &self,
        state: &DriverState,
        setup: SetupPacket,
        data: &mut [u8],
    ) -> Result<usize> {
        if usize::from(setup.length) != data.len() {
            return Err(MscError::InvalidArgument(
                "setup packet length does not match the data stage",
            ));
        }

        let len = SetupPacket::LEN + data.len();
        let capacity = self.capacity()?;
        if len > capacity {
            return Err(MscError::InvalidSize {
                requested: len,
                capacity,
            });
        }

        let direction = setup.direction();
        let mut lease = TransferLease::checkout(&self.transfer)?;
        {
            let buf = lease.transfer()?.data_mut();
            buf[..SetupPacket::LEN].copy_from_slice(&setup.to_bytes());
            if direction == Direction::Out {
                buf[SetupPacket::LEN..len].copy_from_slice(data);
            }
        }

        let actual = lease.run(state, self, 0, len, Pipe::Control)?;
        let received = actual.saturating_sub(SetupPacket::LEN).min(data.len());

        if direction == Direction::In {
            let buf = lease.transfer()?.data();
            data[..received].copy_from_slice(&buf[SetupPacket::LEN..SetupPacket::LEN + received]);
        }
        Ok(received)
    }

    pub(crate) fn buffer_info(&self) -> Result<TransferBufferInfo> {
        let slot = lock(&self.transfer);
        let transfer = slot.as_ref().ok_or(MscError::InvalidState(
            "a transfer is in progress on this device",
        ))?;

        Ok(TransferBufferInfo {
            addr: transfer.buffer_addr(),
            capacity: transfer.capacity(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_completion_before_wait_is_kept() {
        let signal = CompletionSignal::new();
        signal.complete(Transfer::new(DmaBuffer::dma(8)));
        assert!(signal.wait_timeout(Duration::from_millis(1)).is_some());
        assert!(signal.wait_timeout(Duration::from_millis(1)).is_none());
    }

    #[test]
    fn test_completion_from_other_thread() {
        let signal = Arc::new(CompletionSignal::new());
        let producer = signal.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.complete(Transfer::new(DmaBuffer::dma(8)));
        });

        let transfer = signal.wait();
        assert_eq!(transfer.capacity(), 8);
        handle.join().unwrap();
    }

    #[test]
    fn test_lease_is_exclusive_and_returns_on_drop() {
        let slot = Mutex::new(Some(Transfer::new(DmaBuffer::dma(64))));

        let lease = TransferLease::checkout(&slot).unwrap();
        assert!(matches!(
            TransferLease::checkout(&slot),
            Err(MscError::InvalidState(_))
        ));
        drop(lease);

        assert!(lock(&slot).is_some());
    }

    #[test]
    fn test_lent_buffer_is_restored_on_drop() {
        let slot = Mutex::new(Some(Transfer::new(DmaBuffer::dma(64))));
        let original = lock(&slot).as_ref().unwrap().buffer_addr();

        let mut caller = DmaBuffer::dma(4096);
        let caller_addr = caller.addr();
        {
            let mut lease = TransferLease::checkout(&slot).unwrap();
            lease.lend(&mut caller).unwrap();
            assert_eq!(lease.transfer().unwrap().buffer_addr(), caller_addr);
        }

        let guard = lock(&slot);
        let transfer = guard.as_ref().unwrap();
        assert_eq!(transfer.buffer_addr(), original);
        assert_eq!(transfer.capacity(), 64);
        assert_eq!(caller.addr(), caller_addr);
    }

    #[test]
    fn test_in_length_rounded_to_packets() {
        let config = MscConfig {
            bulk_in_ep: 0x81,
            bulk_in_mps: 512,
            bulk_out_ep: 0x02,
            ..MscConfig::default()
        };
        assert_eq!(submit_len(&config, 13, Direction::In), 512);
        assert_eq!(submit_len(&config, 13, Direction::Out), 13);
    }
}
