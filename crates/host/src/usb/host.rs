//! Host library boundary
//!
//! The driver never talks to a USB controller directly. Everything below the
//! class-driver level (enumeration, descriptor retrieval, transfer
//! submission, endpoint recovery and client event delivery) goes through the
//! [`UsbHost`] / [`HostClient`] traits. [`RusbHost`](crate::usb::RusbHost)
//! implements them on top of libusb; [`MockHost`](crate::test_utils::MockHost)
//! implements them in memory for tests.
//!
//! A [`Transfer`] owns its buffer. Submitting moves the transfer into the
//! host library, and the completion callback stored inside it hands it back,
//! so a buffer can never be touched by the driver while hardware owns it.

use crate::error::HostError;
use byteorder::{ByteOrder, LittleEndian};
use msc_proto::{DeviceDescriptor, Direction};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Result type used across the host library boundary
pub type HostResult<T> = std::result::Result<T, HostError>;

/// Host library identity of one attached device
///
/// Stable for as long as the device stays attached. Opening a device is
/// reference counted by the host library, so the dispatcher and an
/// installed device may hold it open at the same time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawDevice(pub u32);

/// Raw notification delivered by the host library to a registered client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    /// A device finished enumeration at `address`
    NewDevice { address: u8 },
    /// A device went away
    DeviceGone { device: RawDevice },
}

/// Final state of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferStatus {
    /// Not yet completed
    #[default]
    Pending,
    Completed,
    Error,
    TimedOut,
    /// Cancelled by an endpoint flush
    Canceled,
    Stall,
    NoDevice,
    Overflow,
}

/// Transfer buffer
///
/// `dma` buffers live in memory the controller can reach directly; only those
/// may be lent to a transfer for a zero-copy call.
#[derive(Debug, PartialEq, Eq)]
pub struct DmaBuffer {
    bytes: Vec<u8>,
    dma_capable: bool,
}

impl DmaBuffer {
    /// Zeroed, DMA-capable buffer
    pub fn dma(len: usize) -> Self {
        Self {
            bytes: vec![0; len],
            dma_capable: true,
        }
    }

    /// Zeroed buffer in ordinary memory
    pub fn heap(len: usize) -> Self {
        Self {
            bytes: vec![0; len],
            dma_capable: false,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn is_dma_capable(&self) -> bool {
        self.dma_capable
    }

    /// Address of the backing storage
    pub fn addr(&self) -> usize {
        self.bytes.as_ptr() as usize
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

/// Called by the host library when a transfer finishes
pub type TransferCallback = Box<dyn FnOnce(Transfer) + Send>;

/// One transfer descriptor and its buffer
pub struct Transfer {
    /// Target device
    pub device: RawDevice,
    /// Endpoint address (0 for the default control pipe)
    pub endpoint: u8,
    /// Bytes to move (control transfers include the 8 byte setup packet)
    pub num_bytes: usize,
    /// Bytes actually moved, set on completion
    pub actual_num_bytes: usize,
    pub status: TransferStatus,
    /// Budget the host library may apply to the hardware operation
    pub timeout: Duration,
    buffer: DmaBuffer,
    callback: Option<TransferCallback>,
}

impl Transfer {
    pub fn new(buffer: DmaBuffer) -> Self {
        Self {
            device: RawDevice(0),
            endpoint: 0,
            num_bytes: 0,
            actual_num_bytes: 0,
            status: TransferStatus::Pending,
            timeout: Duration::ZERO,
            buffer,
            callback: None,
        }
    }

    /// Buffer capacity in bytes
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Address of the buffer currently attached
    pub fn buffer_addr(&self) -> usize {
        self.buffer.addr()
    }

    pub fn data(&self) -> &[u8] {
        self.buffer.as_slice()
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.buffer.as_mut_slice()
    }

    pub fn set_callback(&mut self, callback: impl FnOnce(Transfer) + Send + 'static) {
        self.callback = Some(Box::new(callback));
    }

    /// Record the outcome and hand the transfer back to its owner
    ///
    /// Host library implementations call this exactly once per submission.
    pub fn complete(mut self, status: TransferStatus, actual_num_bytes: usize) {
        self.status = status;
        self.actual_num_bytes = actual_num_bytes;
        if let Some(callback) = self.callback.take() {
            callback(self);
        }
    }

    /// Exchange the attached buffer with `other`
    pub(crate) fn swap_buffer(&mut self, other: &mut DmaBuffer) {
        std::mem::swap(&mut self.buffer, other);
    }
}

impl fmt::Debug for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transfer")
            .field("device", &self.device)
            .field("endpoint", &self.endpoint)
            .field("num_bytes", &self.num_bytes)
            .field("actual_num_bytes", &self.actual_num_bytes)
            .field("status", &self.status)
            .field("capacity", &self.capacity())
            .finish_non_exhaustive()
    }
}

/// A rejected submission; the transfer is handed back untouched
#[derive(Debug)]
pub struct SubmitError {
    pub error: HostError,
    pub transfer: Transfer,
}

/// USB control request setup packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    /// Length of the data stage
    pub length: u16,
}

impl SetupPacket {
    /// Encoded length
    pub const LEN: usize = 8;

    /// Data stage direction, from bit 7 of bmRequestType
    pub fn direction(&self) -> Direction {
        Direction::of_endpoint(self.request_type)
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[0] = self.request_type;
        buf[1] = self.request;
        LittleEndian::write_u16(&mut buf[2..4], self.value);
        LittleEndian::write_u16(&mut buf[4..6], self.index);
        LittleEndian::write_u16(&mut buf[6..8], self.length);
        buf
    }

    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::LEN {
            return None;
        }
        Some(Self {
            request_type: buf[0],
            request: buf[1],
            value: LittleEndian::read_u16(&buf[2..4]),
            index: LittleEndian::read_u16(&buf[4..6]),
            length: LittleEndian::read_u16(&buf[6..8]),
        })
    }
}

/// Entry point of a host library
pub trait UsbHost: Send + Sync {
    /// Register a class driver client
    ///
    /// `max_events` bounds the number of undelivered client events the host
    /// library queues for this client.
    fn register_client(&self, max_events: usize) -> HostResult<Arc<dyn HostClient>>;
}

/// A registered client of the host library
pub trait HostClient: Send + Sync {
    /// Wait for client events
    ///
    /// `None` waits until at least one event arrives or [`unblock`](Self::unblock)
    /// is called. An unblock issued before the wait starts is not lost.
    fn handle_events(&self, timeout: Option<Duration>) -> HostResult<Vec<ClientEvent>>;

    /// Wake a pending or the next [`handle_events`](Self::handle_events) call
    fn unblock(&self) -> HostResult<()>;

    fn deregister(&self) -> HostResult<()>;

    fn open_device(&self, address: u8) -> HostResult<RawDevice>;

    fn close_device(&self, device: RawDevice) -> HostResult<()>;

    fn device_descriptor(&self, device: RawDevice) -> HostResult<DeviceDescriptor>;

    /// Raw bytes of the active configuration descriptor, `wTotalLength` long
    fn active_config_descriptor(&self, device: RawDevice) -> HostResult<Vec<u8>>;

    /// Raw string descriptor in the device's first language
    fn string_descriptor(&self, device: RawDevice, index: u8) -> HostResult<Vec<u8>>;

    fn claim_interface(
        &self,
        device: RawDevice,
        interface: u8,
        alt_setting: u8,
    ) -> HostResult<()>;

    fn release_interface(&self, device: RawDevice, interface: u8) -> HostResult<()>;

    /// Allocate a transfer with a DMA-capable buffer of `size` bytes
    fn alloc_transfer(&self, size: usize) -> HostResult<Transfer>;

    fn free_transfer(&self, transfer: Transfer) -> HostResult<()>;

    fn alloc_dma_buffer(&self, size: usize) -> HostResult<DmaBuffer>;

    /// Submit a bulk transfer to `transfer.endpoint`
    fn submit(&self, transfer: Transfer) -> Result<(), SubmitError>;

    /// Submit a control transfer on the default pipe
    ///
    /// The buffer starts with the 8 byte setup packet.
    fn submit_control(&self, transfer: Transfer) -> Result<(), SubmitError>;

    /// Stop the endpoint from processing further transfers
    fn endpoint_halt(&self, device: RawDevice, endpoint: u8) -> HostResult<()>;

    /// Cancel every transfer queued on a halted endpoint
    ///
    /// Cancelled transfers still complete through their callback.
    fn endpoint_flush(&self, device: RawDevice, endpoint: u8) -> HostResult<()>;

    /// Clear a halt or stall condition
    fn endpoint_clear(&self, device: RawDevice, endpoint: u8) -> HostResult<()>;
}
