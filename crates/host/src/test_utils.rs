//! In-memory host library for tests
//!
//! [`MockHost`] implements [`UsbHost`] / [`HostClient`] without hardware.
//! Each attached [`MockDevice`] runs a small Bulk-Only Transport target that
//! answers the SCSI commands the driver issues. Faults (allocation
//! failures, stalls, hung transfers) are injected per call, and every host
//! library operation is recorded so tests can check ordering and leaks.
//!
//! # Example
//!
//! ```
//! use msc_host::test_utils::{MockDevice, MockHost};
//! use msc_host::usb::{DriverConfig, MscHost};
//! use std::sync::Arc;
//!
//! let mock = MockHost::new();
//! let address = mock.add_device(MockDevice::flash_drive());
//!
//! let host = MscHost::new(Arc::new(mock.clone()));
//! host.install(DriverConfig::new(|_| {}).with_event_task(None)).unwrap();
//!
//! let handle = host.install_device(address).unwrap();
//! assert_eq!(host.get_device_info(handle).unwrap().sector_size, 512);
//!
//! host.uninstall_device(handle).unwrap();
//! host.uninstall().unwrap();
//! assert_eq!(mock.open_handles(), 0);
//! ```

use crate::error::HostError;
use crate::usb::host::{
    ClientEvent, DmaBuffer, HostClient, HostResult, RawDevice, SetupPacket, SubmitError,
    Transfer, TransferStatus, UsbHost,
};
use crate::usb::lock;
use common::test_utils::{
    create_mock_device_descriptor, create_mock_hid_config_descriptor,
    create_mock_msc_config_descriptor, create_mock_string_descriptor,
};
use msc_proto::bot::{
    CommandBlockWrapper, CommandStatusWrapper, CswStatus, REQUEST_BULK_ONLY_RESET,
    REQUEST_GET_MAX_LUN,
};
use msc_proto::scsi::{
    Capacity, INQUIRY, INQUIRY_LEN, READ_CAPACITY_10, REQUEST_SENSE, SenseData, SenseKey,
    TEST_UNIT_READY,
};
use msc_proto::{DeviceDescriptor, Direction};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Delay before flushed transfers come back cancelled
const FLUSH_COMPLETION_DELAY: Duration = Duration::from_millis(20);

/// A host library operation, as recorded by [`MockHost`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostOp {
    Register,
    Deregister,
    Open { address: u8 },
    Close { device: RawDevice },
    Claim { interface: u8 },
    Release { interface: u8 },
    AllocTransfer { size: usize },
    FreeTransfer,
    Submit { endpoint: u8, len: usize },
    SubmitControl { request: u8 },
    Halt { endpoint: u8 },
    Flush { endpoint: u8 },
    /// A held transfer was handed back after a flush
    Complete { endpoint: u8, status: TransferStatus },
    Clear { endpoint: u8 },
}

/// A simulated USB device
#[derive(Debug, Clone)]
pub struct MockDevice {
    descriptor: DeviceDescriptor,
    config: Vec<u8>,
    strings: HashMap<u8, String>,
    block_size: u32,
    block_count: u32,
    not_ready_polls: u32,
    sense_key: SenseKey,
    max_lun: Option<u8>,
    short_replies: HashMap<u8, usize>,
}

impl MockDevice {
    /// 4 GB flash drive: 7,864,320 blocks of 512 bytes, bulk MPS 64
    pub fn flash_drive() -> Self {
        let strings = [(1, "SanDisk"), (2, "Cruzer Blade"), (3, "4C530001")]
            .into_iter()
            .map(|(index, s)| (index, s.to_string()))
            .collect();

        Self {
            descriptor: create_mock_device_descriptor(0x0781, 0x5567),
            config: create_mock_msc_config_descriptor(64),
            strings,
            block_size: 512,
            block_count: 7_864_320,
            not_ready_polls: 0,
            sense_key: SenseKey::NotReady,
            max_lun: Some(0),
            short_replies: HashMap::new(),
        }
    }

    /// HID keyboard, no mass storage interface
    pub fn keyboard() -> Self {
        Self {
            descriptor: DeviceDescriptor {
                manufacturer_index: 0,
                product_index: 0,
                serial_number_index: 0,
                ..create_mock_device_descriptor(0x046d, 0xc31c)
            },
            config: create_mock_hid_config_descriptor(),
            strings: HashMap::new(),
            ..Self::flash_drive()
        }
    }

    pub fn with_config_descriptor(mut self, config: Vec<u8>) -> Self {
        self.config = config;
        self
    }

    pub fn with_device_descriptor(mut self, descriptor: DeviceDescriptor) -> Self {
        self.descriptor = descriptor;
        self
    }

    pub fn with_capacity(mut self, block_size: u32, block_count: u32) -> Self {
        self.block_size = block_size;
        self.block_count = block_count;
        self
    }

    /// Fail the first `polls` TEST UNIT READY commands
    pub fn with_not_ready_polls(mut self, polls: u32) -> Self {
        self.not_ready_polls = polls;
        self
    }

    /// Sense key reported after a failed TEST UNIT READY
    pub fn with_sense_key(mut self, key: SenseKey) -> Self {
        self.sense_key = key;
        self
    }

    pub fn with_string(mut self, index: u8, s: &str) -> Self {
        self.strings.insert(index, s.to_string());
        self
    }

    /// `None` makes the device stall GET MAX LUN
    pub fn with_max_lun(mut self, max_lun: Option<u8>) -> Self {
        self.max_lun = max_lun;
        self
    }

    /// Answer `opcode` with at most `len` bytes of data
    pub fn with_short_reply(mut self, opcode: u8, len: usize) -> Self {
        self.short_replies.insert(opcode, len);
        self
    }
}

/// Bulk-Only Transport target state
#[derive(Debug)]
enum Phase {
    Command,
    DataIn {
        data: Vec<u8>,
        csw: CommandStatusWrapper,
    },
    /// Host to device data is accepted and dropped
    DataOut {
        csw: CommandStatusWrapper,
    },
    Status(CommandStatusWrapper),
}

struct Slot {
    address: u8,
    attached: bool,
    open_count: usize,
    device: MockDevice,
    phase: Phase,
    /// TEST UNIT READY failures still to report
    not_ready: u32,
    /// Sense data for the next REQUEST SENSE
    sense: Option<SenseData>,
}

impl Slot {
    fn new(address: u8, device: MockDevice) -> Self {
        Self {
            address,
            attached: true,
            open_count: 0,
            not_ready: device.not_ready_polls,
            device,
            phase: Phase::Command,
            sense: None,
        }
    }

    fn bulk(
        &mut self,
        direction: Direction,
        buf: &mut [u8],
        stall: bool,
    ) -> (TransferStatus, usize) {
        let phase = std::mem::replace(&mut self.phase, Phase::Command);
        match (direction, phase) {
            (Direction::In, Phase::DataIn { csw, .. }) if stall => {
                self.phase = Phase::Status(CommandStatusWrapper {
                    status: CswStatus::Failed,
                    ..csw
                });
                (TransferStatus::Stall, 0)
            }
            (Direction::In, phase) if stall => {
                self.phase = phase;
                (TransferStatus::Stall, 0)
            }
            (Direction::Out, Phase::Command) => match self.command(buf) {
                Some(phase) => {
                    self.phase = phase;
                    (TransferStatus::Completed, buf.len())
                }
                None => (TransferStatus::Stall, 0),
            },
            (Direction::Out, Phase::DataOut { csw }) => {
                self.phase = Phase::Status(csw);
                (TransferStatus::Completed, buf.len())
            }
            (Direction::In, Phase::DataIn { data, csw }) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                self.phase = Phase::Status(csw);
                (TransferStatus::Completed, n)
            }
            (Direction::In, Phase::Status(csw)) => {
                let bytes = csw.to_bytes();
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                (TransferStatus::Completed, n)
            }
            (_, phase) => {
                debug!("Mock target: unexpected {:?} transfer in {:?}", direction, phase);
                self.phase = phase;
                (TransferStatus::Stall, 0)
            }
        }
    }

    /// Accept a Command Block Wrapper, returning the phase that follows it
    fn command(&mut self, buf: &[u8]) -> Option<Phase> {
        let cbw = match CommandBlockWrapper::parse(buf) {
            Ok(cbw) => cbw,
            Err(e) => {
                debug!("Mock target rejected CBW: {}", e);
                return None;
            }
        };

        let opcode = cbw.command()[0];
        let (mut data, status) = match opcode {
            INQUIRY => (inquiry_data(), CswStatus::Passed),
            TEST_UNIT_READY if self.not_ready > 0 => {
                self.not_ready -= 1;
                self.sense = Some(SenseData {
                    key: self.device.sense_key,
                    asc: 0x3a,
                    ascq: 0x00,
                });
                (Vec::new(), CswStatus::Failed)
            }
            TEST_UNIT_READY => (Vec::new(), CswStatus::Passed),
            REQUEST_SENSE => {
                let sense = self.sense.take().unwrap_or(SenseData {
                    key: SenseKey::NoSense,
                    asc: 0,
                    ascq: 0,
                });
                (sense.to_bytes().to_vec(), CswStatus::Passed)
            }
            READ_CAPACITY_10 => {
                let capacity = Capacity {
                    block_size: self.device.block_size,
                    block_count: self.device.block_count,
                };
                (capacity.to_bytes().to_vec(), CswStatus::Passed)
            }
            _ => {
                self.sense = Some(SenseData {
                    key: SenseKey::IllegalRequest,
                    asc: 0x20,
                    ascq: 0x00,
                });
                (Vec::new(), CswStatus::Failed)
            }
        };

        let expected = cbw.data_transfer_length as usize;
        data.truncate(expected);
        if let Some(&len) = self.device.short_replies.get(&opcode) {
            data.truncate(len);
        }
        let csw = CommandStatusWrapper {
            tag: cbw.tag,
            data_residue: (expected - data.len()) as u32,
            status,
        };

        Some(match (expected, cbw.direction) {
            (0, _) => Phase::Status(csw),
            (_, Direction::In) => Phase::DataIn { data, csw },
            (_, Direction::Out) => Phase::DataOut { csw },
        })
    }

    /// Class requests on the default pipe; returns data stage bytes
    fn control(&mut self, setup: SetupPacket, data: &mut [u8]) -> (TransferStatus, usize) {
        match (setup.request_type, setup.request) {
            (0x21, REQUEST_BULK_ONLY_RESET) => {
                self.phase = Phase::Command;
                (TransferStatus::Completed, 0)
            }
            (0xa1, REQUEST_GET_MAX_LUN) => match (self.device.max_lun, data.first_mut()) {
                (Some(lun), Some(byte)) => {
                    *byte = lun;
                    (TransferStatus::Completed, 1)
                }
                _ => (TransferStatus::Stall, 0),
            },
            _ => (TransferStatus::Stall, 0),
        }
    }
}

fn inquiry_data() -> Vec<u8> {
    let mut data = vec![0u8; INQUIRY_LEN];
    data[1] = 0x80; // removable
    data[2] = 0x06;
    data[4] = (INQUIRY_LEN - 5) as u8;
    pad_ascii(&mut data[8..16], "Mock");
    pad_ascii(&mut data[16..32], "Flash Disk");
    pad_ascii(&mut data[32..36], "1.00");
    data
}

fn pad_ascii(field: &mut [u8], s: &str) {
    field.fill(b' ');
    let n = s.len().min(field.len());
    field[..n].copy_from_slice(&s.as_bytes()[..n]);
}

/// One-shot faults, consumed by the next matching call
#[derive(Debug, Default)]
struct Faults {
    register: bool,
    transfer_alloc: bool,
    claim: bool,
    release: bool,
    stall_bulk_in: bool,
    /// Hold every submitted transfer until its endpoint is flushed
    hang: bool,
}

struct MockState {
    slots: HashMap<RawDevice, Slot>,
    next_raw: u32,
    next_address: u8,
    events: VecDeque<ClientEvent>,
    max_events: usize,
    registered: bool,
    unblocked: bool,
    claimed: HashSet<(RawDevice, u8)>,
    transfers: usize,
    submissions: usize,
    held: Vec<Transfer>,
    faults: Faults,
    ops: Vec<HostOp>,
}

impl MockState {
    fn slot(&mut self, device: RawDevice) -> HostResult<&mut Slot> {
        match self.slots.get_mut(&device) {
            Some(slot) if slot.open_count > 0 => Ok(slot),
            _ => Err(HostError::InvalidArgument),
        }
    }

    fn push_event(&mut self, event: ClientEvent) {
        if self.events.len() >= self.max_events {
            warn!("Mock client event queue full, dropping {:?}", event);
            return;
        }
        self.events.push_back(event);
    }
}

struct MockInner {
    state: Mutex<MockState>,
    cond: Condvar,
}

/// Simulated host library
///
/// Clones share the same simulated bus.
#[derive(Clone)]
pub struct MockHost {
    inner: Arc<MockInner>,
}

impl Default for MockHost {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHost {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MockInner {
                state: Mutex::new(MockState {
                    slots: HashMap::new(),
                    next_raw: 1,
                    next_address: 1,
                    events: VecDeque::new(),
                    max_events: usize::MAX,
                    registered: false,
                    unblocked: false,
                    claimed: HashSet::new(),
                    transfers: 0,
                    submissions: 0,
                    held: Vec::new(),
                    faults: Faults::default(),
                    ops: Vec::new(),
                }),
                cond: Condvar::new(),
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        lock(&self.inner.state)
    }

    /// Attach a device without notifying the client; returns its address
    pub fn add_device(&self, device: MockDevice) -> u8 {
        let mut state = self.state();
        let address = state.next_address;
        state.next_address = state.next_address.wrapping_add(1).max(1);
        let raw = RawDevice(state.next_raw);
        state.next_raw += 1;
        state.slots.insert(raw, Slot::new(address, device));
        address
    }

    /// Attach a device and queue a new-device event
    pub fn connect(&self, device: MockDevice) -> u8 {
        let address = self.add_device(device);
        self.state().push_event(ClientEvent::NewDevice { address });
        self.inner.cond.notify_all();
        address
    }

    /// Detach the device at `address` and queue a device-gone event
    pub fn disconnect(&self, address: u8) {
        let mut state = self.state();
        let Some(raw) = find_attached(&state, address) else {
            return;
        };
        if let Some(slot) = state.slots.get_mut(&raw) {
            slot.attached = false;
            if slot.open_count == 0 {
                state.slots.remove(&raw);
            }
        }
        state.push_event(ClientEvent::DeviceGone { device: raw });
        drop(state);
        self.inner.cond.notify_all();
    }

    /// Host library identity of the device at `address`
    pub fn raw_device(&self, address: u8) -> Option<RawDevice> {
        find_attached(&self.state(), address)
    }

    pub fn fail_next_register(&self) {
        self.state().faults.register = true;
    }

    pub fn fail_next_transfer_alloc(&self) {
        self.state().faults.transfer_alloc = true;
    }

    pub fn fail_next_claim(&self) {
        self.state().faults.claim = true;
    }

    pub fn fail_next_release(&self) {
        self.state().faults.release = true;
    }

    pub fn stall_next_bulk_in(&self) {
        self.state().faults.stall_bulk_in = true;
    }

    /// Stop completing transfers until their endpoint is flushed
    pub fn hang_transfers(&self, hang: bool) {
        self.state().faults.hang = hang;
    }

    pub fn ops(&self) -> Vec<HostOp> {
        self.state().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.state().ops.clear();
    }

    /// Bulk and control submissions so far
    pub fn submissions(&self) -> usize {
        self.state().submissions
    }

    /// Open device handles across all devices
    pub fn open_handles(&self) -> usize {
        self.state().slots.values().map(|slot| slot.open_count).sum()
    }

    pub fn claimed_interfaces(&self) -> usize {
        self.state().claimed.len()
    }

    /// Transfers allocated and not yet freed
    pub fn outstanding_transfers(&self) -> usize {
        self.state().transfers
    }

    pub fn is_registered(&self) -> bool {
        self.state().registered
    }
}

fn find_attached(state: &MockState, address: u8) -> Option<RawDevice> {
    state
        .slots
        .iter()
        .find(|(_, slot)| slot.attached && slot.address == address)
        .map(|(raw, _)| *raw)
}

impl UsbHost for MockHost {
    fn register_client(&self, max_events: usize) -> HostResult<Arc<dyn HostClient>> {
        let mut state = self.state();
        if std::mem::take(&mut state.faults.register) {
            return Err(HostError::NoMemory);
        }
        if state.registered {
            return Err(HostError::InvalidState);
        }
        state.registered = true;
        state.unblocked = false;
        state.max_events = max_events.max(1);
        state.ops.push(HostOp::Register);

        Ok(Arc::new(MockClient {
            inner: self.inner.clone(),
        }))
    }
}

struct MockClient {
    inner: Arc<MockInner>,
}

impl MockClient {
    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        lock(&self.inner.state)
    }

    fn complete_flushed(inner: Arc<MockInner>, transfers: Vec<Transfer>) {
        let spawned = thread::Builder::new()
            .name("mock-flush".to_string())
            .spawn(move || {
                thread::sleep(FLUSH_COMPLETION_DELAY);
                for transfer in transfers {
                    lock(&inner.state).ops.push(HostOp::Complete {
                        endpoint: transfer.endpoint,
                        status: TransferStatus::Canceled,
                    });
                    transfer.complete(TransferStatus::Canceled, 0);
                }
            });
        if let Err(e) = spawned {
            warn!("Failed to spawn flush completion thread: {}", e);
        }
    }
}

impl HostClient for MockClient {
    fn handle_events(&self, timeout: Option<Duration>) -> HostResult<Vec<ClientEvent>> {
        let guard = self.state();
        let waiting = |state: &mut MockState| state.events.is_empty() && !state.unblocked;
        let mut state = match timeout {
            Some(timeout) => {
                self.inner
                    .cond
                    .wait_timeout_while(guard, timeout, waiting)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
            None => self
                .inner
                .cond
                .wait_while(guard, waiting)
                .unwrap_or_else(PoisonError::into_inner),
        };
        state.unblocked = false;
        Ok(state.events.drain(..).collect())
    }

    fn unblock(&self) -> HostResult<()> {
        self.state().unblocked = true;
        self.inner.cond.notify_all();
        Ok(())
    }

    fn deregister(&self) -> HostResult<()> {
        let mut state = self.state();
        state.ops.push(HostOp::Deregister);
        state.registered = false;
        if state.slots.values().any(|slot| slot.open_count > 0) {
            return Err(HostError::InvalidState);
        }
        Ok(())
    }

    fn open_device(&self, address: u8) -> HostResult<RawDevice> {
        let mut state = self.state();
        let raw = find_attached(&state, address).ok_or(HostError::NotFound)?;
        if let Some(slot) = state.slots.get_mut(&raw) {
            slot.open_count += 1;
        }
        state.ops.push(HostOp::Open { address });
        Ok(raw)
    }

    fn close_device(&self, device: RawDevice) -> HostResult<()> {
        let mut state = self.state();
        let slot = state.slot(device)?;
        slot.open_count -= 1;
        if !slot.attached && slot.open_count == 0 {
            state.slots.remove(&device);
        }
        state.ops.push(HostOp::Close { device });
        Ok(())
    }

    fn device_descriptor(&self, device: RawDevice) -> HostResult<DeviceDescriptor> {
        Ok(self.state().slot(device)?.device.descriptor)
    }

    fn active_config_descriptor(&self, device: RawDevice) -> HostResult<Vec<u8>> {
        Ok(self.state().slot(device)?.device.config.clone())
    }

    fn string_descriptor(&self, device: RawDevice, index: u8) -> HostResult<Vec<u8>> {
        let mut state = self.state();
        let slot = state.slot(device)?;
        slot.device
            .strings
            .get(&index)
            .map(|s| create_mock_string_descriptor(s))
            .ok_or(HostError::NotFound)
    }

    fn claim_interface(
        &self,
        device: RawDevice,
        interface: u8,
        _alt_setting: u8,
    ) -> HostResult<()> {
        let mut state = self.state();
        if std::mem::take(&mut state.faults.claim) {
            return Err(HostError::Io("interface claim refused".to_string()));
        }
        if !state.slot(device)?.attached {
            return Err(HostError::NoDevice);
        }
        if !state.claimed.insert((device, interface)) {
            return Err(HostError::InvalidState);
        }
        state.ops.push(HostOp::Claim { interface });
        Ok(())
    }

    fn release_interface(&self, device: RawDevice, interface: u8) -> HostResult<()> {
        let mut state = self.state();
        state.ops.push(HostOp::Release { interface });
        if std::mem::take(&mut state.faults.release) {
            return Err(HostError::Io("interface release failed".to_string()));
        }
        if !state.claimed.remove(&(device, interface)) {
            return Err(HostError::InvalidArgument);
        }
        Ok(())
    }

    fn alloc_transfer(&self, size: usize) -> HostResult<Transfer> {
        let mut state = self.state();
        if std::mem::take(&mut state.faults.transfer_alloc) {
            return Err(HostError::NoMemory);
        }
        state.transfers += 1;
        state.ops.push(HostOp::AllocTransfer { size });
        Ok(Transfer::new(DmaBuffer::dma(size)))
    }

    fn free_transfer(&self, _transfer: Transfer) -> HostResult<()> {
        let mut state = self.state();
        state.transfers = state.transfers.saturating_sub(1);
        state.ops.push(HostOp::FreeTransfer);
        Ok(())
    }

    fn alloc_dma_buffer(&self, size: usize) -> HostResult<DmaBuffer> {
        if size == 0 {
            return Err(HostError::InvalidArgument);
        }
        Ok(DmaBuffer::dma(size))
    }

    fn submit(&self, mut transfer: Transfer) -> Result<(), SubmitError> {
        let mut guard = self.state();
        let state = &mut *guard;
        state.submissions += 1;
        state.ops.push(HostOp::Submit {
            endpoint: transfer.endpoint,
            len: transfer.num_bytes,
        });

        if transfer.num_bytes > transfer.capacity() {
            return Err(SubmitError {
                error: HostError::InvalidArgument,
                transfer,
            });
        }
        let slot = match state.slots.get_mut(&transfer.device) {
            Some(slot) if slot.attached && slot.open_count > 0 => slot,
            _ => {
                return Err(SubmitError {
                    error: HostError::NoDevice,
                    transfer,
                });
            }
        };
        if state.faults.hang {
            state.held.push(transfer);
            return Ok(());
        }

        let direction = Direction::of_endpoint(transfer.endpoint);
        let stall = direction == Direction::In && std::mem::take(&mut state.faults.stall_bulk_in);
        let len = transfer.num_bytes;
        let (status, actual) = slot.bulk(direction, &mut transfer.data_mut()[..len], stall);
        drop(guard);

        transfer.complete(status, actual);
        Ok(())
    }

    fn submit_control(&self, mut transfer: Transfer) -> Result<(), SubmitError> {
        let mut guard = self.state();
        let state = &mut *guard;
        state.submissions += 1;

        let setup = match SetupPacket::parse(transfer.data()) {
            Some(setup)
                if transfer.num_bytes == SetupPacket::LEN + usize::from(setup.length)
                    && transfer.num_bytes <= transfer.capacity() =>
            {
                setup
            }
            _ => {
                return Err(SubmitError {
                    error: HostError::InvalidArgument,
                    transfer,
                });
            }
        };
        state.ops.push(HostOp::SubmitControl {
            request: setup.request,
        });

        let slot = match state.slots.get_mut(&transfer.device) {
            Some(slot) if slot.attached && slot.open_count > 0 => slot,
            _ => {
                return Err(SubmitError {
                    error: HostError::NoDevice,
                    transfer,
                });
            }
        };
        if state.faults.hang {
            state.held.push(transfer);
            return Ok(());
        }

        let len = transfer.num_bytes;
        let (status, n) = slot.control(setup, &mut transfer.data_mut()[SetupPacket::LEN..len]);
        drop(guard);

        let actual = match status {
            TransferStatus::Completed => SetupPacket::LEN + n,
            _ => 0,
        };
        transfer.complete(status, actual);
        Ok(())
    }

    fn endpoint_halt(&self, device: RawDevice, endpoint: u8) -> HostResult<()> {
        let mut state = self.state();
        state.slot(device)?;
        state.ops.push(HostOp::Halt { endpoint });
        Ok(())
    }

    fn endpoint_flush(&self, device: RawDevice, endpoint: u8) -> HostResult<()> {
        let mut state = self.state();
        state.slot(device)?;
        state.ops.push(HostOp::Flush { endpoint });

        let (flushed, kept): (Vec<Transfer>, Vec<Transfer>) = std::mem::take(&mut state.held)
            .into_iter()
            .partition(|t| t.device == device && t.endpoint == endpoint);
        state.held = kept;
        drop(state);

        if !flushed.is_empty() {
            Self::complete_flushed(self.inner.clone(), flushed);
        }
        Ok(())
    }

    fn endpoint_clear(&self, device: RawDevice, endpoint: u8) -> HostResult<()> {
        let mut state = self.state();
        state.slot(device)?;
        state.ops.push(HostOp::Clear { endpoint });
        Ok(())
    }
}
