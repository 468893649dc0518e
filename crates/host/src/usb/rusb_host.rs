//! libusb host library via rusb
//!
//! Hot-plug notifications are queued by a rusb `Hotplug` callback and drained
//! by [`HostClient::handle_events`], which drives `libusb_handle_events()`.
//! Transfers run as blocking libusb calls on short-lived I/O threads and
//! complete through the transfer's callback, so the driver sees the same
//! asynchronous contract it would on an embedded host stack.
//!
//! libusb's synchronous API cannot cancel an in-flight call, so halt and
//! flush only log; a hung transfer returns once its libusb timeout expires.

use crate::error::HostError;
use crate::usb::host::{
    ClientEvent, DmaBuffer, HostClient, HostResult, RawDevice, SetupPacket, SubmitError,
    Transfer, TransferStatus, UsbHost,
};
use crate::usb::lock;
use msc_proto::descriptor::{DT_CONFIGURATION, DT_STRING};
use msc_proto::{DeviceDescriptor, Direction};
use rusb::{Context, Device, Hotplug, HotplugBuilder, Registration, UsbContext};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Standard GET_DESCRIPTOR request
const REQUEST_GET_DESCRIPTOR: u8 = 0x06;
/// bmRequestType for standard device-to-host requests
const STANDARD_DEVICE_IN: u8 = 0x80;
/// US English, used when a device lists no languages
const DEFAULT_LANGUAGE_ID: u16 = 0x0409;
/// Timeout for descriptor requests
const DESCRIPTOR_TIMEOUT: Duration = Duration::from_secs(1);
/// Longest single `libusb_handle_events()` wait
const EVENT_SLICE: Duration = Duration::from_millis(100);

/// Host library backed by the system libusb
pub struct RusbHost {
    context: Context,
    bus: Option<u8>,
}

impl RusbHost {
    pub fn new() -> Result<Self, rusb::Error> {
        Ok(Self {
            context: Context::new()?,
            bus: None,
        })
    }

    /// Only report devices on `bus`
    pub fn with_bus(mut self, bus: Option<u8>) -> Self {
        self.bus = bus;
        self
    }
}

impl UsbHost for RusbHost {
    fn register_client(&self, max_events: usize) -> HostResult<Arc<dyn HostClient>> {
        let shared = Arc::new(Shared {
            events: Mutex::new(VecDeque::new()),
            max_events: max_events.max(1),
            bus: self.bus,
        });

        let registration = if rusb::has_hotplug() {
            let callback = HotplugCallback {
                shared: shared.clone(),
            };
            let registration = HotplugBuilder::new()
                .enumerate(true)
                .register(&self.context, Box::new(callback))
                .map_err(map_rusb_error)?;
            debug!("Hot-plug callbacks registered");
            Some(registration)
        } else {
            warn!("libusb has no hot-plug support, reporting attached devices only");
            for device in self.context.devices().map_err(map_rusb_error)?.iter() {
                shared.arrived(&device);
            }
            None
        };

        Ok(Arc::new(RusbClient {
            context: self.context.clone(),
            shared,
            registration: Mutex::new(registration),
            unblocked: AtomicBool::new(false),
            open: Mutex::new(HashMap::new()),
        }))
    }
}

/// State shared with the hot-plug callback
struct Shared {
    events: Mutex<VecDeque<ClientEvent>>,
    max_events: usize,
    bus: Option<u8>,
}

impl Shared {
    fn wanted<T: UsbContext>(&self, device: &Device<T>) -> bool {
        self.bus.is_none_or(|bus| bus == device.bus_number())
    }

    fn push(&self, event: ClientEvent) {
        let mut events = lock(&self.events);
        if events.len() >= self.max_events {
            warn!("Client event queue full, dropping {:?}", event);
            return;
        }
        events.push_back(event);
    }

    fn arrived<T: UsbContext>(&self, device: &Device<T>) {
        if self.wanted(device) {
            self.push(ClientEvent::NewDevice {
                address: device.address(),
            });
        }
    }
}

struct HotplugCallback {
    shared: Arc<Shared>,
}

impl<T: UsbContext> Hotplug<T> for HotplugCallback {
    fn device_arrived(&mut self, device: Device<T>) {
        debug!(
            "Hot-plug: device arrived (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        self.shared.arrived(&device);
    }

    fn device_left(&mut self, device: Device<T>) {
        debug!(
            "Hot-plug: device left (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        if self.shared.wanted(&device) {
            self.shared.push(ClientEvent::DeviceGone {
                device: raw_id(device.bus_number(), device.address()),
            });
        }
    }
}

struct OpenDevice {
    device: Device<Context>,
    handle: Arc<rusb::DeviceHandle<Context>>,
    refs: usize,
}

/// A registered client of [`RusbHost`]
struct RusbClient {
    context: Context,
    shared: Arc<Shared>,
    registration: Mutex<Option<Registration<Context>>>,
    unblocked: AtomicBool,
    open: Mutex<HashMap<RawDevice, OpenDevice>>,
}

fn raw_id(bus: u8, address: u8) -> RawDevice {
    RawDevice(u32::from(bus) << 8 | u32::from(address))
}

impl RusbClient {
    fn handle(&self, device: RawDevice) -> HostResult<Arc<rusb::DeviceHandle<Context>>> {
        lock(&self.open)
            .get(&device)
            .map(|open| open.handle.clone())
            .ok_or(HostError::InvalidArgument)
    }

    fn device(&self, device: RawDevice) -> HostResult<Device<Context>> {
        lock(&self.open)
            .get(&device)
            .map(|open| open.device.clone())
            .ok_or(HostError::InvalidArgument)
    }

    fn get_descriptor(
        &self,
        handle: &rusb::DeviceHandle<Context>,
        kind: u8,
        index: u8,
        language: u16,
        buf: &mut [u8],
    ) -> HostResult<usize> {
        handle
            .read_control(
                STANDARD_DEVICE_IN,
                REQUEST_GET_DESCRIPTOR,
                u16::from(kind) << 8 | u16::from(index),
                language,
                buf,
                DESCRIPTOR_TIMEOUT,
            )
            .map_err(map_rusb_error)
    }

    /// Spawn an I/O thread for one transfer
    ///
    /// The transfer is parked in a slot the thread takes it from, so it can
    /// be handed back if the thread cannot be started.
    fn spawn_io(
        &self,
        transfer: Transfer,
        io: impl FnOnce(&rusb::DeviceHandle<Context>, &mut Transfer) -> (TransferStatus, usize)
        + Send
        + 'static,
    ) -> Result<(), SubmitError> {
        let handle = match self.handle(transfer.device) {
            Ok(handle) => handle,
            Err(error) => return Err(SubmitError { error, transfer }),
        };

        let slot = Arc::new(Mutex::new(Some(transfer)));
        let parked = slot.clone();
        let spawned = thread::Builder::new()
            .name("usb-msc-io".to_string())
            .spawn(move || {
                let parked = lock(&parked).take();
                if let Some(mut transfer) = parked {
                    let (status, actual) = io(&handle, &mut transfer);
                    transfer.complete(status, actual);
                }
            });

        match spawned {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!("Failed to spawn transfer thread: {}", e);
                match lock(&slot).take() {
                    Some(transfer) => Err(SubmitError {
                        error: HostError::NoMemory,
                        transfer,
                    }),
                    None => Ok(()),
                }
            }
        }
    }
}

impl HostClient for RusbClient {
    fn handle_events(&self, timeout: Option<Duration>) -> HostResult<Vec<ClientEvent>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let events: Vec<_> = lock(&self.shared.events).drain(..).collect();
            if !events.is_empty() || self.unblocked.swap(false, Ordering::AcqRel) {
                return Ok(events);
            }

            let slice = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(Vec::new());
                    }
                    remaining.min(EVENT_SLICE)
                }
                None => EVENT_SLICE,
            };

            match self.context.handle_events(Some(slice)) {
                Ok(()) | Err(rusb::Error::Interrupted) => {}
                Err(e) => return Err(map_rusb_error(e)),
            }
        }
    }

    fn unblock(&self) -> HostResult<()> {
        self.unblocked.store(true, Ordering::Release);
        self.context.interrupt_handle_events();
        Ok(())
    }

    fn deregister(&self) -> HostResult<()> {
        if lock(&self.registration).take().is_some() {
            debug!("Hot-plug callbacks deregistered");
        }
        let leaked = lock(&self.open).len();
        if leaked > 0 {
            warn!("{} device(s) still open at deregistration", leaked);
            return Err(HostError::InvalidState);
        }
        Ok(())
    }

    fn open_device(&self, address: u8) -> HostResult<RawDevice> {
        let device = self
            .context
            .devices()
            .map_err(map_rusb_error)?
            .iter()
            .find(|d| d.address() == address && self.shared.wanted(d))
            .ok_or(HostError::NotFound)?;
        let raw = raw_id(device.bus_number(), address);

        let mut open = lock(&self.open);
        if let Some(existing) = open.get_mut(&raw) {
            existing.refs += 1;
            return Ok(raw);
        }

        let handle = device.open().map_err(map_rusb_error)?;
        trace!("Opened {:?}", raw);
        open.insert(
            raw,
            OpenDevice {
                device,
                handle: Arc::new(handle),
                refs: 1,
            },
        );
        Ok(raw)
    }

    fn close_device(&self, device: RawDevice) -> HostResult<()> {
        let mut open = lock(&self.open);
        let entry = open.get_mut(&device).ok_or(HostError::InvalidArgument)?;
        entry.refs -= 1;
        if entry.refs == 0 {
            open.remove(&device);
            trace!("Closed {:?}", device);
        }
        Ok(())
    }

    fn device_descriptor(&self, device: RawDevice) -> HostResult<DeviceDescriptor> {
        let desc = self
            .device(device)?
            .device_descriptor()
            .map_err(map_rusb_error)?;
        Ok(DeviceDescriptor {
            vendor_id: desc.vendor_id(),
            product_id: desc.product_id(),
            class: desc.class_code(),
            subclass: desc.sub_class_code(),
            protocol: desc.protocol_code(),
            max_packet_size_0: desc.max_packet_size(),
            manufacturer_index: desc.manufacturer_string_index().unwrap_or(0),
            product_index: desc.product_string_index().unwrap_or(0),
            serial_number_index: desc.serial_number_string_index().unwrap_or(0),
            num_configurations: desc.num_configurations(),
        })
    }

    fn active_config_descriptor(&self, device: RawDevice) -> HostResult<Vec<u8>> {
        let usb_device = self.device(device)?;
        let handle = self.handle(device)?;

        let active = usb_device
            .active_config_descriptor()
            .map_err(map_rusb_error)?
            .number();
        let count = usb_device
            .device_descriptor()
            .map_err(map_rusb_error)?
            .num_configurations();
        let index = (0..count)
            .find(|&i| {
                usb_device
                    .config_descriptor(i)
                    .is_ok_and(|config| config.number() == active)
            })
            .ok_or(HostError::NotFound)?;

        let mut header = [0u8; 9];
        if self.get_descriptor(&handle, DT_CONFIGURATION, index, 0, &mut header)? < 4 {
            return Err(HostError::Io("short configuration descriptor".to_string()));
        }
        let total = usize::from(u16::from_le_bytes([header[2], header[3]]));

        let mut config = vec![0u8; total];
        let n = self.get_descriptor(&handle, DT_CONFIGURATION, index, 0, &mut config)?;
        config.truncate(n);
        Ok(config)
    }

    fn string_descriptor(&self, device: RawDevice, index: u8) -> HostResult<Vec<u8>> {
        let handle = self.handle(device)?;

        let mut languages = [0u8; 255];
        let n = self.get_descriptor(&handle, DT_STRING, 0, 0, &mut languages)?;
        let language = if n >= 4 {
            u16::from_le_bytes([languages[2], languages[3]])
        } else {
            DEFAULT_LANGUAGE_ID
        };

        let mut desc = vec![0u8; 255];
        let n = self.get_descriptor(&handle, DT_STRING, index, language, &mut desc)?;
        desc.truncate(n);
        Ok(desc)
    }

    fn claim_interface(
        &self,
        device: RawDevice,
        interface: u8,
        alt_setting: u8,
    ) -> HostResult<()> {
        let handle = self.handle(device)?;
        if let Err(e) = handle.set_auto_detach_kernel_driver(true) {
            debug!("Kernel driver auto-detach unavailable: {}", e);
        }
        handle
            .claim_interface(interface)
            .map_err(map_rusb_error)?;
        if alt_setting != 0 {
            handle
                .set_alternate_setting(interface, alt_setting)
                .map_err(map_rusb_error)?;
        }
        Ok(())
    }

    fn release_interface(&self, device: RawDevice, interface: u8) -> HostResult<()> {
        self.handle(device)?
            .release_interface(interface)
            .map_err(map_rusb_error)
    }

    fn alloc_transfer(&self, size: usize) -> HostResult<Transfer> {
        Ok(Transfer::new(DmaBuffer::dma(size)))
    }

    fn free_transfer(&self, _transfer: Transfer) -> HostResult<()> {
        Ok(())
    }

    fn alloc_dma_buffer(&self, size: usize) -> HostResult<DmaBuffer> {
        Ok(DmaBuffer::dma(size))
    }

    fn submit(&self, transfer: Transfer) -> Result<(), SubmitError> {
        if transfer.num_bytes > transfer.capacity() {
            return Err(SubmitError {
                error: HostError::InvalidArgument,
                transfer,
            });
        }

        self.spawn_io(transfer, |handle, transfer| {
            let endpoint = transfer.endpoint;
            let len = transfer.num_bytes;
            let timeout = transfer.timeout;
            let result = match Direction::of_endpoint(endpoint) {
                Direction::In => {
                    handle.read_bulk(endpoint, &mut transfer.data_mut()[..len], timeout)
                }
                Direction::Out => handle.write_bulk(endpoint, &transfer.data()[..len], timeout),
            };
            match result {
                Ok(n) => (TransferStatus::Completed, n),
                Err(e) => {
                    debug!("Bulk transfer on endpoint {:#04x} failed: {}", endpoint, e);
                    (transfer_status(e), 0)
                }
            }
        })
    }

    fn submit_control(&self, transfer: Transfer) -> Result<(), SubmitError> {
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

        self.spawn_io(transfer, move |handle, transfer| {
            let timeout = transfer.timeout;
            let len = transfer.num_bytes;
            let data = &mut transfer.data_mut()[SetupPacket::LEN..len];
            let result = match setup.direction() {
                Direction::In => handle.read_control(
                    setup.request_type,
                    setup.request,
                    setup.value,
                    setup.index,
                    data,
                    timeout,
                ),
                Direction::Out => handle.write_control(
                    setup.request_type,
                    setup.request,
                    setup.value,
                    setup.index,
                    data,
                    timeout,
                ),
            };
            match result {
                Ok(n) => (TransferStatus::Completed, SetupPacket::LEN + n),
                Err(e) => {
                    debug!("Control request {:#04x} failed: {}", setup.request, e);
                    (transfer_status(e), 0)
                }
            }
        })
    }

    fn endpoint_halt(&self, device: RawDevice, endpoint: u8) -> HostResult<()> {
        self.handle(device)?;
        debug!("Halt of endpoint {:#04x} on {:?} is a no-op under libusb", endpoint, device);
        Ok(())
    }

    fn endpoint_flush(&self, device: RawDevice, endpoint: u8) -> HostResult<()> {
        self.handle(device)?;
        debug!(
            "Flush of endpoint {:#04x} on {:?} waits for the libusb timeout",
            endpoint, device
        );
        Ok(())
    }

    fn endpoint_clear(&self, device: RawDevice, endpoint: u8) -> HostResult<()> {
        self.handle(device)?
            .clear_halt(endpoint)
            .map_err(map_rusb_error)
    }
}

/// Map a rusb error to a host library error
pub fn map_rusb_error(err: rusb::Error) -> HostError {
    match err {
        rusb::Error::Timeout => HostError::Timeout,
        rusb::Error::NoDevice => HostError::NoDevice,
        rusb::Error::NotFound => HostError::NotFound,
        rusb::Error::NoMem => HostError::NoMemory,
        rusb::Error::InvalidParam => HostError::InvalidArgument,
        rusb::Error::Busy => HostError::InvalidState,
        _ => HostError::Io(err.to_string()),
    }
}

/// Final transfer status for a failed libusb call
fn transfer_status(err: rusb::Error) -> TransferStatus {
    match err {
        rusb::Error::Timeout => TransferStatus::TimedOut,
        rusb::Error::Pipe => TransferStatus::Stall,
        rusb::Error::NoDevice => TransferStatus::NoDevice,
        rusb::Error::Overflow => TransferStatus::Overflow,
        rusb::Error::Interrupted => TransferStatus::Canceled,
        _ => TransferStatus::Error,
    }
}
