//! Driver registry and event dispatch
//!
//! [`MscHost`] is the driver context. While installed it holds one
//! `DriverState`: the host library client, the user callback, the optional
//! dispatch thread, and the registry of installed devices.
//!
//! The registry lock is only held while the device map is read or changed,
//! never across I/O, so the dispatcher and callers installing or removing
//! devices can run concurrently.

use crate::error::{MscError, Result};
use crate::usb::device::MscDevice;
use crate::usb::host::{ClientEvent, DmaBuffer, HostClient, RawDevice, SetupPacket, UsbHost};
use crate::usb::{lock, scsi, worker};
use msc_proto::{DeviceHandle, DeviceInfo, Direction, MscEvent, find_msc_interface};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default size of a device's transfer buffer, before MPS rounding
pub const DEFAULT_TRANSFER_BUFFER_SIZE: usize = 64;

/// Client events the host library may queue for the driver
const MAX_CLIENT_EVENTS: usize = 5;

/// User callback for device events
///
/// Runs on whichever thread pumps host events, usually the dispatch thread.
/// It must not block on the driver; forward the event instead.
pub type EventCallback = Arc<dyn Fn(&MscEvent) + Send + Sync>;

/// Fixed timeouts applied by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Bulk and control transfers
    pub transfer: Duration,
    /// Total budget for the unit to become ready during install
    pub ready_budget: Duration,
    /// Interval between TEST UNIT READY polls
    pub ready_poll: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            transfer: Duration::from_millis(5000),
            ready_budget: Duration::from_millis(3000),
            ready_poll: Duration::from_millis(100),
        }
    }
}

/// Background dispatch thread request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventTaskConfig {
    pub stack_size: usize,
    /// Must be non-zero; not applied to hosted threads
    pub priority: u32,
    /// Preferred core; not applied to hosted threads
    pub core_id: Option<usize>,
}

impl Default for EventTaskConfig {
    fn default() -> Self {
        Self {
            stack_size: 256 * 1024,
            priority: 5,
            core_id: None,
        }
    }
}

/// Driver install configuration
#[derive(Clone)]
pub struct DriverConfig {
    /// Mandatory
    pub callback: Option<EventCallback>,
    /// `None` means the caller pumps events with [`MscHost::handle_events`]
    pub event_task: Option<EventTaskConfig>,
    pub timeouts: Timeouts,
    pub transfer_buffer_size: usize,
}

impl DriverConfig {
    /// Configuration with a dispatch thread and default timeouts
    pub fn new(callback: impl Fn(&MscEvent) + Send + Sync + 'static) -> Self {
        Self {
            callback: Some(Arc::new(callback)),
            ..Self::default()
        }
    }

    pub fn with_event_task(mut self, event_task: Option<EventTaskConfig>) -> Self {
        self.event_task = event_task;
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_transfer_buffer_size(mut self, size: usize) -> Self {
        self.transfer_buffer_size = size;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.callback.is_none() {
            return Err(MscError::InvalidArgument("an event callback is required"));
        }
        if let Some(task) = &self.event_task {
            if task.stack_size == 0 || task.priority == 0 {
                return Err(MscError::InvalidArgument(
                    "event task stack size and priority must be non-zero",
                ));
            }
        }
        if self.transfer_buffer_size == 0 {
            return Err(MscError::InvalidArgument(
                "transfer buffer size must be non-zero",
            ));
        }
        Ok(())
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            callback: None,
            event_task: Some(EventTaskConfig::default()),
            timeouts: Timeouts::default(),
            transfer_buffer_size: DEFAULT_TRANSFER_BUFFER_SIZE,
        }
    }
}

impl fmt::Debug for DriverConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverConfig")
            .field("callback", &self.callback.as_ref().map(|_| "Fn(&MscEvent)"))
            .field("event_task", &self.event_task)
            .field("timeouts", &self.timeouts)
            .field("transfer_buffer_size", &self.transfer_buffer_size)
            .finish()
    }
}

/// Where a device's transfer buffer currently lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferBufferInfo {
    pub addr: usize,
    pub capacity: usize,
}

struct Registry {
    devices: HashMap<DeviceHandle, Arc<MscDevice>>,
    /// Set once uninstall starts; no device may be added afterwards
    ending: bool,
    next_handle: u32,
}

/// State of an installed driver
pub(crate) struct DriverState {
    pub(crate) client: Arc<dyn HostClient>,
    callback: EventCallback,
    registry: Mutex<Registry>,
    event_task: Mutex<Option<JoinHandle<()>>>,
    pub(crate) timeouts: Timeouts,
    pub(crate) transfer_buffer_size: usize,
}

impl DriverState {
    fn new(client: Arc<dyn HostClient>, callback: EventCallback, config: &DriverConfig) -> Self {
        Self {
            client,
            callback,
            registry: Mutex::new(Registry {
                devices: HashMap::new(),
                ending: false,
                next_handle: 1,
            }),
            event_task: Mutex::new(None),
            timeouts: config.timeouts,
            transfer_buffer_size: config.transfer_buffer_size,
        }
    }

    pub(crate) fn is_ending(&self) -> bool {
        lock(&self.registry).ending
    }

    /// Wait for client events and dispatch them
    pub(crate) fn pump(&self, timeout: Option<Duration>) -> Result<()> {
        for event in self.client.handle_events(timeout)? {
            self.dispatch(event);
        }
        Ok(())
    }

    fn dispatch(&self, event: ClientEvent) {
        match event {
            ClientEvent::NewDevice { address } => match self.is_mass_storage(address) {
                Ok(true) => {
                    debug!("Mass storage device connected at address {}", address);
                    (self.callback)(&MscEvent::DeviceConnected { address });
                }
                Ok(false) => debug!("Device at address {} is not mass storage", address),
                Err(e) => warn!("Failed to classify device at address {}: {}", address, e),
            },
            ClientEvent::DeviceGone { device } => match self.find_by_raw(device) {
                Some(handle) => {
                    debug!("Mass storage device {:?} disconnected", handle);
                    (self.callback)(&MscEvent::DeviceDisconnected { handle });
                }
                None => debug!("Ignoring disconnect of {:?}", device),
            },
        }
    }

    /// Whether the device at `address` exposes a Bulk-Only interface
    fn is_mass_storage(&self, address: u8) -> Result<bool> {
        let raw = self.client.open_device(address)?;
        let result = self
            .client
            .active_config_descriptor(raw)
            .map(|config| find_msc_interface(&config).is_some());

        if let Err(e) = self.client.close_device(raw) {
            warn!("Failed to close classified device {:?}: {}", raw, e);
        }
        Ok(result?)
    }

    fn find_by_raw(&self, raw: RawDevice) -> Option<DeviceHandle> {
        lock(&self.registry)
            .devices
            .values()
            .find(|device| device.is_raw(raw))
            .map(|device| device.handle)
    }

    fn register_device(&self) -> Result<Arc<MscDevice>> {
        let mut registry = lock(&self.registry);
        if registry.ending {
            return Err(MscError::InvalidState("driver is being uninstalled"));
        }

        let mut handle = DeviceHandle(registry.next_handle);
        while registry.devices.contains_key(&handle) || handle.0 == 0 {
            handle = DeviceHandle(handle.0.wrapping_add(1));
        }
        registry.next_handle = handle.0.wrapping_add(1);

        let device = Arc::new(MscDevice::new(handle));
        registry.devices.insert(handle, device.clone());
        Ok(device)
    }

    fn unregister_device(&self, handle: DeviceHandle) -> Option<Arc<MscDevice>> {
        lock(&self.registry).devices.remove(&handle)
    }

    fn device(&self, handle: DeviceHandle) -> Result<Arc<MscDevice>> {
        lock(&self.registry)
            .devices
            .get(&handle)
            .cloned()
            .ok_or(MscError::InvalidArgument("unknown device handle"))
    }

    fn handles(&self) -> Vec<DeviceHandle> {
        let mut handles: Vec<_> = lock(&self.registry).devices.keys().copied().collect();
        handles.sort_by_key(|handle| handle.0);
        handles
    }

    fn device_count(&self) -> usize {
        lock(&self.registry).devices.len()
    }

    /// Mark the driver as ending, if nothing is still installed
    fn begin_teardown(&self) -> Result<()> {
        let mut registry = lock(&self.registry);
        if registry.ending {
            return Err(MscError::InvalidState("driver uninstall already in progress"));
        }
        if !registry.devices.is_empty() {
            return Err(MscError::InvalidState("devices are still installed"));
        }
        registry.ending = true;
        Ok(())
    }

    fn abort_teardown(&self) {
        lock(&self.registry).ending = false;
    }

    fn on_event_task(&self) -> bool {
        lock(&self.event_task)
            .as_ref()
            .is_some_and(|task| task.thread().id() == thread::current().id())
    }
}

/// USB mass storage host driver
///
/// Constructed over a host library; [`install`](Self::install) and
/// [`uninstall`](Self::uninstall) bracket its active lifetime, and may be
/// repeated.
pub struct MscHost {
    host: Arc<dyn UsbHost>,
    driver: Mutex<Option<Arc<DriverState>>>,
}

impl MscHost {
    pub fn new(host: Arc<dyn UsbHost>) -> Self {
        Self {
            host,
            driver: Mutex::new(None),
        }
    }

    fn state(&self) -> Result<Arc<DriverState>> {
        lock(&self.driver)
            .clone()
            .ok_or(MscError::InvalidState("driver is not installed"))
    }

    pub fn is_installed(&self) -> bool {
        lock(&self.driver).is_some()
    }

    /// Install the driver
    ///
    /// Registers a host library client and, if requested, starts the
    /// dispatch thread. Fails with `InvalidState` if already installed.
    pub fn install(&self, config: DriverConfig) -> Result<()> {
        config.validate()?;
        let callback = config
            .callback
            .clone()
            .ok_or(MscError::InvalidArgument("an event callback is required"))?;

        let mut slot = lock(&self.driver);
        if slot.is_some() {
            return Err(MscError::InvalidState("driver is already installed"));
        }

        let client = self.host.register_client(MAX_CLIENT_EVENTS)?;
        let state = Arc::new(DriverState::new(client, callback, &config));

        if let Some(task) = &config.event_task {
            match worker::spawn_event_task(state.clone(), task) {
                Ok(handle) => *lock(&state.event_task) = Some(handle),
                Err(e) => {
                    warn!("Failed to spawn event task: {}", e);
                    if let Err(e) = state.client.deregister() {
                        debug!("Ignoring deregister failure during rollback: {}", e);
                    }
                    return Err(MscError::NoMemory);
                }
            }
        }

        *slot = Some(state);
        info!("USB MSC driver installed");
        Ok(())
    }

    /// Uninstall the driver
    ///
    /// Every device must have been uninstalled first. Stops the dispatch
    /// thread, waiting for it to exit, and deregisters the client.
    pub fn uninstall(&self) -> Result<()> {
        let state = self.state()?;
        if state.on_event_task() {
            return Err(MscError::InvalidState(
                "cannot uninstall from the event callback",
            ));
        }
        state.begin_teardown()?;

        let task = lock(&state.event_task).take();
        if let Some(task) = task {
            if let Err(e) = state.client.unblock() {
                warn!("Failed to unblock event task: {}", e);
                *lock(&state.event_task) = Some(task);
                state.abort_teardown();
                return Err(e.into());
            }
            if task.join().is_err() {
                warn!("Event task panicked");
            }
        }

        let result = state.client.deregister();
        *lock(&self.driver) = None;
        result?;

        info!("USB MSC driver uninstalled");
        Ok(())
    }

    /// Pump host library events on the calling thread
    pub fn handle_events(&self, timeout: Duration) -> Result<()> {
        self.state()?.pump(Some(timeout))
    }

    /// Install the mass storage device at `address`
    ///
    /// On failure everything acquired so far is released, and the device
    /// is not left registered.
    pub fn install_device(&self, address: u8) -> Result<DeviceHandle> {
        let state = self.state()?;
        let device = state.register_device()?;

        if let Err(e) = device.init(&state, address) {
            warn!("Failed to install device at address {}: {}", address, e);
            state.unregister_device(device.handle);
            let _ = device.deinit(state.client.as_ref(), true);
            return Err(e);
        }
        device.mark_installed();

        info!(
            "Installed mass storage device {:?} at address {}",
            device.handle, address
        );
        Ok(device.handle)
    }

    /// Uninstall a device, returning the first release error
    ///
    /// A device whose install is still running is refused with
    /// `InvalidState`; a failing install releases it on its own.
    pub fn uninstall_device(&self, handle: DeviceHandle) -> Result<()> {
        let state = self.state()?;
        if !state.device(handle)?.is_installed() {
            return Err(MscError::InvalidState("device install has not completed"));
        }
        let device = state
            .unregister_device(handle)
            .ok_or(MscError::InvalidArgument("unknown device handle"))?;

        device.deinit(state.client.as_ref(), false)?;
        info!("Uninstalled mass storage device {:?}", handle);
        Ok(())
    }

    /// Number of registered devices
    pub fn device_count(&self) -> usize {
        self.state().map(|state| state.device_count()).unwrap_or(0)
    }

    /// Handles of every registered device
    pub fn installed_devices(&self) -> Vec<DeviceHandle> {
        self.state()
            .map(|state| state.handles())
            .unwrap_or_default()
    }

    pub fn get_device_info(&self, handle: DeviceHandle) -> Result<DeviceInfo> {
        let state = self.state()?;
        state.device(handle)?.info(state.client.as_ref())
    }

    /// Device and configuration descriptors as text (also logged at debug level)
    pub fn print_descriptors(&self, handle: DeviceHandle) -> Result<String> {
        let state = self.state()?;
        let text = state.device(handle)?.describe(state.client.as_ref())?;
        debug!("Descriptors of {:?}:\n{}", handle, text);
        Ok(text)
    }

    /// Synchronous bulk transfer of `data.len()` bytes
    pub fn bulk_transfer(
        &self,
        handle: DeviceHandle,
        data: &mut [u8],
        direction: Direction,
    ) -> Result<usize> {
        let state = self.state()?;
        state.device(handle)?.bulk_transfer(&state, data, direction)
    }

    /// Synchronous bulk transfer of `size` bytes directly through `buffer`
    ///
    /// `buffer` must be DMA capable and, for IN transfers, hold `size`
    /// rounded up to the endpoint's packet size.
    pub fn bulk_transfer_zero_copy(
        &self,
        handle: DeviceHandle,
        buffer: &mut DmaBuffer,
        size: usize,
        direction: Direction,
    ) -> Result<usize> {
        let state = self.state()?;
        state
            .device(handle)?
            .bulk_transfer_zero_copy(&state, buffer, size, direction)
    }

    /// Synchronous control transfer on the default pipe
    pub fn control_transfer(
        &self,
        handle: DeviceHandle,
        setup: SetupPacket,
        data: &mut [u8],
    ) -> Result<usize> {
        let state = self.state()?;
        state.device(handle)?.control_transfer(&state, setup, data)
    }

    /// Address and capacity of a device's own transfer buffer
    pub fn transfer_buffer_info(&self, handle: DeviceHandle) -> Result<TransferBufferInfo> {
        self.state()?.device(handle)?.buffer_info()
    }

    /// Allocate a buffer suitable for zero-copy transfers
    pub fn alloc_dma_buffer(&self, size: usize) -> Result<DmaBuffer> {
        Ok(self.state()?.client.alloc_dma_buffer(size)?)
    }

    /// Issue a Bulk-Only Mass Storage Reset
    pub fn mass_storage_reset(&self, handle: DeviceHandle) -> Result<()> {
        let state = self.state()?;
        scsi::mass_storage_reset(&state, &*state.device(handle)?)
    }

    /// Query the highest logical unit number
    pub fn get_max_lun(&self, handle: DeviceHandle) -> Result<u8> {
        let state = self.state()?;
        scsi::get_max_lun(&state, &*state.device(handle)?)
    }
}

impl fmt::Debug for MscHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MscHost")
            .field("installed", &self.is_installed())
            .field("devices", &self.device_count())
            .finish()
    }
}
