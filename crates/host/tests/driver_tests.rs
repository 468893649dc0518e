//! Driver lifecycle integration tests
//!
//! Exercises `MscHost` against the in-memory host library:
//! - Driver install / uninstall state machine
//! - Device install with rollback on every failing step
//! - Event classification by the dispatch thread
//! - Device information queries
//!
//! Run with: `cargo test -p msc-host --test driver_tests`

use common::test_utils::{ConfigDescriptorBuilder, create_mock_device_descriptor};
use msc_host::test_utils::{HostOp, MockDevice, MockHost};
use msc_host::usb::{DriverConfig, EventTaskConfig, MscHost, Timeouts};
use msc_host::{HostError, MscError};
use msc_proto::bot::CswStatus;
use msc_proto::scsi::{INQUIRY, REQUEST_SENSE, SenseKey, TEST_UNIT_READY};
use msc_proto::{DeviceDescriptor, DeviceHandle, MscEvent};
use proptest::prelude::*;
use std::sync::mpsc;
use std::sync::{Arc, OnceLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

const EVENT_WAIT: Duration = Duration::from_secs(2);

fn fast_timeouts() -> Timeouts {
    Timeouts {
        transfer: Duration::from_millis(500),
        ready_budget: Duration::from_millis(300),
        ready_poll: Duration::from_millis(10),
    }
}

/// Driver without a dispatch thread, installed over a fresh mock bus
fn installed_host() -> (MockHost, MscHost) {
    let mock = MockHost::new();
    let host = MscHost::new(Arc::new(mock.clone()));
    host.install(
        DriverConfig::new(|_| {})
            .with_event_task(None)
            .with_timeouts(fast_timeouts()),
    )
    .unwrap();
    (mock, host)
}

fn assert_rolled_back(mock: &MockHost, host: &MscHost) {
    assert_eq!(host.device_count(), 0);
    assert_eq!(mock.open_handles(), 0);
    assert_eq!(mock.claimed_interfaces(), 0);
    assert_eq!(mock.outstanding_transfers(), 0);
}

// ============================================================================
// Driver Install / Uninstall Tests
// ============================================================================

#[test]
fn test_install_requires_callback() {
    let mock = MockHost::new();
    let host = MscHost::new(Arc::new(mock.clone()));

    let result = host.install(DriverConfig::default());
    assert!(matches!(result, Err(MscError::InvalidArgument(_))));
    assert!(!host.is_installed());
    assert!(!mock.is_registered());
}

#[test]
fn test_install_rejects_zero_task_parameters() {
    let host = MscHost::new(Arc::new(MockHost::new()));

    let zero_stack = DriverConfig::new(|_| {}).with_event_task(Some(EventTaskConfig {
        stack_size: 0,
        ..EventTaskConfig::default()
    }));
    assert!(matches!(
        host.install(zero_stack),
        Err(MscError::InvalidArgument(_))
    ));

    let zero_priority = DriverConfig::new(|_| {}).with_event_task(Some(EventTaskConfig {
        priority: 0,
        ..EventTaskConfig::default()
    }));
    assert!(matches!(
        host.install(zero_priority),
        Err(MscError::InvalidArgument(_))
    ));
    assert!(!host.is_installed());
}

#[test]
fn test_double_install_is_invalid_state() {
    let (_mock, host) = installed_host();

    let result = host.install(DriverConfig::new(|_| {}).with_event_task(None));
    assert!(matches!(result, Err(MscError::InvalidState(_))));
    assert!(host.is_installed());

    host.uninstall().unwrap();
}

#[test]
fn test_uninstall_without_install_is_invalid_state() {
    let host = MscHost::new(Arc::new(MockHost::new()));
    assert!(matches!(host.uninstall(), Err(MscError::InvalidState(_))));
}

#[test]
fn test_uninstall_refused_while_devices_installed() {
    let (mock, host) = installed_host();
    let address = mock.add_device(MockDevice::flash_drive());
    let handle = host.install_device(address).unwrap();

    assert!(matches!(host.uninstall(), Err(MscError::InvalidState(_))));
    assert!(host.is_installed());

    // The driver stays usable after the refusal
    assert!(host.get_device_info(handle).is_ok());

    host.uninstall_device(handle).unwrap();
    host.uninstall().unwrap();
    assert!(!host.is_installed());
    assert!(!mock.is_registered());
}

#[test]
fn test_reinstall_after_uninstall() {
    let (mock, host) = installed_host();
    host.uninstall().unwrap();

    host.install(DriverConfig::new(|_| {}).with_event_task(None))
        .unwrap();
    assert!(host.is_installed());
    assert!(mock.is_registered());
    host.uninstall().unwrap();
}

#[test]
fn test_install_with_event_task_and_uninstall() {
    let mock = MockHost::new();
    let host = MscHost::new(Arc::new(mock.clone()));

    for _ in 0..3 {
        host.install(DriverConfig::new(|_| {})).unwrap();
        host.uninstall().unwrap();
    }
    assert_eq!(
        mock.ops()
            .iter()
            .filter(|op| **op == HostOp::Deregister)
            .count(),
        3
    );
}

#[test]
fn test_client_registration_failure_leaves_driver_uninstalled() {
    let mock = MockHost::new();
    let host = MscHost::new(Arc::new(mock.clone()));
    mock.fail_next_register();

    assert_eq!(
        host.install(DriverConfig::new(|_| {})),
        Err(MscError::NoMemory)
    );
    assert!(!host.is_installed());

    host.install(DriverConfig::new(|_| {})).unwrap();
    host.uninstall().unwrap();
}

#[test]
fn test_operations_require_installed_driver() {
    let mock = MockHost::new();
    let address = mock.add_device(MockDevice::flash_drive());
    let host = MscHost::new(Arc::new(mock));

    assert!(matches!(
        host.install_device(address),
        Err(MscError::InvalidState(_))
    ));
    assert!(matches!(
        host.handle_events(Duration::from_millis(1)),
        Err(MscError::InvalidState(_))
    ));
    assert_eq!(host.device_count(), 0);
}

#[test]
fn test_uninstall_from_event_callback_is_refused() {
    let mock = MockHost::new();
    let host = Arc::new(MscHost::new(Arc::new(mock.clone())));
    let weak: Arc<OnceLock<Weak<MscHost>>> = Arc::new(OnceLock::new());
    let (tx, rx) = mpsc::channel();

    let slot = weak.clone();
    host.install(DriverConfig::new(move |_| {
        if let Some(host) = slot.get().and_then(Weak::upgrade) {
            let _ = tx.send(host.uninstall());
        }
    }))
    .unwrap();
    weak.set(Arc::downgrade(&host)).unwrap();

    mock.connect(MockDevice::flash_drive());
    let result = rx.recv_timeout(EVENT_WAIT).unwrap();
    assert!(matches!(result, Err(MscError::InvalidState(_))));
    assert!(host.is_installed());

    host.uninstall().unwrap();
}

// ============================================================================
// Device Install Tests
// ============================================================================

#[test]
fn test_install_reports_capacity() {
    let (mock, host) = installed_host();
    let address = mock.add_device(MockDevice::flash_drive());

    let handle = host.install_device(address).unwrap();
    assert_eq!(host.device_count(), 1);
    assert_eq!(mock.claimed_interfaces(), 1);

    let info = host.get_device_info(handle).unwrap();
    assert_eq!(info.vendor_id, 0x0781);
    assert_eq!(info.product_id, 0x5567);
    assert_eq!(info.sector_size, 512);
    assert_eq!(info.sector_count, 7_864_320);
    assert_eq!(info.manufacturer, "SanDisk");
    assert_eq!(info.product, "Cruzer Blade");
    assert_eq!(info.serial_number, "4C530001");

    host.uninstall_device(handle).unwrap();
    assert_rolled_back(&mock, &host);
    host.uninstall().unwrap();
}

#[test]
fn test_transfer_buffer_rounded_to_packet_size() {
    let (mock, host) = installed_host();
    let device = MockDevice::flash_drive().with_config_descriptor(
        ConfigDescriptorBuilder::new()
            .msc_interface(0)
            .bulk_endpoint(0x81, 512)
            .bulk_endpoint(0x02, 512)
            .build(),
    );
    let handle = host.install_device(mock.add_device(device)).unwrap();

    assert!(mock.ops().contains(&HostOp::AllocTransfer { size: 512 }));
    assert_eq!(host.transfer_buffer_info(handle).unwrap().capacity, 512);

    host.uninstall_device(handle).unwrap();
    host.uninstall().unwrap();
}

#[test]
fn test_not_ready_then_ready() {
    let (mock, host) = installed_host();
    let device = MockDevice::flash_drive()
        .with_not_ready_polls(5)
        .with_sense_key(SenseKey::NotReady);

    let handle = host.install_device(mock.add_device(device)).unwrap();
    assert_eq!(host.get_device_info(handle).unwrap().sector_size, 512);

    host.uninstall_device(handle).unwrap();
    host.uninstall().unwrap();
}

#[test]
fn test_unit_attention_is_transient() {
    let (mock, host) = installed_host();
    let device = MockDevice::flash_drive()
        .with_not_ready_polls(2)
        .with_sense_key(SenseKey::UnitAttention);

    let handle = host.install_device(mock.add_device(device)).unwrap();
    host.uninstall_device(handle).unwrap();
    host.uninstall().unwrap();
}

#[test]
fn test_no_sense_is_transient() {
    let (mock, host) = installed_host();
    let device = MockDevice::flash_drive()
        .with_not_ready_polls(2)
        .with_sense_key(SenseKey::NoSense);

    let handle = host.install_device(mock.add_device(device)).unwrap();
    assert_eq!(host.get_device_info(handle).unwrap().sector_size, 512);

    host.uninstall_device(handle).unwrap();
    host.uninstall().unwrap();
}

#[test]
fn test_unexpected_sense_key_rolls_back() {
    let (mock, host) = installed_host();
    let device = MockDevice::flash_drive()
        .with_not_ready_polls(1)
        .with_sense_key(SenseKey::MediumError);

    let err = host.install_device(mock.add_device(device)).unwrap_err();
    assert!(matches!(err, MscError::Internal(_)));
    assert!(err.is_internal());
    assert_rolled_back(&mock, &host);

    host.uninstall().unwrap();
}

#[test]
fn test_readiness_budget_exhausted() {
    let (mock, host) = installed_host();
    let device = MockDevice::flash_drive().with_not_ready_polls(u32::MAX);

    let err = host.install_device(mock.add_device(device)).unwrap_err();
    assert_eq!(
        err,
        MscError::CommandFailed {
            opcode: TEST_UNIT_READY,
            status: CswStatus::Failed,
        }
    );
    assert_rolled_back(&mock, &host);

    host.uninstall().unwrap();
}

#[test]
fn test_short_inquiry_reply_rolls_back() {
    let (mock, host) = installed_host();
    let device = MockDevice::flash_drive().with_short_reply(INQUIRY, 8);

    let err = host.install_device(mock.add_device(device)).unwrap_err();
    assert!(matches!(&err, MscError::Internal(msg) if msg.contains("short response")));
    assert_rolled_back(&mock, &host);

    host.uninstall().unwrap();
}

#[test]
fn test_empty_sense_reply_rolls_back() {
    let (mock, host) = installed_host();
    let device = MockDevice::flash_drive()
        .with_not_ready_polls(1)
        .with_short_reply(REQUEST_SENSE, 0);

    // Nothing of the sense data arrived, so no sense key may be read from it
    let err = host.install_device(mock.add_device(device)).unwrap_err();
    assert!(matches!(&err, MscError::Internal(msg) if msg.contains("short response")));
    assert_rolled_back(&mock, &host);

    host.uninstall().unwrap();
}

#[test]
fn test_transfer_alloc_failure_rolls_back() {
    let (mock, host) = installed_host();
    let address = mock.add_device(MockDevice::flash_drive());
    mock.fail_next_transfer_alloc();

    assert_eq!(host.install_device(address), Err(MscError::NoMemory));
    assert_rolled_back(&mock, &host);

    // The same device installs once the fault is gone
    let handle = host.install_device(address).unwrap();
    host.uninstall_device(handle).unwrap();
    host.uninstall().unwrap();
}

#[test]
fn test_claim_failure_rolls_back() {
    let (mock, host) = installed_host();
    let address = mock.add_device(MockDevice::flash_drive());
    mock.fail_next_claim();

    let err = host.install_device(address).unwrap_err();
    assert!(matches!(err, MscError::Host(HostError::Io(_))));
    assert_rolled_back(&mock, &host);
    assert!(!mock.ops().iter().any(|op| matches!(op, HostOp::Release { .. })));

    host.uninstall().unwrap();
}

#[test]
fn test_stalled_inquiry_clears_endpoint_and_rolls_back() {
    let (mock, host) = installed_host();
    let address = mock.add_device(MockDevice::flash_drive());
    mock.stall_next_bulk_in();

    let err = host.install_device(address).unwrap_err();
    assert_eq!(
        err,
        MscError::CommandFailed {
            opcode: INQUIRY,
            status: CswStatus::Failed,
        }
    );
    assert!(mock.ops().contains(&HostOp::Clear { endpoint: 0x81 }));
    assert_rolled_back(&mock, &host);

    host.uninstall().unwrap();
}

#[test]
fn test_non_msc_device_not_supported() {
    let (mock, host) = installed_host();
    let address = mock.add_device(MockDevice::keyboard());

    assert!(matches!(
        host.install_device(address),
        Err(MscError::NotSupported(_))
    ));
    assert_rolled_back(&mock, &host);
    host.uninstall().unwrap();
}

#[test]
fn test_missing_bulk_endpoint_not_supported() {
    let (mock, host) = installed_host();
    let device = MockDevice::flash_drive().with_config_descriptor(
        ConfigDescriptorBuilder::new()
            .msc_interface(0)
            .bulk_endpoint(0x81, 64)
            .build(),
    );

    assert!(matches!(
        host.install_device(mock.add_device(device)),
        Err(MscError::NotSupported(_))
    ));
    assert_rolled_back(&mock, &host);
    host.uninstall().unwrap();
}

#[test]
fn test_unknown_address_fails() {
    let (mock, host) = installed_host();
    assert!(host.install_device(42).is_err());
    assert_rolled_back(&mock, &host);
    host.uninstall().unwrap();
}

#[test]
fn test_unknown_handle_is_invalid_argument() {
    let (_mock, host) = installed_host();
    let bogus = DeviceHandle(999);

    assert!(matches!(
        host.get_device_info(bogus),
        Err(MscError::InvalidArgument(_))
    ));
    assert!(matches!(
        host.uninstall_device(bogus),
        Err(MscError::InvalidArgument(_))
    ));
    assert!(matches!(
        host.print_descriptors(bogus),
        Err(MscError::InvalidArgument(_))
    ));
    host.uninstall().unwrap();
}

#[test]
fn test_handle_invalid_after_uninstall_device() {
    let (mock, host) = installed_host();
    let handle = host
        .install_device(mock.add_device(MockDevice::flash_drive()))
        .unwrap();
    host.uninstall_device(handle).unwrap();

    assert!(matches!(
        host.get_device_info(handle),
        Err(MscError::InvalidArgument(_))
    ));
    assert!(matches!(
        host.uninstall_device(handle),
        Err(MscError::InvalidArgument(_))
    ));
    host.uninstall().unwrap();
}

#[test]
fn test_uninstall_refused_while_device_installing() {
    let mock = MockHost::new();
    let host = MscHost::new(Arc::new(mock.clone()));
    host.install(
        DriverConfig::new(|_| {})
            .with_event_task(None)
            .with_timeouts(Timeouts {
                transfer: Duration::from_millis(500),
                ready_budget: Duration::from_millis(2000),
                ready_poll: Duration::from_millis(200),
            }),
    )
    .unwrap();
    let address = mock.add_device(MockDevice::flash_drive().with_not_ready_polls(3));

    let handle = thread::scope(|s| {
        let installer = s.spawn(|| host.install_device(address));

        // The device is registered before its first command
        let deadline = Instant::now() + EVENT_WAIT;
        let handle = loop {
            if let Some(&handle) = host.installed_devices().first() {
                break handle;
            }
            assert!(Instant::now() < deadline, "device never registered");
            thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(
            host.uninstall_device(handle),
            Err(MscError::InvalidState("device install has not completed"))
        );

        let installed = installer.join().unwrap().unwrap();
        assert_eq!(installed, handle);
        handle
    });

    assert!(host.get_device_info(handle).is_ok());
    host.uninstall_device(handle).unwrap();

    let closes = mock
        .ops()
        .iter()
        .filter(|op| matches!(op, HostOp::Close { .. }))
        .count();
    assert_eq!(closes, 1);
    assert_eq!(mock.open_handles(), 0);
    host.uninstall().unwrap();
}

#[test]
fn test_uninstall_device_reports_first_release_error() {
    let (mock, host) = installed_host();
    let handle = host
        .install_device(mock.add_device(MockDevice::flash_drive()))
        .unwrap();
    mock.fail_next_release();

    let err = host.uninstall_device(handle).unwrap_err();
    assert!(matches!(err, MscError::Host(HostError::Io(_))));

    // Later steps still ran
    assert_eq!(host.device_count(), 0);
    assert_eq!(mock.open_handles(), 0);
    assert_eq!(mock.outstanding_transfers(), 0);
    host.uninstall().unwrap();
}

#[test]
fn test_multiple_devices_get_distinct_handles() {
    let (mock, host) = installed_host();
    let first = host
        .install_device(mock.add_device(MockDevice::flash_drive()))
        .unwrap();
    let second = host
        .install_device(
            mock.add_device(MockDevice::flash_drive().with_capacity(4096, 1_000)),
        )
        .unwrap();

    assert_ne!(first, second);
    assert_eq!(host.device_count(), 2);
    assert_eq!(host.installed_devices(), vec![first, second]);
    assert_eq!(host.get_device_info(second).unwrap().sector_size, 4096);
    assert_eq!(host.get_device_info(second).unwrap().sector_count, 1_000);

    host.uninstall_device(first).unwrap();
    host.uninstall_device(second).unwrap();
    host.uninstall().unwrap();
}

// ============================================================================
// Device Information Tests
// ============================================================================

#[test]
fn test_device_info_is_idempotent() {
    let (mock, host) = installed_host();
    let handle = host
        .install_device(mock.add_device(MockDevice::flash_drive()))
        .unwrap();

    let first = host.get_device_info(handle).unwrap();
    let second = host.get_device_info(handle).unwrap();
    assert_eq!(first, second);

    host.uninstall_device(handle).unwrap();
    host.uninstall().unwrap();
}

#[test]
fn test_device_info_truncates_long_strings() {
    let (mock, host) = installed_host();
    let device = MockDevice::flash_drive().with_string(2, "An Extremely Long Product Name");
    let handle = host.install_device(mock.add_device(device)).unwrap();

    assert_eq!(host.get_device_info(handle).unwrap().product, "An Extremely Lo");

    host.uninstall_device(handle).unwrap();
    host.uninstall().unwrap();
}

#[test]
fn test_device_info_without_strings() {
    let (mock, host) = installed_host();
    let device = MockDevice::flash_drive().with_device_descriptor(DeviceDescriptor {
        manufacturer_index: 0,
        product_index: 0,
        serial_number_index: 0,
        ..create_mock_device_descriptor(0x090c, 0x1000)
    });
    let handle = host.install_device(mock.add_device(device)).unwrap();

    let info = host.get_device_info(handle).unwrap();
    assert_eq!(info.vendor_id, 0x090c);
    assert!(info.manufacturer.is_empty());
    assert!(info.product.is_empty());
    assert!(info.serial_number.is_empty());

    host.uninstall_device(handle).unwrap();
    host.uninstall().unwrap();
}

#[test]
fn test_print_descriptors() {
    let (mock, host) = installed_host();
    let handle = host
        .install_device(mock.add_device(MockDevice::flash_drive()))
        .unwrap();

    let text = host.print_descriptors(handle).unwrap();
    assert!(text.contains("idVendor 0x0781"));
    assert!(text.contains("Interface 0"));
    assert!(text.contains("Endpoint 0x81"));
    assert!(text.contains("Endpoint 0x02"));

    host.uninstall_device(handle).unwrap();
    host.uninstall().unwrap();
}

// ============================================================================
// Event Dispatch Tests
// ============================================================================

#[test]
fn test_events_only_for_mass_storage() {
    let mock = MockHost::new();
    let host = MscHost::new(Arc::new(mock.clone()));
    let (tx, rx) = mpsc::channel();
    host.install(DriverConfig::new(move |event: &MscEvent| {
        let _ = tx.send(*event);
    }))
    .unwrap();

    let keyboard = mock.connect(MockDevice::keyboard());
    let drive = mock.connect(MockDevice::flash_drive());

    // The keyboard was classified first and produced nothing
    assert_eq!(
        rx.recv_timeout(EVENT_WAIT).unwrap(),
        MscEvent::DeviceConnected { address: drive }
    );

    let handle = host.install_device(drive).unwrap();

    mock.disconnect(keyboard);
    mock.disconnect(drive);
    assert_eq!(
        rx.recv_timeout(EVENT_WAIT).unwrap(),
        MscEvent::DeviceDisconnected { handle }
    );
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

    host.uninstall_device(handle).unwrap();
    host.uninstall().unwrap();
    assert_eq!(mock.open_handles(), 0);
}

#[test]
fn test_disconnect_of_uninstalled_msc_device_is_silent() {
    let mock = MockHost::new();
    let host = MscHost::new(Arc::new(mock.clone()));
    let (tx, rx) = mpsc::channel();
    host.install(DriverConfig::new(move |event: &MscEvent| {
        let _ = tx.send(*event);
    }))
    .unwrap();

    let drive = mock.connect(MockDevice::flash_drive());
    assert_eq!(
        rx.recv_timeout(EVENT_WAIT).unwrap(),
        MscEvent::DeviceConnected { address: drive }
    );

    mock.disconnect(drive);
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

    host.uninstall().unwrap();
}

#[test]
fn test_manual_event_pump() {
    let (tx, rx) = mpsc::channel();
    let mock = MockHost::new();
    let host = MscHost::new(Arc::new(mock.clone()));
    host.install(
        DriverConfig::new(move |event: &MscEvent| {
            let _ = tx.send(*event);
        })
        .with_event_task(None),
    )
    .unwrap();

    let drive = mock.connect(MockDevice::flash_drive());
    assert!(rx.try_recv().is_err());

    host.handle_events(Duration::from_millis(100)).unwrap();
    assert_eq!(
        rx.try_recv().unwrap(),
        MscEvent::DeviceConnected { address: drive }
    );

    // Nothing pending: the pump returns after its timeout
    host.handle_events(Duration::from_millis(10)).unwrap();
    assert!(rx.try_recv().is_err());

    host.uninstall().unwrap();
}

// ============================================================================
// Property Tests
// ============================================================================

fn non_bot_interface() -> impl Strategy<Value = (u8, u8, u8)> {
    (any::<u8>(), any::<u8>(), any::<u8>())
        .prop_filter("not SCSI bulk-only", |triple| *triple != (0x08, 0x06, 0x50))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_non_bot_device_never_installs(
        interfaces in prop::collection::vec(non_bot_interface(), 0..4),
        mps in 8u16..1024,
    ) {
        let mut builder = ConfigDescriptorBuilder::new();
        for (i, (class, subclass, protocol)) in interfaces.into_iter().enumerate() {
            builder = builder
                .interface(i as u8, class, subclass, protocol)
                .bulk_endpoint(0x81, mps)
                .bulk_endpoint(0x02, mps);
        }
        let (mock, host) = installed_host();
        let address = mock.add_device(MockDevice::flash_drive().with_config_descriptor(builder.build()));

        prop_assert!(matches!(host.install_device(address), Err(MscError::NotSupported(_))));
        prop_assert_eq!(host.device_count(), 0);
        prop_assert_eq!(mock.open_handles(), 0);
        prop_assert_eq!(mock.outstanding_transfers(), 0);
        host.uninstall().unwrap();
    }

    #[test]
    fn prop_bot_interface_with_one_endpoint_not_supported(
        endpoint in prop_oneof![Just(0x81u8), Just(0x02u8)],
        mps in 8u16..1024,
    ) {
        let config = ConfigDescriptorBuilder::new()
            .msc_interface(0)
            .bulk_endpoint(endpoint, mps)
            .build();
        let (mock, host) = installed_host();
        let address = mock.add_device(MockDevice::flash_drive().with_config_descriptor(config));

        prop_assert!(matches!(host.install_device(address), Err(MscError::NotSupported(_))));
        prop_assert_eq!(host.device_count(), 0);
        prop_assert_eq!(mock.open_handles(), 0);
        host.uninstall().unwrap();
    }

    #[test]
    fn prop_arbitrary_descriptor_never_leaks(bytes in prop::collection::vec(any::<u8>(), 0..96)) {
        let (mock, host) = installed_host();
        let address = mock.add_device(MockDevice::flash_drive().with_config_descriptor(bytes));

        match host.install_device(address) {
            Ok(handle) => host.uninstall_device(handle).unwrap(),
            Err(_) => prop_assert_eq!(host.device_count(), 0),
        }
        prop_assert_eq!(mock.open_handles(), 0);
        prop_assert_eq!(mock.claimed_interfaces(), 0);
        prop_assert_eq!(mock.outstanding_transfers(), 0);
        host.uninstall().unwrap();
    }
}
