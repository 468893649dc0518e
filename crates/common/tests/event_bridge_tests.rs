//! Event Bridge Integration Tests
//!
//! Tests for the channel that carries driver events from the callback
//! context to the application.
//!
//! # Test Scenarios
//! - Events crossing from plain threads into async code
//! - Ordering and backpressure
//! - Closing either end
//! - Logging initialization
//!
//! Run with: `cargo test -p common --test event_bridge_tests`

use common::channel::create_event_bridge_with_capacity;
use common::test_utils::{DEFAULT_TEST_TIMEOUT, with_timeout};
use common::{create_event_bridge, setup_logging};
use msc_proto::{DeviceHandle, MscEvent};
use std::thread;
use std::time::Duration;

// ============================================================================
// Delivery Tests
// ============================================================================

#[tokio::test]
async fn test_events_from_callback_thread() {
    let (sink, stream) = create_event_bridge();
    let callback = sink.into_callback();

    let producer = thread::spawn(move || {
        callback(&MscEvent::DeviceConnected { address: 4 });
        callback(&MscEvent::DeviceDisconnected {
            handle: DeviceHandle(1),
        });
    });

    let first = with_timeout(DEFAULT_TEST_TIMEOUT, stream.recv())
        .await
        .unwrap()
        .unwrap();
    let second = with_timeout(DEFAULT_TEST_TIMEOUT, stream.recv())
        .await
        .unwrap()
        .unwrap();
    producer.join().unwrap();

    assert_eq!(first, MscEvent::DeviceConnected { address: 4 });
    assert_eq!(
        second,
        MscEvent::DeviceDisconnected {
            handle: DeviceHandle(1)
        }
    );
}

#[test]
fn test_blocking_consumer() {
    let (sink, stream) = create_event_bridge();

    let consumer = thread::spawn(move || stream.recv_blocking());
    thread::sleep(Duration::from_millis(20));
    sink.send(MscEvent::DeviceConnected { address: 9 }).unwrap();

    assert_eq!(
        consumer.join().unwrap().unwrap(),
        MscEvent::DeviceConnected { address: 9 }
    );
}

#[tokio::test]
async fn test_many_producers_deliver_every_event() {
    let (sink, stream) = create_event_bridge_with_capacity(128);

    let producers: Vec<_> = (0..4u8)
        .map(|p| {
            let sink = sink.clone();
            thread::spawn(move || {
                for i in 0..16u8 {
                    sink.send(MscEvent::DeviceConnected {
                        address: p * 16 + i,
                    })
                    .unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    let mut addresses = Vec::new();
    while let Some(MscEvent::DeviceConnected { address }) = stream.try_recv() {
        addresses.push(address);
    }
    addresses.sort_unstable();
    assert_eq!(addresses, (0..64u8).collect::<Vec<_>>());
}

#[test]
fn test_order_preserved_from_one_producer() {
    let (sink, stream) = create_event_bridge();
    for address in 1..=5 {
        sink.send(MscEvent::DeviceConnected { address }).unwrap();
    }

    let received: Vec<_> = std::iter::from_fn(|| stream.try_recv()).collect();
    assert_eq!(
        received,
        (1..=5)
            .map(|address| MscEvent::DeviceConnected { address })
            .collect::<Vec<_>>()
    );
}

// ============================================================================
// Backpressure and Shutdown Tests
// ============================================================================

#[test]
fn test_full_queue_never_blocks_callback() {
    let (sink, stream) = create_event_bridge_with_capacity(2);
    let callback = sink.into_callback();

    for address in 0..10 {
        callback(&MscEvent::DeviceConnected { address });
    }

    assert_eq!(stream.len(), 2);
    assert_eq!(
        stream.try_recv(),
        Some(MscEvent::DeviceConnected { address: 0 })
    );
}

#[test]
fn test_zero_capacity_is_clamped() {
    let (sink, stream) = create_event_bridge_with_capacity(0);
    sink.send(MscEvent::DeviceConnected { address: 1 }).unwrap();
    assert_eq!(stream.len(), 1);
}

#[tokio::test]
async fn test_dropped_sink_closes_stream() {
    let (sink, stream) = create_event_bridge();
    sink.send(MscEvent::DeviceConnected { address: 2 }).unwrap();
    drop(sink);

    // Queued events are still delivered before the close is seen
    assert_eq!(
        stream.recv().await.unwrap(),
        MscEvent::DeviceConnected { address: 2 }
    );
    assert!(stream.recv().await.is_err());
}

#[test]
fn test_callback_survives_dropped_stream() {
    let (sink, stream) = create_event_bridge();
    let callback = sink.into_callback();
    drop(stream);

    callback(&MscEvent::DeviceConnected { address: 1 });
}

// ============================================================================
// Logging Tests
// ============================================================================

#[test]
fn test_setup_logging_only_once() {
    // RUST_LOG may override the level, but initialization itself succeeds once
    assert!(setup_logging("debug").is_ok());
    let err = setup_logging("info").unwrap_err();
    assert!(err.to_string().contains("already initialized"));
}
