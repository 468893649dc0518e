//! Event bridge between the driver callback and the application
//!
//! The driver invokes its user callback from whichever context pumps host
//! events (usually the background dispatch thread). That context must never
//! block on the application, so the sink side only ever `try_send`s; the
//! stream side can be consumed from async code or from a plain thread.

use async_channel::{Receiver, Sender, TrySendError, bounded};
use msc_proto::MscEvent;
use tracing::warn;

/// Default capacity of the event queue
pub const EVENT_QUEUE_CAPACITY: usize = 64;

/// Producer half, handed to the driver callback
#[derive(Clone)]
pub struct EventSink {
    tx: Sender<MscEvent>,
}

impl EventSink {
    /// Queue an event without blocking
    ///
    /// A full queue drops the event with a warning; a closed queue is an error.
    pub fn send(&self, event: MscEvent) -> crate::Result<()> {
        match self.tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(event)) => {
                warn!("Event queue full, dropping {:?}", event);
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(crate::Error::Channel(
                "event stream dropped".to_string(),
            )),
        }
    }

    /// Turn the sink into a callback suitable for the driver configuration
    pub fn into_callback(self) -> impl Fn(&MscEvent) + Send + Sync + 'static {
        move |event: &MscEvent| {
            if let Err(e) = self.send(*event) {
                warn!("Failed to forward {:?}: {}", event, e);
            }
        }
    }
}

/// Consumer half, owned by the application
pub struct EventStream {
    rx: Receiver<MscEvent>,
}

impl EventStream {
    /// Receive the next event (async)
    pub async fn recv(&self) -> crate::Result<MscEvent> {
        self.rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive the next event (blocking)
    pub fn recv_blocking(&self) -> crate::Result<MscEvent> {
        self.rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&self) -> Option<MscEvent> {
        self.rx.try_recv().ok()
    }

    /// Number of queued events
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Create the event bridge
///
/// Returns (EventSink for the driver callback, EventStream for the application)
pub fn create_event_bridge() -> (EventSink, EventStream) {
    create_event_bridge_with_capacity(EVENT_QUEUE_CAPACITY)
}

/// Create the event bridge with an explicit queue capacity
pub fn create_event_bridge_with_capacity(capacity: usize) -> (EventSink, EventStream) {
    let (tx, rx) = bounded(capacity.max(1));
    (EventSink { tx }, EventStream { rx })
}
