//! Common utilities for usb-msc-host
//!
//! This crate provides functionality shared between the driver library and
//! the command-line host: logging setup, the shared error type, the event
//! bridge that carries driver events out of the callback context, and
//! descriptor builders for tests.

pub mod channel;
pub mod error;
pub mod logging;
pub mod test_utils;

pub use channel::{EventSink, EventStream, create_event_bridge};
pub use error::{Error, Result};
pub use logging::setup_logging;
