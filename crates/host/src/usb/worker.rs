//! Event dispatch thread
//!
//! Optional background thread that pumps host library client events for the
//! driver. It blocks in `handle_events` until events arrive, dispatches them,
//! and exits once the driver starts tearing down and unblocks it.

use crate::usb::driver::{DriverState, EventTaskConfig};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info};

/// Smallest stack the dispatch thread is given
pub const MIN_EVENT_TASK_STACK: usize = 64 * 1024;

/// Back-off after a failed event pump
const ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Spawn the dispatch thread
pub(crate) fn spawn_event_task(
    state: Arc<DriverState>,
    config: &EventTaskConfig,
) -> io::Result<JoinHandle<()>> {
    let stack_size = config.stack_size.max(MIN_EVENT_TASK_STACK);
    debug!(
        "Starting event task: stack {} bytes, priority {} (advisory), core {:?} (advisory)",
        stack_size, config.priority, config.core_id
    );

    thread::Builder::new()
        .name("usb-msc".to_string())
        .stack_size(stack_size)
        .spawn(move || run(state))
}

fn run(state: Arc<DriverState>) {
    info!("USB MSC event task started");

    while !state.is_ending() {
        if let Err(e) = state.pump(None) {
            error!("Error handling USB host events: {}", e);
            thread::sleep(ERROR_BACKOFF);
        }
    }

    info!("USB MSC event task stopped");
}
