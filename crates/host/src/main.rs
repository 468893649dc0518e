//! usb-msc host
//!
//! Watches the USB bus for mass storage devices, installs them through the
//! Bulk-Only Transport driver and reports their identity and capacity.

use anyhow::{Context, Result};
use clap::Parser;
use common::{EventStream, create_event_bridge, setup_logging};
use msc_host::config::AppConfig;
use msc_host::usb::{MscHost, RusbHost};
use msc_proto::{DeviceHandle, DeviceInfo, MscEvent};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

/// Event pump interval when no dispatch thread runs
const PUMP_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(name = "msc-host")]
#[command(author, version, about = "USB Mass Storage host - install and inspect flash drives")]
#[command(long_about = "
Detects USB mass storage devices (SCSI transparent, Bulk-Only Transport),
installs them and prints their identity and capacity.

EXAMPLES:
    # Watch all buses with default config
    msc-host

    # Print full descriptors for every installed device
    msc-host --descriptors

    # Emit device information as JSON lines
    msc-host --json --log-level warn

CONFIGURATION:
    The host looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usb-msc/host.toml
    3. /etc/usb-msc/host.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Print device information as JSON
    #[arg(long)]
    json: bool,

    /// Print device and configuration descriptors of installed devices
    #[arg(long)]
    descriptors: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = AppConfig::default();
        let path = AppConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        AppConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        AppConfig::load_or_default()
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.host.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usb-msc host v{}", env!("CARGO_PKG_VERSION"));

    let usb = RusbHost::new()
        .context("Failed to initialize libusb")?
        .with_bus(config.usb.bus);
    let host = Arc::new(MscHost::new(Arc::new(usb)));

    let (sink, events) = create_event_bridge();
    host.install(config.driver_config(sink.into_callback()))
        .context("Failed to install USB MSC driver")?;

    let pump = if config.event_task.enabled {
        None
    } else {
        Some(spawn_pump(host.clone())?)
    };

    let result = tokio::select! {
        result = run(host.clone(), events, &config, &args) => result,
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            Ok(())
        }
    };

    if let Some((stop, handle)) = pump {
        stop.store(true, Ordering::Release);
        if handle.join().is_err() {
            error!("Event pump thread panicked");
        }
    }

    shutdown(host).await;
    result
}

/// Pump host events from a plain thread when the driver runs without one
fn spawn_pump(host: Arc<MscHost>) -> Result<(Arc<AtomicBool>, thread::JoinHandle<()>)> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    let handle = thread::Builder::new()
        .name("usb-msc-pump".to_string())
        .spawn(move || {
            while !flag.load(Ordering::Acquire) {
                if let Err(e) = host.handle_events(PUMP_INTERVAL) {
                    error!("Error handling USB host events: {}", e);
                    thread::sleep(PUMP_INTERVAL);
                }
            }
        })
        .context("Failed to spawn event pump thread")?;
    Ok((stop, handle))
}

/// React to device events until the stream closes
async fn run(
    host: Arc<MscHost>,
    events: EventStream,
    config: &AppConfig,
    args: &Args,
) -> Result<()> {
    let mut installed: HashMap<DeviceHandle, u8> = HashMap::new();

    loop {
        let event = events.recv().await.context("Driver event stream closed")?;
        match event {
            MscEvent::DeviceConnected { address } => {
                info!("Mass storage device connected at address {}", address);
                if !config.usb.auto_install {
                    continue;
                }

                let worker = host.clone();
                let descriptors = args.descriptors;
                let outcome = tokio::task::spawn_blocking(move || {
                    let handle = worker.install_device(address)?;
                    let info = worker.get_device_info(handle)?;
                    let text = if descriptors {
                        Some(worker.print_descriptors(handle)?)
                    } else {
                        None
                    };
                    Ok::<_, msc_host::MscError>((handle, info, text))
                })
                .await
                .context("Device install task failed")?;

                match outcome {
                    Ok((handle, info, text)) => {
                        installed.insert(handle, address);
                        report(&info, address, args.json)?;
                        if let Some(text) = text {
                            println!("{}", text);
                        }
                    }
                    Err(e) => warn!("Failed to install device at address {}: {}", address, e),
                }
            }
            MscEvent::DeviceDisconnected { handle } => {
                let address = installed.remove(&handle);
                info!(
                    "Mass storage device {:?} disconnected (address {:?})",
                    handle, address
                );

                let worker = host.clone();
                let result = tokio::task::spawn_blocking(move || worker.uninstall_device(handle))
                    .await
                    .context("Device uninstall task failed")?;
                if let Err(e) = result {
                    warn!("Failed to uninstall device {:?}: {}", handle, e);
                }
            }
        }
    }
}

fn report(info: &DeviceInfo, address: u8, json: bool) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string(info).context("Failed to serialize device info")?
        );
        return Ok(());
    }

    let capacity = u64::from(info.sector_size) * u64::from(info.sector_count);
    println!(
        "  [{}] {:04x}:{:04x} - {} {}",
        address,
        info.vendor_id,
        info.product_id,
        if info.manufacturer.is_empty() {
            "Unknown Manufacturer"
        } else {
            info.manufacturer.as_str()
        },
        if info.product.is_empty() {
            "Unknown Product"
        } else {
            info.product.as_str()
        }
    );
    println!(
        "      {} sectors of {} bytes ({:.1} GB)",
        info.sector_count,
        info.sector_size,
        capacity as f64 / 1e9
    );
    if !info.serial_number.is_empty() {
        println!("      Serial: {}", info.serial_number);
    }
    Ok(())
}

/// Uninstall every device, then the driver
async fn shutdown(host: Arc<MscHost>) {
    info!("Shutting down USB MSC driver...");
    let result = tokio::task::spawn_blocking(move || {
        for handle in host.installed_devices() {
            if let Err(e) = host.uninstall_device(handle) {
                warn!("Failed to uninstall device {:?}: {}", handle, e);
            }
        }
        host.uninstall()
    })
    .await;

    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Error uninstalling driver: {}", e),
        Err(e) => error!("Shutdown task panicked: {}", e),
    }
}
