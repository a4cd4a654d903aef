//! usb-echo-host
//!
//! Claims USB devices with the configured vendor/product id and echoes every
//! bulk frame they send back to them.

use anyhow::{Context, Result};
use clap::Parser;
use common::setup_logging;
use host::config::{self, HostConfig};
use host::usb::{DeviceManager, HotplugMode, LibusbBackend, ManagerEvent, UsbBackend, libusb};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "usb-echo-host")]
#[command(
    author,
    version,
    about = "USB echo host - serve bulk endpoints of hot-plugged devices"
)]
#[command(long_about = "
Watches for USB devices with a fixed vendor/product id, keeps a bulk receive
transfer in flight on each one and echoes every received frame back to the
device.

EXAMPLES:
    # Run with default config
    usb-echo-host

    # Run with custom config
    usb-echo-host --config /path/to/host.toml

    # List matching USB devices and exit
    usb-echo-host --list-devices

    # Claim a different device type with debug logging
    usb-echo-host --vid 0x1234 --pid 0x5678 --log-level debug

CONFIGURATION:
    The host looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usb-echo-host/host.toml
    3. /etc/usb-echo-host/host.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List matching USB devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Vendor ID to claim, overrides the config (e.g. 0xDEAD)
    #[arg(long, value_name = "HEX")]
    vid: Option<String>,

    /// Product ID to claim, overrides the config (e.g. 0xBEEF)
    #[arg(long, value_name = "HEX")]
    pid: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = HostConfig::default();
        let path = HostConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        config::load_config(path).context("Failed to load configuration")?
    } else {
        HostConfig::load_or_default()
    };
    if let Some(vid) = args.vid {
        config.usb.vendor_id = vid;
    }
    if let Some(pid) = args.pid {
        config.usb.product_id = pid;
    }
    config.validate().context("Invalid configuration")?;

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.host.log_level.clone());
    setup_logging(&log_level).context("Failed to setup logging")?;

    info!("usb-echo-host v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    let backend = LibusbBackend::new(libusb::libusb_log_level(&log_level))
        .context("Failed to initialize libusb")?;

    if args.list_devices {
        return list_devices(&backend, &config);
    }

    run(config, backend).await
}

/// List attached devices matching the configured identity
fn list_devices(backend: &LibusbBackend, config: &HostConfig) -> Result<()> {
    let filter = config.usb_id()?;
    let devices = backend.devices().context("Failed to enumerate USB devices")?;

    let mut found = 0;
    for device in &devices {
        let probe = match backend.probe(device) {
            Ok(probe) => probe,
            Err(e) => {
                warn!("Skipping device {}: {}", backend.device_id(device), e);
                continue;
            }
        };
        if !filter.matches(probe.vendor_id, probe.product_id) {
            continue;
        }
        found += 1;
        println!(
            "  [{}] {} Bus {:03} Device {:03}",
            backend.device_id(device),
            probe.id(),
            device.bus_number(),
            device.address()
        );
        if let Some(serial) = &probe.serial {
            println!("      Serial: {}", serial);
        }
    }

    if found == 0 {
        println!("No {} devices found.", filter);
    } else {
        println!("\nFound {} {} device(s)", found, filter);
    }
    Ok(())
}

async fn run(config: HostConfig, backend: LibusbBackend) -> Result<()> {
    let manager_config = config.manager_config()?;
    let mut manager = DeviceManager::new(Arc::new(backend), manager_config);
    let mode = manager.start().context("Failed to start device manager")?;
    info!("Watching for {} devices ({:?} hotplug)", config.usb_id()?, mode);
    if mode == HotplugMode::Shim {
        // Nothing on this platform forwards OS device notifications to the shim feed
        warn!(
            "Native hotplug unavailable: only devices attached at startup are claimed, \
             later arrivals and removals go unnoticed"
        );
    }

    let events = manager.subscribe();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ManagerEvent::DeviceAdded { native_id, serial } => {
                    info!("Device {} added (serial {:?})", native_id, serial)
                }
                ManagerEvent::DeviceRemoved { native_id, serial } => {
                    info!("Device {} removed (serial {:?})", native_id, serial)
                }
                ManagerEvent::ArrivalRejected { native_id, reason } => {
                    warn!("Device {} rejected: {}", native_id, reason)
                }
            }
        }
    });

    info!("Press Ctrl+C to shutdown");
    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
        Err(e) => error!("Error waiting for Ctrl+C: {}", e),
    }

    // Teardown joins threads and waits for cancellations
    tokio::task::spawn_blocking(move || manager.stop())
        .await
        .context("Device manager shutdown panicked")?;
    if let Err(e) = event_task.await {
        error!("Event logger task failed: {}", e);
    }

    info!("Host shutdown complete");
    Ok(())
}
