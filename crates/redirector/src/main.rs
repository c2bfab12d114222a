//! usb-redirector
//!
//! Attaches a redirector to one USB device on this host and serves it until
//! interrupted or until the device goes away.

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use common::{PnpDevice, PnpInformation, PnpIrp, UsbBridge, UsbBus, UsbCommand, UsbEvent};
use common::{create_usb_bridge, setup_logging};
use protocol::BusQueryIdType;
use protocol::wide::{from_wide_multi_sz, from_wide_sz};
use redirector::usb::{DeviceManager, RusbBus, RusbPnpDevice, read_layout, spawn_usb_worker};
use redirector::{ControlPlane, FilterDevice, RedirectRegistry, RedirectorConfig};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "usb-redirector")]
#[command(author, version, about = "USB redirector - hand a USB device to a user-mode consumer")]
#[command(long_about = "
Attaches a redirector filter to a USB device. The device is presented
under a generic redirector identity and its pipes are served to a
user-mode consumer through read/write and pipe-control requests.

EXAMPLES:
    # List candidate devices
    usb-redirector --list-devices

    # Redirect a device by vendor and product ID
    usb-redirector --device 0x046d:0xc52b

    # Use a second redirector instance with debug logging
    usb-redirector --device 0x046d:* --instance 1 --log-level debug

CONFIGURATION:
    The redirector looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usb-redirector/redirector.toml
    3. /etc/usb-redirector/redirector.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List USB devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Device to redirect (VID:PID, e.g. 0x046d:0xc52b)
    #[arg(short, long, value_name = "VID:PID")]
    device: Option<String>,

    /// Redirector instance number
    #[arg(short, long, value_name = "N")]
    instance: Option<u32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = RedirectorConfig::default();
        let path = RedirectorConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => {
            redirector::config::load_config(path).context("Failed to load configuration")?
        }
        None => RedirectorConfig::load_or_default(),
    };
    if let Some(device) = args.device {
        RedirectorConfig::validate_filter(&device)?;
        config.usb.device = Some(device);
    }
    if let Some(instance) = args.instance {
        config.redirector.instance_number = instance;
    }

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.redirector.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usb-redirector v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    let manager = DeviceManager::new().context("Failed to initialise USB context")?;

    if args.list_devices {
        let devices = manager.list_devices().context("Failed to enumerate devices")?;
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }

    let filter = config.usb.device.clone().ok_or_else(|| {
        anyhow!("No device to redirect: pass --device VID:PID or set [usb] device")
    })?;
    let mut device = manager
        .find(&filter)
        .with_context(|| format!("No device matches {}", filter))?;

    let summary = device.summary();
    device.open().context("Failed to open device")?;
    let layout = read_layout(&device).context("Failed to read configuration descriptor")?;
    let lower: Arc<dyn PnpDevice> = Arc::new(RusbPnpDevice::new(&summary));

    let (bridge, worker) = create_usb_bridge(config.usb.worker_command_depth);
    let bus: Arc<dyn UsbBus> = Arc::new(RusbBus::new(bridge.clone(), &device, layout));
    let worker_handle = spawn_usb_worker(device, worker, config.usb.transfer_timeout())
        .context("Failed to spawn USB worker thread")?;

    let result = run(&config, lower, bus, &bridge).await;

    info!("Shutting down USB subsystem...");
    if let Err(e) = bridge.send_command(UsbCommand::Shutdown).await {
        error!("Error shutting down USB worker: {}", e);
    }
    if let Err(e) = worker_handle.join() {
        error!("USB worker thread panicked: {:?}", e);
    }

    result
}

async fn run(
    config: &RedirectorConfig,
    lower: Arc<dyn PnpDevice>,
    bus: Arc<dyn UsbBus>,
    bridge: &UsbBridge,
) -> Result<()> {
    let registry = Arc::new(RedirectRegistry::new());
    let control_plane: Arc<dyn ControlPlane> = registry.clone();

    let filter = FilterDevice::attach(&config.redirector, lower, bus, control_plane)
        .await
        .context("Failed to attach redirector")?;

    log_presented_identity(&filter);
    info!("Redirector state: {:?}", filter.state());
    info!(
        "Active redirects: {}",
        serde_json::to_string(&registry.snapshot())?
    );

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
        event = bridge.recv_event() => match event {
            Ok(UsbEvent::DeviceGone) => warn!("Device went away, shutting down"),
            Err(e) => error!("USB worker event channel closed: {}", e),
        },
    }

    filter.close().await;
    Ok(())
}

/// Log the identity the device now answers bus queries with
fn log_presented_identity(filter: &FilterDevice) {
    for id_type in [
        BusQueryIdType::DeviceId,
        BusQueryIdType::InstanceId,
        BusQueryIdType::HardwareIds,
        BusQueryIdType::CompatibleIds,
    ] {
        let mut irp = PnpIrp::query_id(id_type);
        filter.pnp(&mut irp);

        let decoded = match (&irp.status, &irp.information) {
            (Ok(()), PnpInformation::Id(raw)) if id_type.is_multi_sz() => {
                from_wide_multi_sz(raw).map(|ids| ids.join(", "))
            }
            (Ok(()), PnpInformation::Id(raw)) => from_wide_sz(raw),
            (status, _) => {
                warn!("{:?} query failed: {:?}", id_type, status);
                continue;
            }
        };
        match decoded {
            Ok(id) => info!("{:?}: {}", id_type, id),
            Err(e) => warn!("{:?} answer malformed: {}", id_type, e),
        }
    }
}
