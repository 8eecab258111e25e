//! usbipd — USB/IP server daemon
//!
//! Exports locally attached USB devices to remote USB/IP clients
//! (an unmodified Linux `vhci_hcd` attaches over plain TCP).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::{BackendError, UsbBackend, cancel_pair, setup_logging};
use protocol::BusId;
use server::config::ServerConfig;
use server::health::HealthConfig;
use server::persist::{load_bind_file, spawn_persist_task};
use server::registry::{DeviceRegistry, DeviceState};
use server::usb::HostUsbBackend;
use server::UsbIpServer;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::signal;
use tracing::{error, info};

const EXIT_FAILURE: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_BACKEND: i32 = 3;

#[derive(Parser, Debug)]
#[command(name = "usbipd")]
#[command(author, version, about = "USB/IP server - export local USB devices over TCP")]
#[command(long_about = "
A USB/IP 1.1.1 server. Devices marked exportable with `bind` are offered
to remote USB/IP clients; a Linux client attaches with the stock tools:

    usbip list -r <this-host>
    usbip attach -r <this-host> -b <bus-id>

EXAMPLES:
    # Mark a device exportable (persists across restarts)
    usbipd bind 1-1

    # Run the server
    usbipd daemon

    # Inspect a running server
    usbipd status

CONFIGURATION:
    The server looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usbipd/usbipd.toml
    3. /etc/usbipd/usbipd.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List local USB devices with their bind state
    List,
    /// Mark a device as exportable
    Bind {
        /// Bus id of the device, e.g. 1-1
        bus_id: String,
    },
    /// Remove a device from the exportable set
    Unbind {
        /// Bus id of the device, e.g. 1-1
        bus_id: String,
    },
    /// Run the server
    Daemon,
    /// Report whether a server is running and what it exports
    Status,
}

#[tokio::main]
async fn main() {
    // clap itself exits 2 on unparsable arguments.
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => match ServerConfig::load(Some(path.clone())) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("usbipd: {e:#}");
                std::process::exit(EXIT_USAGE);
            }
        },
        None => ServerConfig::load_or_default(),
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.server.log_level);
    if let Err(e) = setup_logging(log_level) {
        eprintln!("usbipd: {e}");
        std::process::exit(EXIT_USAGE);
    }

    let result = match args.command {
        Command::List => cmd_list(&config).await,
        Command::Bind { bus_id } => cmd_bind(&config, &bus_id, true).await,
        Command::Unbind { bus_id } => cmd_bind(&config, &bus_id, false).await,
        Command::Daemon => cmd_daemon(config).await,
        Command::Status => cmd_status(&config).await,
    };

    match result {
        Ok(()) => {}
        Err(e) => {
            eprintln!("usbipd: {e:#}");
            std::process::exit(exit_code_for(&e));
        }
    }
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<common::Error>() {
        Some(common::Error::Backend(BackendError::Unavailable(_))) => EXIT_BACKEND,
        Some(common::Error::Config(_)) => EXIT_USAGE,
        Some(common::Error::Protocol(_)) => EXIT_FAILURE,
        _ => EXIT_FAILURE,
    }
}

fn parse_bus_id(raw: &str) -> Result<BusId> {
    BusId::new(raw).map_err(|_| {
        anyhow::anyhow!("invalid bus id {raw:?} (expected e.g. \"1-1\")")
            .context(common::Error::Config("invalid bus id".to_string()))
    })
}

/// Standalone registry for the one-shot verbs (list/bind/unbind); the
/// daemon builds its own inside `UsbIpServer`.
async fn open_registry(config: &ServerConfig) -> Result<(Arc<HostUsbBackend>, DeviceRegistry)> {
    let backend = Arc::new(HostUsbBackend::new().map_err(common::Error::from)?);

    let state_path = config.expanded_state_path();
    let persisted = load_bind_file(&state_path)?;
    let registry = DeviceRegistry::new(spawn_persist_task(state_path));
    let devices = backend.enumerate().await.map_err(common::Error::from)?;
    registry.reconcile(devices, persisted).await;

    Ok((backend, registry))
}

async fn cmd_list(config: &ServerConfig) -> Result<()> {
    let (_backend, registry) = open_registry(config).await?;
    let mut devices = registry.list().await;
    devices.sort_by(|(a, _), (b, _)| a.bus_id.as_str().cmp(b.bus_id.as_str()));

    if devices.is_empty() {
        println!("No USB devices found.");
        return Ok(());
    }

    for (device, state) in devices {
        let state_str = match state {
            DeviceState::Available => "available",
            DeviceState::Bound => "bound",
            DeviceState::Exported(_) => "exported",
            DeviceState::Detached => "detached",
        };
        println!(
            "{:<12} {:04x}:{:04x}  {:<9} {} {}",
            device.bus_id.as_str(),
            device.vendor_id,
            device.product_id,
            state_str,
            device.manufacturer.as_deref().unwrap_or("?"),
            device.product.as_deref().unwrap_or("?"),
        );
    }
    Ok(())
}

async fn cmd_bind(config: &ServerConfig, raw_bus_id: &str, bind: bool) -> Result<()> {
    let bus_id = parse_bus_id(raw_bus_id)?;
    let (_backend, registry) = open_registry(config).await?;

    if bind {
        match registry.bind(&bus_id).await {
            Ok(()) => {
                println!("Bound {bus_id}: device is now exportable");
                Ok(())
            }
            Err(common::Error::Persistence(e)) => {
                // In-memory state took effect but will not survive this
                // process; the verb still fails so scripts notice.
                Err(anyhow::anyhow!(
                    "bound {bus_id} for this run, but persisting failed: {e}"
                ))
            }
            Err(e) => Err(e).with_context(|| format!("cannot bind {bus_id}")),
        }
    } else {
        registry
            .unbind(&bus_id)
            .await
            .with_context(|| format!("cannot unbind {bus_id}"))?;
        println!("Unbound {bus_id}");
        Ok(())
    }
}

async fn cmd_daemon(config: ServerConfig) -> Result<()> {
    info!("usbipd v{}", env!("CARGO_PKG_VERSION"));

    let backend = Arc::new(HostUsbBackend::new().map_err(common::Error::from)?);
    let usbip = UsbIpServer::bind(config.clone(), backend)
        .await
        .map_err(anyhow::Error::from)?;

    // Health monitor plus a supervisor task consuming its escalations.
    let monitor = usbip.health_monitor(HealthConfig {
        probe_interval: Duration::from_secs(config.health.probe_interval_secs),
        urb_table_ceiling: config.health.urb_table_ceiling,
    });
    let mut alerts = monitor.subscribe();
    let (health_shutdown, health_token) = cancel_pair();
    tokio::spawn(monitor.run(health_token));
    tokio::spawn(async move {
        while let Ok(alert) = alerts.recv().await {
            error!(
                "supervisor: health escalation after {} consecutive failures: {}",
                alert.consecutive_failures, alert.reason
            );
        }
    });

    let run_handle = tokio::spawn(Arc::clone(&usbip).run());

    info!("Press Ctrl+C to shutdown");
    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
        Err(e) => error!("Error waiting for Ctrl+C: {}", e),
    }

    health_shutdown.cancel();
    usbip.shutdown();
    run_handle
        .await
        .context("server task panicked")?
        .map_err(anyhow::Error::from)?;

    info!("Server shutdown complete");
    Ok(())
}

async fn cmd_status(config: &ServerConfig) -> Result<()> {
    let mut addr = config
        .listen_addr()
        .context("invalid listen address in configuration")?;
    // A wildcard bind address is probed via loopback.
    if addr.ip().is_unspecified() {
        addr.set_ip(match addr.ip() {
            std::net::IpAddr::V4(_) => std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
            std::net::IpAddr::V6(_) => std::net::IpAddr::V6(std::net::Ipv6Addr::LOCALHOST),
        });
    }

    let mut stream = match tokio::net::TcpStream::connect(addr).await {
        Ok(stream) => stream,
        Err(e) => {
            return Err(anyhow::anyhow!("no usbipd server running on {addr}: {e}"));
        }
    };

    let mut request = Vec::new();
    protocol::OpRequest::DevList.write_to(&mut request)?;
    stream.write_all(&request).await?;

    let reply = protocol::read_op_reply(&mut stream).await?;
    match reply {
        protocol::OpReply::DevList { devices } => {
            println!("usbipd is running on {addr}");
            println!("{} exportable device(s)", devices.len());
            for dev in devices {
                println!(
                    "  {:<12} {:04x}:{:04x}",
                    dev.record.bus_id.as_str(),
                    dev.record.vendor_id,
                    dev.record.product_id
                );
            }
            Ok(())
        }
        other => Err(anyhow::anyhow!("unexpected reply from server: {other:?}")),
    }
}
