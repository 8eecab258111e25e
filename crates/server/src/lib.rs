//! usbipd server library
//!
//! Everything the `usbipd` binary does — and everything the scenario tests
//! drive — goes through this crate: configuration, the persistent bind
//! set, the device registry, the transfer engine, per-connection sessions,
//! the TCP server, health monitoring, and the libusb host backend.
//!
//! The components are wired explicitly (no globals), so several servers
//! can coexist in one process; the tests rely on that.

pub mod config;
pub mod engine;
pub mod health;
pub mod network;
pub mod persist;
pub mod registry;
pub mod usb;

pub use config::ServerConfig;
pub use engine::{CancelCause, CancelOutcome, TransferEngine, TransferTimeouts};
pub use health::{HealthAlert, HealthConfig, HealthMonitor};
pub use network::{ServerStatus, SessionTable, UsbIpServer};
pub use persist::BindRecord;
pub use registry::{DeviceRegistry, DeviceState, SessionId};
pub use usb::HostUsbBackend;
