//! Common utilities for usbipd
//!
//! This crate provides the shared plumbing between the protocol layer and
//! the server: the [`backend::UsbBackend`] abstraction with its device
//! model, cancellation tokens for in-flight transfers, the error taxonomy,
//! logging setup, and the mock backend used by tests across the workspace.

pub mod backend;
pub mod cancel;
pub mod error;
pub mod logging;
pub mod test_utils;

pub use backend::{
    BackendError, EndpointInfo, EndpointKind, HostDevice, HotplugEvent, IsoOutcome,
    IsoPacketOutcome, IsoRequest, TransferBuf, TransferError, TransferOutcome, UsbBackend,
};
pub use cancel::{CancelHandle, CancelToken, cancel_pair};
pub use error::{DeviceError, Error, Result};
pub use logging::setup_logging;
