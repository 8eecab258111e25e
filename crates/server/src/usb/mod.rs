//! Host USB backend implementations

pub mod host;

pub use host::{HostClaim, HostUsbBackend};
