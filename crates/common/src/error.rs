//! Common error types
//!
//! One enum per failure domain, composed into [`Error`] at the crate
//! boundary. Transfer failures deliberately do not appear here: they are
//! reported inside URB replies (see the engine) and never propagate as
//! `Err` across component boundaries.

use crate::backend::BackendError;
use thiserror::Error;

/// Device-level failures: reported to the peer as a nonzero reply status,
/// connection stays open
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("device not found")]
    NotFound,

    #[error("device is not bound")]
    NotBound,

    #[error("device is already exported")]
    AlreadyExported,

    #[error("device was detached")]
    Detached,

    #[error("claim refused: {0}")]
    ClaimRefused(String),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
