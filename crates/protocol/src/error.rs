//! Protocol error types

use thiserror::Error;

/// Errors surfaced while decoding or validating USB/IP wire data
///
/// Any of these on an established session is fatal to that session
/// (the protocol has no way to resynchronize a byte stream), but never
/// to the server.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Peer spoke a USB/IP version other than 0x0111
    #[error("unsupported USB/IP version {found:#06x} (expected {expected:#06x})")]
    VersionMismatch { found: u16, expected: u16 },

    /// Unknown code in an op-channel header
    #[error("unknown operation code {0:#06x}")]
    UnknownOpCode(u16),

    /// Unknown command in a URB-channel header
    #[error("unknown URB command {0:#010x}")]
    UnknownUrbCommand(u32),

    /// Header fields describe an impossible frame
    #[error("malformed frame: {reason}")]
    MalformedFrame { reason: String },

    /// Declared payload exceeds the hard wire bound
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Bus id field contained non-ASCII data
    #[error("bus id is not NUL-padded ASCII")]
    BusIdNotAscii,

    /// I/O error while reading or writing a frame. A frame cut short
    /// surfaces here as `UnexpectedEof`.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedFrame {
            reason: reason.into(),
        }
    }
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
