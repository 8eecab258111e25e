//! Network layer: TCP accept loop and per-connection sessions

pub mod server;
pub mod session;

pub use server::{ServerStatus, UsbIpServer};
pub use session::{Session, SessionOutput, SessionTable};
