//! Host USB backend abstraction
//!
//! The server core never touches host USB machinery directly; everything
//! goes through [`UsbBackend`]. Production uses the libusb-backed
//! implementation in the server crate, tests use
//! [`crate::test_utils::MockBackend`]. Implementations must tolerate
//! concurrent transfer calls against the same claim; the engine enforces
//! nothing beyond a per-device in-flight cap.

use crate::cancel::CancelToken;
use protocol::{BusId, DeviceRecord, UsbInterface, UsbSpeed};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// USB transfer kind of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Control,
    Bulk,
    Interrupt,
    Isochronous,
}

/// One endpoint from the device's configuration descriptors
///
/// `address` carries the direction bit (0x80 = IN) exactly as the
/// descriptor does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointInfo {
    pub address: u8,
    pub kind: EndpointKind,
    pub interval: u8,
}

/// A USB device visible on the host
///
/// Descriptor data is cached at enumeration time; in particular the
/// endpoint table is what the transfer engine routes SUBMITs with, so a
/// device whose descriptors could not be read is not enumerated.
#[derive(Debug, Clone)]
pub struct HostDevice {
    pub bus_id: BusId,
    pub bus_num: u32,
    pub dev_num: u32,
    pub speed: UsbSpeed,
    pub vendor_id: u16,
    pub product_id: u16,
    pub bcd_device: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub configuration_value: u8,
    pub num_configurations: u8,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial: Option<String>,
    pub interfaces: Vec<UsbInterface>,
    pub endpoints: Vec<EndpointInfo>,
}

impl HostDevice {
    /// Packed `(bus_num << 16) | dev_num` used on the URB channel
    pub fn devid(&self) -> u32 {
        (self.bus_num << 16) | (self.dev_num & 0xffff)
    }

    /// Transfer kind for an endpoint as addressed on the URB channel
    /// (`ep` is the bare number, `dir_in` the header's direction flag).
    /// Endpoint 0 is always control.
    pub fn endpoint_kind(&self, ep: u8, dir_in: bool) -> Option<EndpointKind> {
        if ep == 0 {
            return Some(EndpointKind::Control);
        }
        let address = if dir_in { ep | 0x80 } else { ep & 0x7f };
        self.endpoints
            .iter()
            .find(|e| e.address == address)
            .map(|e| e.kind)
    }

    /// The wire-format device record for this device
    pub fn record(&self) -> DeviceRecord {
        DeviceRecord {
            path: format!("/usbipd/devices/{}", self.bus_id),
            bus_id: self.bus_id.clone(),
            bus_num: self.bus_num,
            dev_num: self.dev_num,
            speed: self.speed,
            vendor_id: self.vendor_id,
            product_id: self.product_id,
            bcd_device: self.bcd_device,
            device_class: self.device_class,
            device_subclass: self.device_subclass,
            device_protocol: self.device_protocol,
            configuration_value: self.configuration_value,
            num_configurations: self.num_configurations,
            num_interfaces: self.interfaces.len() as u8,
        }
    }
}

/// Hotplug notification from the backend
#[derive(Debug, Clone)]
pub enum HotplugEvent {
    Added(HostDevice),
    Removed(BusId),
}

/// Failure of a backend management operation (enumerate/claim/release)
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// The host USB stack cannot be reached at all; fatal to the service
    #[error("host USB stack unavailable: {0}")]
    Unavailable(String),

    #[error("device not present")]
    NotFound,

    /// Another process (or another session) already owns the device
    #[error("device already claimed")]
    AlreadyClaimed,

    #[error("access denied by host")]
    Access,

    #[error("backend error: {0}")]
    Other(String),
}

/// Failure of an individual transfer; mapped to USB/IP status codes by the
/// engine and never fatal to the session
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("endpoint stalled")]
    Stall,

    #[error("device disconnected")]
    Disconnected,

    #[error("transfer timed out")]
    Timeout,

    #[error("transfer cancelled")]
    Cancelled,

    #[error("device returned more data than requested")]
    Overflow,

    #[error("transfer failed: {0}")]
    Other(String),
}

/// Direction-tagged transfer buffer
#[derive(Debug, Clone)]
pub enum TransferBuf {
    /// Device-to-host: the number of bytes the client asked for
    In { length: usize },
    /// Host-to-device: the payload to write
    Out { data: Vec<u8> },
}

impl TransferBuf {
    pub fn is_in(&self) -> bool {
        matches!(self, Self::In { .. })
    }

    pub fn len(&self) -> usize {
        match self {
            Self::In { length } => *length,
            Self::Out { data } => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of a control/bulk/interrupt transfer
///
/// For IN, `data` holds the device's bytes and `actual == data.len()`
/// (short reads are legal). For OUT, `data` is empty and `actual` is the
/// byte count accepted by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    pub data: Vec<u8>,
    pub actual: usize,
}

impl TransferOutcome {
    pub fn read(data: Vec<u8>) -> Self {
        let actual = data.len();
        Self { data, actual }
    }

    pub fn wrote(actual: usize) -> Self {
        Self {
            data: Vec::new(),
            actual,
        }
    }
}

/// One isochronous transfer: per-packet lengths plus the OUT payload
/// (empty for IN)
#[derive(Debug, Clone)]
pub struct IsoRequest {
    pub packet_lengths: Vec<u32>,
    pub data: Vec<u8>,
}

/// Per-packet isochronous result; `status` uses the same negated-errno
/// convention as the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoPacketOutcome {
    pub actual_length: u32,
    pub status: i32,
}

/// Result of an isochronous transfer. The transfer as a whole can succeed
/// while individual packets carry nonzero status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsoOutcome {
    /// Concatenated IN data (empty for OUT)
    pub data: Vec<u8>,
    pub packets: Vec<IsoPacketOutcome>,
}

impl IsoOutcome {
    /// Count of packets with nonzero status, reported as `error_count`
    pub fn error_count(&self) -> i32 {
        self.packets.iter().filter(|p| p.status != 0).count() as i32
    }
}

/// The six host-side USB operations the core consumes
///
/// All futures are `Send` so engine tasks can run on the multi-threaded
/// runtime. `claim` grants exclusive host-side ownership and must fail if
/// the device is claimed elsewhere on the host.
pub trait UsbBackend: Send + Sync + 'static {
    /// Opaque proof of an exclusive claim
    type Claim: Send + Sync + 'static;

    fn enumerate(&self) -> impl Future<Output = Result<Vec<HostDevice>, BackendError>> + Send;

    /// Hotplug event stream; a single consumer is expected
    fn subscribe_hotplug(&self) -> async_channel::Receiver<HotplugEvent>;

    fn claim(
        &self,
        bus_id: &BusId,
    ) -> impl Future<Output = Result<Self::Claim, BackendError>> + Send;

    fn release(&self, claim: &Self::Claim) -> impl Future<Output = ()> + Send;

    fn control_transfer(
        &self,
        claim: &Self::Claim,
        setup: [u8; 8],
        buf: TransferBuf,
        timeout: Duration,
        cancel: CancelToken,
    ) -> impl Future<Output = Result<TransferOutcome, TransferError>> + Send;

    fn bulk_transfer(
        &self,
        claim: &Self::Claim,
        endpoint: u8,
        buf: TransferBuf,
        timeout: Duration,
        cancel: CancelToken,
    ) -> impl Future<Output = Result<TransferOutcome, TransferError>> + Send;

    fn interrupt_transfer(
        &self,
        claim: &Self::Claim,
        endpoint: u8,
        buf: TransferBuf,
        timeout: Duration,
        cancel: CancelToken,
    ) -> impl Future<Output = Result<TransferOutcome, TransferError>> + Send;

    fn isochronous_transfer(
        &self,
        claim: &Self::Claim,
        endpoint: u8,
        request: IsoRequest,
        timeout: Duration,
        cancel: CancelToken,
    ) -> impl Future<Output = Result<IsoOutcome, TransferError>> + Send;
}
