//! Shared test utilities
//!
//! `MockBackend` is a fully scriptable [`UsbBackend`] used by unit and
//! integration tests across the workspace. It enforces the same claim
//! exclusivity contract as the real backend and lets tests inject hotplug
//! events and per-endpoint transfer outcomes.

use crate::backend::{
    BackendError, EndpointInfo, EndpointKind, HostDevice, HotplugEvent, IsoOutcome,
    IsoPacketOutcome, IsoRequest, TransferBuf, TransferError, TransferOutcome, UsbBackend,
};
use crate::cancel::CancelToken;
use protocol::{BusId, UsbInterface, UsbSpeed};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

/// Upper bound for any single await inside a test
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Await a future, panicking if it takes longer than the test timeout
pub async fn with_timeout<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(DEFAULT_TEST_TIMEOUT, fut)
        .await
        .expect("test timed out")
}

/// Standard device descriptor served for control IN on endpoint 0
/// (a Linux Foundation 2.0 root-hub-shaped device, 18 bytes)
pub const MOCK_DEVICE_DESCRIPTOR: [u8; 18] = [
    0x12, 0x01, 0x00, 0x02, 0x09, 0x00, 0x00, 0x40, 0x6b, 0x1d, 0x02, 0x00, 0x00, 0x02, 0x01,
    0x02, 0x03, 0x01,
];

/// A canned high-speed device with one hub-class interface, bulk endpoints
/// 0x81/0x02, interrupt IN 0x83 and isochronous IN 0x84
pub fn mock_device(bus_id: &str) -> HostDevice {
    HostDevice {
        bus_id: BusId::new(bus_id).unwrap(),
        bus_num: 1,
        dev_num: 2,
        speed: UsbSpeed::High,
        vendor_id: 0x1d6b,
        product_id: 0x0002,
        bcd_device: 0x0200,
        device_class: 9,
        device_subclass: 0,
        device_protocol: 0,
        configuration_value: 1,
        num_configurations: 1,
        manufacturer: Some("Mock Industries".to_string()),
        product: Some("Mock Hub".to_string()),
        serial: Some("MOCK0001".to_string()),
        interfaces: vec![UsbInterface {
            interface_class: 9,
            interface_subclass: 0,
            interface_protocol: 0,
        }],
        endpoints: vec![
            EndpointInfo {
                address: 0x81,
                kind: EndpointKind::Bulk,
                interval: 0,
            },
            EndpointInfo {
                address: 0x02,
                kind: EndpointKind::Bulk,
                interval: 0,
            },
            EndpointInfo {
                address: 0x83,
                kind: EndpointKind::Interrupt,
                interval: 10,
            },
            EndpointInfo {
                address: 0x84,
                kind: EndpointKind::Isochronous,
                interval: 1,
            },
        ],
    }
}

/// One scripted transfer outcome
#[derive(Debug)]
pub enum MockTransfer {
    /// Complete with this result
    Reply(Result<TransferOutcome, TransferError>),
    /// Park until the cancel token fires, then report `Cancelled`
    HangUntilCancel,
}

#[derive(Default)]
struct MockState {
    devices: Vec<HostDevice>,
    claimed: HashSet<BusId>,
    /// Keyed by endpoint address with direction bit (0 = control)
    scripts: HashMap<u8, VecDeque<MockTransfer>>,
    iso_scripts: HashMap<u8, VecDeque<Result<IsoOutcome, TransferError>>>,
    enumerate_failures: u32,
}

/// Scriptable in-process USB backend
pub struct MockBackend {
    state: Mutex<MockState>,
    hotplug_tx: async_channel::Sender<HotplugEvent>,
    hotplug_rx: async_channel::Receiver<HotplugEvent>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        let (hotplug_tx, hotplug_rx) = async_channel::bounded(64);
        Self {
            state: Mutex::new(MockState::default()),
            hotplug_tx,
            hotplug_rx,
        }
    }

    pub fn with_device(device: HostDevice) -> Self {
        let backend = Self::new();
        backend.state.lock().unwrap().devices.push(device);
        backend
    }

    /// Add a device and emit a hotplug Added event
    pub fn plug(&self, device: HostDevice) {
        debug!("mock: plugging {}", device.bus_id);
        self.state.lock().unwrap().devices.push(device.clone());
        let _ = self.hotplug_tx.try_send(HotplugEvent::Added(device));
    }

    /// Remove a device and emit a hotplug Removed event; existing claims
    /// stay stale (transfers against them fail with `Disconnected`)
    pub fn unplug(&self, bus_id: &BusId) {
        debug!("mock: unplugging {}", bus_id);
        self.state
            .lock()
            .unwrap()
            .devices
            .retain(|d| &d.bus_id != bus_id);
        let _ = self
            .hotplug_tx
            .try_send(HotplugEvent::Removed(bus_id.clone()));
    }

    /// Queue a scripted outcome for an endpoint address (0 = control)
    pub fn script(&self, endpoint: u8, outcome: MockTransfer) {
        self.state
            .lock()
            .unwrap()
            .scripts
            .entry(endpoint)
            .or_default()
            .push_back(outcome);
    }

    /// Queue a scripted isochronous outcome for an endpoint address
    pub fn script_iso(&self, endpoint: u8, outcome: Result<IsoOutcome, TransferError>) {
        self.state
            .lock()
            .unwrap()
            .iso_scripts
            .entry(endpoint)
            .or_default()
            .push_back(outcome);
    }

    /// Make the next `n` enumerate calls fail (for health-monitor tests)
    pub fn fail_enumerates(&self, n: u32) {
        self.state.lock().unwrap().enumerate_failures = n;
    }

    /// Whether the device is currently claimed
    pub fn is_claimed(&self, bus_id: &BusId) -> bool {
        self.state.lock().unwrap().claimed.contains(bus_id)
    }

    fn take_script(&self, endpoint: u8) -> Option<MockTransfer> {
        self.state
            .lock()
            .unwrap()
            .scripts
            .get_mut(&endpoint)
            .and_then(|q| q.pop_front())
    }

    fn device_present(&self, bus_id: &BusId) -> bool {
        self.state
            .lock()
            .unwrap()
            .devices
            .iter()
            .any(|d| &d.bus_id == bus_id)
    }

    async fn run_transfer(
        &self,
        claim: &MockClaim,
        endpoint: u8,
        buf: TransferBuf,
        mut cancel: CancelToken,
    ) -> Result<TransferOutcome, TransferError> {
        if !self.device_present(&claim.bus_id) {
            return Err(TransferError::Disconnected);
        }

        match self.take_script(endpoint) {
            Some(MockTransfer::Reply(result)) => result,
            Some(MockTransfer::HangUntilCancel) => {
                cancel.cancelled().await;
                Err(TransferError::Cancelled)
            }
            None => Ok(match buf {
                TransferBuf::In { length } => {
                    let data = if endpoint == 0 {
                        MOCK_DEVICE_DESCRIPTOR[..length.min(MOCK_DEVICE_DESCRIPTOR.len())]
                            .to_vec()
                    } else {
                        vec![0u8; length]
                    };
                    TransferOutcome::read(data)
                }
                TransferBuf::Out { data } => TransferOutcome::wrote(data.len()),
            }),
        }
    }
}

/// Claim handle issued by [`MockBackend`]
#[derive(Debug, Clone)]
pub struct MockClaim {
    pub bus_id: BusId,
}

impl UsbBackend for MockBackend {
    type Claim = MockClaim;

    async fn enumerate(&self) -> Result<Vec<HostDevice>, BackendError> {
        let mut state = self.state.lock().unwrap();
        if state.enumerate_failures > 0 {
            state.enumerate_failures -= 1;
            return Err(BackendError::Unavailable("scripted failure".to_string()));
        }
        Ok(state.devices.clone())
    }

    fn subscribe_hotplug(&self) -> async_channel::Receiver<HotplugEvent> {
        self.hotplug_rx.clone()
    }

    async fn claim(&self, bus_id: &BusId) -> Result<MockClaim, BackendError> {
        let mut state = self.state.lock().unwrap();
        if !state.devices.iter().any(|d| &d.bus_id == bus_id) {
            return Err(BackendError::NotFound);
        }
        if !state.claimed.insert(bus_id.clone()) {
            return Err(BackendError::AlreadyClaimed);
        }
        Ok(MockClaim {
            bus_id: bus_id.clone(),
        })
    }

    async fn release(&self, claim: &MockClaim) {
        self.state.lock().unwrap().claimed.remove(&claim.bus_id);
    }

    async fn control_transfer(
        &self,
        claim: &MockClaim,
        _setup: [u8; 8],
        buf: TransferBuf,
        _timeout: Duration,
        cancel: CancelToken,
    ) -> Result<TransferOutcome, TransferError> {
        self.run_transfer(claim, 0, buf, cancel).await
    }

    async fn bulk_transfer(
        &self,
        claim: &MockClaim,
        endpoint: u8,
        buf: TransferBuf,
        _timeout: Duration,
        cancel: CancelToken,
    ) -> Result<TransferOutcome, TransferError> {
        self.run_transfer(claim, endpoint, buf, cancel).await
    }

    async fn interrupt_transfer(
        &self,
        claim: &MockClaim,
        endpoint: u8,
        buf: TransferBuf,
        _timeout: Duration,
        cancel: CancelToken,
    ) -> Result<TransferOutcome, TransferError> {
        self.run_transfer(claim, endpoint, buf, cancel).await
    }

    async fn isochronous_transfer(
        &self,
        claim: &MockClaim,
        endpoint: u8,
        request: IsoRequest,
        _timeout: Duration,
        _cancel: CancelToken,
    ) -> Result<IsoOutcome, TransferError> {
        if !self.device_present(&claim.bus_id) {
            return Err(TransferError::Disconnected);
        }

        let scripted = self
            .state
            .lock()
            .unwrap()
            .iso_scripts
            .get_mut(&endpoint)
            .and_then(|q| q.pop_front());
        if let Some(result) = scripted {
            return result;
        }

        // Default: every packet succeeds at its full length
        let is_in = endpoint & 0x80 != 0;
        let total: u32 = request.packet_lengths.iter().sum();
        Ok(IsoOutcome {
            data: if is_in {
                vec![0u8; total as usize]
            } else {
                Vec::new()
            },
            packets: request
                .packet_lengths
                .iter()
                .map(|&len| IsoPacketOutcome {
                    actual_length: len,
                    status: 0,
                })
                .collect(),
        })
    }
}
