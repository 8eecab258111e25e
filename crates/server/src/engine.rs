//! Transfer engine
//!
//! Owns the URB table and the full lifecycle of every in-flight transfer:
//! validation, routing by endpoint kind, per-type deadlines, cancellation
//! (UNLINK, surprise removal, session teardown) and completion delivery
//! back to the owning session's writer.
//!
//! Locking discipline: the table mutex is held only for map operations,
//! never across a backend call. Completion delivery resolves the session
//! by id through the supervisor-owned [`SessionTable`], so the engine
//! never holds a session alive.

use crate::network::session::{SessionOutput, SessionTable};
use crate::registry::SessionId;
use common::{
    CancelHandle, EndpointKind, Error, HostDevice, IsoOutcome, IsoRequest, TransferBuf,
    TransferError, TransferOutcome, UsbBackend, cancel_pair,
};
use protocol::{
    BusId, CmdSubmit, IsoPacketDescriptor, ProtocolError, RetSubmit, UrbMessage, USBIP_DIR_IN,
    status,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, warn};

/// Per-transfer-type deadlines
#[derive(Debug, Clone, Copy)]
pub struct TransferTimeouts {
    pub control: Duration,
    pub bulk: Duration,
    pub interrupt: Duration,
    pub iso: Duration,
}

impl Default for TransferTimeouts {
    fn default() -> Self {
        Self {
            control: Duration::from_secs(2),
            bulk: Duration::from_secs(10),
            interrupt: Duration::from_secs(1),
            iso: Duration::from_millis(100),
        }
    }
}

/// Why an in-flight URB was cancelled; decides what the session sees
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelCause {
    /// Client UNLINK: completion suppressed, RET_UNLINK carries the result
    Unlink,
    /// Device removed: completion converted to RET_SUBMIT(-ENODEV)
    Disconnect,
    /// Session teardown: everything suppressed, the socket is going away
    Teardown,
}

/// Result of a cancel request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// An in-flight URB was cancelled
    Cancelled,
    /// No such URB (already completed, or cancelled earlier)
    AlreadyGone,
}

/// Map a backend transfer failure to its USB/IP wire status
pub fn map_transfer_status(err: &TransferError) -> i32 {
    match err {
        TransferError::Stall => -status::EPIPE,
        TransferError::Disconnected => -status::ENODEV,
        TransferError::Timeout => -status::ETIMEDOUT,
        TransferError::Cancelled => -status::ECONNRESET,
        TransferError::Overflow => -status::EOVERFLOW,
        TransferError::Other(_) => -status::EPROTO,
    }
}

struct UrbEntry {
    cancel: CancelHandle,
    cause: Option<CancelCause>,
    /// Holds the per-device in-flight slot for the URB's lifetime
    _permit: OwnedSemaphorePermit,
}

enum UrbSuccess {
    Plain(TransferOutcome),
    Iso(IsoOutcome),
}

/// Concurrent URB processor shared by all sessions
pub struct TransferEngine<B: UsbBackend> {
    backend: Arc<B>,
    sessions: Arc<SessionTable>,
    table: Mutex<HashMap<(SessionId, u32), UrbEntry>>,
    slots: Mutex<HashMap<BusId, Arc<Semaphore>>>,
    timeouts: TransferTimeouts,
    max_in_flight_per_device: usize,
    max_transfer_bytes: usize,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl<B: UsbBackend> TransferEngine<B> {
    pub fn new(
        backend: Arc<B>,
        sessions: Arc<SessionTable>,
        timeouts: TransferTimeouts,
        max_in_flight_per_device: usize,
        max_transfer_bytes: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            backend,
            sessions,
            table: Mutex::new(HashMap::new()),
            slots: Mutex::new(HashMap::new()),
            timeouts,
            max_in_flight_per_device,
            max_transfer_bytes,
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        })
    }

    /// Schedule one CMD_SUBMIT.
    ///
    /// Returns `Err` only for protocol violations that must close the
    /// session (devid mismatch, duplicate seqnum). Everything else —
    /// including URBs rejected before reaching the backend — is reported
    /// through the session's writer as a RET_SUBMIT and resolves to `Ok`.
    ///
    /// Awaits a per-device in-flight slot, which is the intended
    /// back-pressure on the session's read pump.
    pub async fn submit(
        self: &Arc<Self>,
        session: SessionId,
        device: &HostDevice,
        claim: &Arc<B::Claim>,
        cmd: CmdSubmit,
    ) -> common::Result<()> {
        if cmd.devid != device.devid() {
            return Err(Error::Protocol(ProtocolError::MalformedFrame {
                reason: format!(
                    "devid {:#010x} does not match imported device {:#010x}",
                    cmd.devid,
                    device.devid()
                ),
            }));
        }

        let key = (session, cmd.seqnum);
        if self.table.lock().expect("urb table poisoned").contains_key(&key) {
            return Err(Error::Protocol(ProtocolError::MalformedFrame {
                reason: format!("duplicate seqnum {}", cmd.seqnum),
            }));
        }

        let kind = match self.validate(device, &cmd) {
            Ok(kind) => kind,
            Err(wire_status) => {
                debug!(
                    "Rejecting URB seqnum={} for {}: status {}",
                    cmd.seqnum, device.bus_id, wire_status
                );
                self.reply_error(session, cmd.seqnum, wire_status);
                return Ok(());
            }
        };

        let slot = self.slot_for(&device.bus_id);
        let permit = slot
            .acquire_owned()
            .await
            .map_err(|_| Error::Channel("in-flight semaphore closed".to_string()))?;

        let (cancel, token) = cancel_pair();
        self.table.lock().expect("urb table poisoned").insert(
            key,
            UrbEntry {
                cancel,
                cause: None,
                _permit: permit,
            },
        );

        let engine = Arc::clone(self);
        let claim = Arc::clone(claim);
        tokio::spawn(async move {
            engine.run_urb(session, kind, cmd, claim, token).await;
        });
        Ok(())
    }

    /// Pre-submission checks. `Err` carries the wire status for the
    /// rejection reply.
    fn validate(&self, device: &HostDevice, cmd: &CmdSubmit) -> std::result::Result<EndpointKind, i32> {
        if cmd.transfer_buffer_length as usize > self.max_transfer_bytes {
            return Err(-status::EINVAL);
        }

        let is_in = cmd.is_in();
        if cmd.ep == 0 {
            // The setup packet's direction bit must agree with the header.
            let setup_in = cmd.setup[0] & 0x80 != 0;
            if setup_in != is_in {
                return Err(-status::EINVAL);
            }
        }

        let Some(kind) = device.endpoint_kind(cmd.ep as u8, is_in) else {
            return Err(-status::EPROTO);
        };

        match kind {
            EndpointKind::Isochronous => {
                if cmd.number_of_packets == 0 {
                    return Err(-status::EINVAL);
                }
            }
            _ => {
                // Iso-only fields must be zero elsewhere.
                if cmd.number_of_packets != 0 {
                    return Err(-status::EINVAL);
                }
            }
        }

        Ok(kind)
    }

    async fn run_urb(
        self: Arc<Self>,
        session: SessionId,
        kind: EndpointKind,
        cmd: CmdSubmit,
        claim: Arc<B::Claim>,
        token: common::CancelToken,
    ) {
        let key = (session, cmd.seqnum);
        let is_in = cmd.is_in();
        let ep_addr = if is_in {
            cmd.ep as u8 | 0x80
        } else {
            cmd.ep as u8
        };
        let buf = if is_in {
            TransferBuf::In {
                length: cmd.transfer_buffer_length as usize,
            }
        } else {
            TransferBuf::Out {
                data: cmd.data.clone(),
            }
        };

        let deadline = match kind {
            EndpointKind::Control => self.timeouts.control,
            EndpointKind::Bulk => self.timeouts.bulk,
            EndpointKind::Interrupt => self.timeouts.interrupt,
            EndpointKind::Isochronous => self.timeouts.iso,
        };

        let outcome: std::result::Result<UrbSuccess, TransferError> = match kind {
            EndpointKind::Isochronous => {
                let request = IsoRequest {
                    packet_lengths: cmd.iso_packets.iter().map(|p| p.length).collect(),
                    data: cmd.data.clone(),
                };
                let fut = self
                    .backend
                    .isochronous_transfer(&claim, ep_addr, request, deadline, token);
                match tokio::time::timeout(deadline, fut).await {
                    Ok(result) => result.map(UrbSuccess::Iso),
                    Err(_) => {
                        self.signal_backend_cancel(key);
                        Err(TransferError::Timeout)
                    }
                }
            }
            _ => {
                let fut = async {
                    match kind {
                        EndpointKind::Control => {
                            self.backend
                                .control_transfer(&claim, cmd.setup, buf, deadline, token)
                                .await
                        }
                        EndpointKind::Bulk => {
                            self.backend
                                .bulk_transfer(&claim, ep_addr, buf, deadline, token)
                                .await
                        }
                        EndpointKind::Interrupt => {
                            self.backend
                                .interrupt_transfer(&claim, ep_addr, buf, deadline, token)
                                .await
                        }
                        EndpointKind::Isochronous => unreachable!("handled above"),
                    }
                };
                match tokio::time::timeout(deadline, fut).await {
                    Ok(result) => result.map(UrbSuccess::Plain),
                    Err(_) => {
                        self.signal_backend_cancel(key);
                        Err(TransferError::Timeout)
                    }
                }
            }
        };

        self.complete(session, &cmd, outcome);
    }

    /// Fire the cancel handle toward the backend without recording a
    /// cause; used when a deadline elapses and the backend call may still
    /// be holding resources.
    fn signal_backend_cancel(&self, key: (SessionId, u32)) {
        if let Some(entry) = self.table.lock().expect("urb table poisoned").get(&key) {
            entry.cancel.cancel();
        }
    }

    /// Remove the entry and deliver (or suppress) the completion.
    /// Exactly-once: removal and cause inspection happen under one lock
    /// acquisition, so a racing UNLINK either marked the entry before this
    /// (suppressed) or finds it gone (reported as already-gone).
    fn complete(
        &self,
        session: SessionId,
        cmd: &CmdSubmit,
        outcome: std::result::Result<UrbSuccess, TransferError>,
    ) {
        let entry = self
            .table
            .lock()
            .expect("urb table poisoned")
            .remove(&(session, cmd.seqnum));
        let Some(entry) = entry else {
            // The table never loses entries before completion; this would
            // mean two completions for one URB.
            error!("URB {}:{} completed without a table entry", session, cmd.seqnum);
            return;
        };

        let reply = match entry.cause {
            Some(CancelCause::Unlink) | Some(CancelCause::Teardown) => {
                debug!("Suppressing completion for cancelled URB seqnum={}", cmd.seqnum);
                None
            }
            Some(CancelCause::Disconnect) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                Some(RetSubmit::error(cmd.seqnum, -status::ENODEV))
            }
            None => Some(self.build_reply(cmd, outcome)),
        };

        if let Some(ret) = reply {
            self.send_reply(session, ret);
        }
    }

    fn build_reply(
        &self,
        cmd: &CmdSubmit,
        outcome: std::result::Result<UrbSuccess, TransferError>,
    ) -> RetSubmit {
        let is_in = cmd.is_in();
        match outcome {
            Ok(UrbSuccess::Plain(result)) => {
                if is_in && result.data.len() > cmd.transfer_buffer_length as usize {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    return RetSubmit::error(cmd.seqnum, -status::EOVERFLOW);
                }
                self.completed.fetch_add(1, Ordering::Relaxed);
                let mut ret = RetSubmit::completion(
                    cmd.seqnum,
                    status::URB_OK,
                    result.actual as i32,
                    if is_in { result.data } else { Vec::new() },
                );
                if is_in {
                    ret.direction = USBIP_DIR_IN;
                }
                ret
            }
            Ok(UrbSuccess::Iso(iso)) => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                let packets: Vec<IsoPacketDescriptor> = cmd
                    .iso_packets
                    .iter()
                    .zip(&iso.packets)
                    .map(|(req, out)| IsoPacketDescriptor {
                        offset: req.offset,
                        length: req.length,
                        actual_length: out.actual_length,
                        status: out.status,
                    })
                    .collect();
                let actual: i32 = if is_in {
                    iso.data.len() as i32
                } else {
                    iso.packets.iter().map(|p| p.actual_length as i32).sum()
                };
                let error_count = iso.error_count();
                let mut ret = RetSubmit::completion(
                    cmd.seqnum,
                    status::URB_OK,
                    actual,
                    if is_in { iso.data } else { Vec::new() },
                );
                if is_in {
                    ret.direction = USBIP_DIR_IN;
                }
                ret.number_of_packets = packets.len() as i32;
                ret.error_count = error_count;
                ret.iso_packets = packets;
                ret
            }
            Err(err) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                RetSubmit::error(cmd.seqnum, map_transfer_status(&err))
            }
        }
    }

    fn reply_error(&self, session: SessionId, seqnum: u32, wire_status: i32) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.send_reply(session, RetSubmit::error(seqnum, wire_status));
    }

    fn send_reply(&self, session: SessionId, ret: RetSubmit) {
        let mut frame = Vec::new();
        if let Err(e) = UrbMessage::RetSubmit(ret).write_to(&mut frame) {
            error!("Failed to encode RET_SUBMIT: {}", e);
            return;
        }
        if !self.sessions.send(session, SessionOutput::Frame(frame)) {
            debug!("Dropping completion for departed {}", session);
        }
    }

    /// Cancel one URB. Idempotent: a second cancel of the same seqnum
    /// reports `AlreadyGone`.
    pub fn cancel(&self, session: SessionId, seqnum: u32, cause: CancelCause) -> CancelOutcome {
        let mut table = self.table.lock().expect("urb table poisoned");
        match table.get_mut(&(session, seqnum)) {
            Some(entry) if entry.cause.is_none() => {
                entry.cause = Some(cause);
                entry.cancel.cancel();
                CancelOutcome::Cancelled
            }
            Some(_) => CancelOutcome::AlreadyGone,
            None => CancelOutcome::AlreadyGone,
        }
    }

    /// Cancel every URB belonging to `session`
    pub fn cancel_session(&self, session: SessionId, cause: CancelCause) -> usize {
        let mut table = self.table.lock().expect("urb table poisoned");
        let mut cancelled = 0;
        for ((owner, _), entry) in table.iter_mut() {
            if *owner == session && entry.cause.is_none() {
                entry.cause = Some(cause);
                entry.cancel.cancel();
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            warn!("Cancelled {} URB(s) for {} ({:?})", cancelled, session, cause);
        }
        cancelled
    }

    /// Wait until `session` has no URB table entries, bounded by
    /// `timeout`. Returns whether the drain completed.
    pub async fn drain_session(&self, session: SessionId, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.in_flight_for(session) == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    "Drain timed out with {} URB(s) still in flight for {}",
                    self.in_flight_for(session),
                    session
                );
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn slot_for(&self, bus_id: &BusId) -> Arc<Semaphore> {
        let mut slots = self.slots.lock().expect("slot map poisoned");
        Arc::clone(
            slots
                .entry(bus_id.clone())
                .or_insert_with(|| Arc::new(Semaphore::new(self.max_in_flight_per_device))),
        )
    }

    /// Total in-flight URBs
    pub fn in_flight(&self) -> usize {
        self.table.lock().expect("urb table poisoned").len()
    }

    /// In-flight URBs owned by one session
    pub fn in_flight_for(&self, session: SessionId) -> usize {
        self.table
            .lock()
            .expect("urb table poisoned")
            .keys()
            .filter(|(owner, _)| *owner == session)
            .count()
    }

    /// Lifetime counters: (completed, failed)
    pub fn counters(&self) -> (u64, u64) {
        (
            self.completed.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
        )
    }
}
