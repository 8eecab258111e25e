//! Per-connection session handler
//!
//! One session per accepted TCP connection, split into a reader task (this
//! module's read loop) and a writer task joined by an unbounded channel of
//! outbound frames. The state machine is the USB/IP one: op channel until
//! a successful import, URB channel after.
//!
//! Completion frames reach the writer through the [`SessionTable`], which
//! the supervisor owns; the engine only ever holds a [`SessionId`], never
//! the session itself.

use crate::engine::{CancelCause, CancelOutcome, TransferEngine};
use crate::registry::{DeviceRegistry, SessionId};
use common::{CancelHandle, Error, HostDevice, UsbBackend, cancel_pair};
use protocol::{
    OpReply, OpRequest, ProtocolError, RetUnlink, UrbMessage, read_op_request, read_urb_message,
    status,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// How long teardown waits for cancelled URBs to drain
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// One item on a session's writer channel
#[derive(Debug)]
pub enum SessionOutput {
    /// Pre-encoded wire bytes, written in arrival order
    Frame(Vec<u8>),
    /// Flush-and-close marker
    Shutdown,
}

struct SessionEntry {
    out: mpsc::UnboundedSender<SessionOutput>,
    shutdown: CancelHandle,
}

/// Supervisor-owned lookup table from session id to its writer channel
/// and shutdown signal
pub struct SessionTable {
    inner: Mutex<HashMap<SessionId, SessionEntry>>,
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(
        &self,
        id: SessionId,
        out: mpsc::UnboundedSender<SessionOutput>,
        shutdown: CancelHandle,
    ) {
        self.inner
            .lock()
            .expect("session table poisoned")
            .insert(id, SessionEntry { out, shutdown });
    }

    pub fn deregister(&self, id: SessionId) {
        self.inner.lock().expect("session table poisoned").remove(&id);
    }

    /// Enqueue output for a session; false if it is gone
    pub fn send(&self, id: SessionId, output: SessionOutput) -> bool {
        let inner = self.inner.lock().expect("session table poisoned");
        match inner.get(&id) {
            Some(entry) => entry.out.send(output).is_ok(),
            None => false,
        }
    }

    /// Ask a session to stop reading and tear down; false if it is gone
    pub fn shutdown(&self, id: SessionId) -> bool {
        let inner = self.inner.lock().expect("session table poisoned");
        match inner.get(&id) {
            Some(entry) => {
                entry.shutdown.cancel();
                true
            }
            None => false,
        }
    }

    /// Ask every session to tear down
    pub fn shutdown_all(&self) {
        for entry in self.inner.lock().expect("session table poisoned").values() {
            entry.shutdown.cancel();
        }
    }

    pub fn active(&self) -> usize {
        self.inner.lock().expect("session table poisoned").len()
    }
}

/// Protocol phase of one session
enum Phase<B: UsbBackend> {
    /// Command channel: devlist and import requests. (The devlist reply
    /// returns here immediately, so the transient reply state needs no
    /// representation of its own.)
    Op,
    /// URB channel: exactly one device is owned by this session
    Imported {
        device: HostDevice,
        claim: Arc<B::Claim>,
    },
}

/// Handler for one client connection
pub struct Session<B: UsbBackend> {
    id: SessionId,
    backend: Arc<B>,
    registry: Arc<DeviceRegistry>,
    engine: Arc<TransferEngine<B>>,
    sessions: Arc<SessionTable>,
}

impl<B: UsbBackend> Session<B> {
    pub fn new(
        id: SessionId,
        backend: Arc<B>,
        registry: Arc<DeviceRegistry>,
        engine: Arc<TransferEngine<B>>,
        sessions: Arc<SessionTable>,
    ) -> Self {
        Self {
            id,
            backend,
            registry,
            engine,
            sessions,
        }
    }

    /// Drive the session until peer close, protocol error, or supervisor
    /// shutdown, then run full teardown.
    pub async fn run(self, stream: TcpStream) {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        info!("{} connected from {}", self.id, peer);

        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed for {}: {}", self.id, e);
        }

        let (mut read_half, mut write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (shutdown_handle, mut shutdown_token) = cancel_pair();
        self.sessions.register(self.id, tx.clone(), shutdown_handle);

        // Writer task: the only place that touches the socket's write half,
        // which is what serializes outbound frames.
        let writer = tokio::spawn(async move {
            while let Some(output) = rx.recv().await {
                match output {
                    SessionOutput::Frame(bytes) => {
                        if write_half.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                    SessionOutput::Shutdown => break,
                }
            }
            let _ = write_half.shutdown().await;
        });

        let mut phase: Phase<B> = Phase::Op;
        let result = tokio::select! {
            res = self.read_loop(&mut read_half, &tx, &mut phase) => res,
            _ = shutdown_token.cancelled() => {
                debug!("{} shut down by supervisor", self.id);
                Ok(())
            }
        };

        match result {
            Ok(()) => debug!("{} read loop ended", self.id),
            Err(e) => warn!("{} closing on error: {}", self.id, e),
        }

        // Teardown: cancel and drain before the device is released, so the
        // backend never sees transfers against a released claim.
        self.engine.cancel_session(self.id, CancelCause::Teardown);
        self.engine.drain_session(self.id, DRAIN_TIMEOUT).await;

        if let Phase::Imported { claim, .. } = &phase {
            self.registry.end_export(self.id).await;
            self.backend.release(claim).await;
        }

        self.sessions.deregister(self.id);
        let _ = tx.send(SessionOutput::Shutdown);
        let _ = writer.await;
        info!("{} closed", self.id);
    }

    async fn read_loop(
        &self,
        reader: &mut OwnedReadHalf,
        tx: &mpsc::UnboundedSender<SessionOutput>,
        phase: &mut Phase<B>,
    ) -> common::Result<()> {
        loop {
            match phase {
                Phase::Op => {
                    let request = match read_op_request(reader).await {
                        Ok(request) => request,
                        Err(e) if is_clean_eof(&e) => return Ok(()),
                        Err(e) => return Err(e.into()),
                    };
                    match request {
                        OpRequest::DevList => self.handle_devlist(tx).await?,
                        OpRequest::Import { bus_id } => {
                            if let Some(imported) = self.handle_import(&bus_id, tx).await? {
                                *phase = imported;
                            }
                        }
                    }
                }
                Phase::Imported { device, claim } => {
                    let message = match read_urb_message(reader).await {
                        Ok(message) => message,
                        Err(e) if is_clean_eof(&e) => return Ok(()),
                        Err(e) => return Err(e.into()),
                    };
                    match message {
                        UrbMessage::CmdSubmit(cmd) => {
                            self.engine.submit(self.id, device, claim, cmd).await?;
                        }
                        UrbMessage::CmdUnlink(unlink) => {
                            let outcome = self.engine.cancel(
                                self.id,
                                unlink.unlink_seqnum,
                                CancelCause::Unlink,
                            );
                            let wire_status = match outcome {
                                CancelOutcome::Cancelled => -status::ECONNRESET,
                                CancelOutcome::AlreadyGone => 0,
                            };
                            debug!(
                                "{} UNLINK seqnum={} -> {}",
                                self.id, unlink.unlink_seqnum, wire_status
                            );
                            send_urb(
                                tx,
                                UrbMessage::RetUnlink(RetUnlink {
                                    seqnum: unlink.seqnum,
                                    status: wire_status,
                                }),
                            )?;
                        }
                        UrbMessage::RetSubmit(_) | UrbMessage::RetUnlink(_) => {
                            return Err(Error::Protocol(ProtocolError::MalformedFrame {
                                reason: "reply message from client".to_string(),
                            }));
                        }
                    }
                }
            }
        }
    }

    /// OP_REQ_DEVLIST: point-in-time snapshot of the exportable set
    async fn handle_devlist(
        &self,
        tx: &mpsc::UnboundedSender<SessionOutput>,
    ) -> common::Result<()> {
        let devices = self.registry.exportable().await;
        debug!("{} devlist: {} exportable device(s)", self.id, devices.len());

        let reply = OpReply::DevList {
            devices: devices
                .into_iter()
                .map(|d| protocol::DevListDevice {
                    record: d.record(),
                    interfaces: d.interfaces.clone(),
                })
                .collect(),
        };
        send_op(tx, reply)
    }

    /// OP_REQ_IMPORT: registry transition first, then the backend claim;
    /// a failed claim rolls the registry back. Returns the new phase on
    /// success, None (with an error reply sent) on failure.
    async fn handle_import(
        &self,
        bus_id: &protocol::BusId,
        tx: &mpsc::UnboundedSender<SessionOutput>,
    ) -> common::Result<Option<Phase<B>>> {
        let device = match self.registry.begin_export(bus_id, self.id).await {
            Ok(device) => device,
            Err(e) => {
                debug!("{} import of {} refused: {}", self.id, bus_id, e);
                send_op(
                    tx,
                    OpReply::Import {
                        status: status::ST_NA,
                        record: None,
                    },
                )?;
                return Ok(None);
            }
        };

        match self.backend.claim(bus_id).await {
            Ok(claim) => {
                info!("{} imported {}", self.id, bus_id);
                send_op(
                    tx,
                    OpReply::Import {
                        status: status::ST_OK,
                        record: Some(device.record()),
                    },
                )?;
                Ok(Some(Phase::Imported {
                    device,
                    claim: Arc::new(claim),
                }))
            }
            Err(e) => {
                warn!("{} claim of {} failed: {}", self.id, bus_id, e);
                self.registry.end_export(self.id).await;
                send_op(
                    tx,
                    OpReply::Import {
                        status: status::ST_NA,
                        record: None,
                    },
                )?;
                Ok(None)
            }
        }
    }
}

fn send_op(tx: &mpsc::UnboundedSender<SessionOutput>, reply: OpReply) -> common::Result<()> {
    let mut frame = Vec::new();
    reply.write_to(&mut frame)?;
    tx.send(SessionOutput::Frame(frame))
        .map_err(|_| Error::Channel("session writer is gone".to_string()))
}

fn send_urb(tx: &mpsc::UnboundedSender<SessionOutput>, message: UrbMessage) -> common::Result<()> {
    let mut frame = Vec::new();
    message.write_to(&mut frame)?;
    tx.send(SessionOutput::Frame(frame))
        .map_err(|_| Error::Channel("session writer is gone".to_string()))
}

/// Peer close between messages is a clean end of session, not an error
fn is_clean_eof(err: &ProtocolError) -> bool {
    matches!(
        err,
        ProtocolError::Io(io) if io.kind() == std::io::ErrorKind::UnexpectedEof
    )
}
