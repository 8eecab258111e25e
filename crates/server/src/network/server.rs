//! TCP server
//!
//! Binds the configured addresses, accepts connections, and spawns one
//! [`Session`] task per client. Also owns the supervisor-side plumbing the
//! sessions and engine hang off: the session table, the hotplug pump, and
//! service-wide shutdown.

use crate::config::ServerConfig;
use crate::engine::{CancelCause, TransferEngine};
use crate::network::session::{DRAIN_TIMEOUT, Session, SessionTable};
use crate::persist::{load_bind_file, spawn_persist_task};
use crate::registry::{DeviceRegistry, DeviceState, SessionId};
use common::{CancelHandle, CancelToken, Error, HostDevice, HotplugEvent, UsbBackend, cancel_pair};
use protocol::BusId;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Point-in-time counters for the `status` verb
#[derive(Debug, Clone)]
pub struct ServerStatus {
    pub sessions: usize,
    pub devices: usize,
    pub exported: usize,
    pub urbs_in_flight: usize,
    pub urbs_completed: u64,
    pub urbs_failed: u64,
}

/// The USB/IP daemon: accept loop plus supervisor state
pub struct UsbIpServer<B: UsbBackend> {
    config: ServerConfig,
    backend: Arc<B>,
    registry: Arc<DeviceRegistry>,
    engine: Arc<TransferEngine<B>>,
    sessions: Arc<SessionTable>,
    listeners: std::sync::Mutex<Vec<TcpListener>>,
    local_addrs: Vec<SocketAddr>,
    next_session: AtomicU64,
    shutdown: CancelHandle,
    shutdown_token: CancelToken,
}

impl<B: UsbBackend> UsbIpServer<B> {
    /// Bind the address from the configuration
    pub async fn bind(config: ServerConfig, backend: Arc<B>) -> common::Result<Arc<Self>> {
        let addr = config
            .listen_addr()
            .map_err(|e| Error::Config(e.to_string()))?;
        Self::bind_to(config, backend, &[addr]).await
    }

    /// Bind an explicit address list (a single server may listen on
    /// several, e.g. one IPv4 and one IPv6)
    pub async fn bind_to(
        config: ServerConfig,
        backend: Arc<B>,
        addrs: &[SocketAddr],
    ) -> common::Result<Arc<Self>> {
        // State first: a server that cannot load its bind set must not
        // accept clients and silently export nothing.
        let state_path = config.expanded_state_path();
        let persisted = load_bind_file(&state_path)?;
        let persist = spawn_persist_task(state_path);

        let registry = Arc::new(DeviceRegistry::new(persist));
        let devices = backend.enumerate().await?;
        registry.reconcile(devices, persisted).await;

        let sessions = Arc::new(SessionTable::new());
        let engine = TransferEngine::new(
            Arc::clone(&backend),
            Arc::clone(&sessions),
            config.transfer_timeouts(),
            config.limits.max_in_flight_per_device,
            config.limits.max_transfer_bytes,
        );

        let mut listeners = Vec::with_capacity(addrs.len());
        let mut local_addrs = Vec::with_capacity(addrs.len());
        for addr in addrs {
            let listener = TcpListener::bind(addr).await?;
            local_addrs.push(listener.local_addr()?);
            listeners.push(listener);
        }
        info!("Listening on {:?}", local_addrs);

        let (shutdown, shutdown_token) = cancel_pair();
        Ok(Arc::new(Self {
            config,
            backend,
            registry,
            engine,
            sessions,
            listeners: std::sync::Mutex::new(listeners),
            local_addrs,
            next_session: AtomicU64::new(1),
            shutdown,
            shutdown_token,
        }))
    }

    /// Addresses actually bound (with resolved ports)
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &Arc<TransferEngine<B>> {
        &self.engine
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Accept connections until shutdown. Returns after every session has
    /// been torn down.
    pub async fn run(self: Arc<Self>) -> common::Result<()> {
        let pump = tokio::spawn(Arc::clone(&self).hotplug_pump());

        let listeners = std::mem::take(
            &mut *self.listeners.lock().expect("listener vec poisoned"),
        );
        if listeners.is_empty() {
            return Err(Error::Config("server already running".to_string()));
        }

        let mut accept_tasks = JoinSet::new();
        for listener in listeners {
            let server = Arc::clone(&self);
            accept_tasks.spawn(async move { server.accept_loop(listener).await });
        }

        while accept_tasks.join_next().await.is_some() {}

        // Shutdown of the whole service: every session, then every URB
        // (each session teardown cancels and drains its own).
        self.sessions.shutdown_all();
        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT + Duration::from_secs(1);
        while self.sessions.active() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        if self.sessions.active() > 0 {
            warn!("{} session(s) did not tear down in time", self.sessions.active());
        }

        pump.abort();
        info!("Server stopped");
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut token = self.shutdown_token.clone();
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let id = SessionId(self.next_session.fetch_add(1, Ordering::Relaxed));
                            debug!("Accepted {} as {}", peer, id);
                            let session = Session::new(
                                id,
                                Arc::clone(&self.backend),
                                Arc::clone(&self.registry),
                                Arc::clone(&self.engine),
                                Arc::clone(&self.sessions),
                            );
                            tokio::spawn(session.run(stream));
                        }
                        Err(e) => {
                            // Transient accept errors (EMFILE and friends)
                            // should not kill the listener.
                            error!("Accept failed: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        }
    }

    /// Apply backend hotplug events to the registry; a removal of an
    /// exported device fails its in-flight URBs with `-ENODEV` and then
    /// closes the owning session.
    async fn hotplug_pump(self: Arc<Self>) {
        let rx = self.backend.subscribe_hotplug();
        let mut token = self.shutdown_token.clone();
        loop {
            let event = tokio::select! {
                _ = token.cancelled() => break,
                event = rx.recv() => match event {
                    Ok(event) => event,
                    Err(_) => {
                        warn!("Hotplug stream closed by backend");
                        break;
                    }
                },
            };

            match &event {
                HotplugEvent::Added(device) => debug!("Hotplug add: {}", device.bus_id),
                HotplugEvent::Removed(bus_id) => debug!("Hotplug remove: {}", bus_id),
            }

            if let Some(victim) = self.registry.apply_hotplug(event).await {
                info!("Surprise removal: tearing down {}", victim);
                self.engine.cancel_session(victim, CancelCause::Disconnect);
                self.engine.drain_session(victim, DRAIN_TIMEOUT).await;
                self.sessions.shutdown(victim);
            }
        }
    }

    /// Stop accepting and tear everything down; `run` returns once done
    pub fn shutdown(&self) {
        info!("Shutdown requested");
        self.shutdown.cancel();
    }

    /// A health monitor wired to this server's backend, engine, and
    /// session table
    pub fn health_monitor(&self, config: crate::health::HealthConfig) -> crate::health::HealthMonitor<B> {
        crate::health::HealthMonitor::new(
            Arc::clone(&self.backend),
            Arc::clone(&self.engine),
            Arc::clone(&self.sessions),
            config,
        )
    }

    pub async fn status(&self) -> ServerStatus {
        let (devices, exported) = self.registry.counts().await;
        let (urbs_completed, urbs_failed) = self.engine.counters();
        ServerStatus {
            sessions: self.sessions.active(),
            devices,
            exported,
            urbs_in_flight: self.engine.in_flight(),
            urbs_completed,
            urbs_failed,
        }
    }

    // Library surface for the CLI verbs.

    pub async fn list_devices(&self) -> Vec<(HostDevice, DeviceState)> {
        self.registry.list().await
    }

    pub async fn bind_device(&self, bus_id: &BusId) -> common::Result<()> {
        self.registry.bind(bus_id).await
    }

    /// Unbind; if a session currently exports the device it is
    /// force-closed (which drains its URBs and releases the claim).
    pub async fn unbind_device(&self, bus_id: &BusId) -> common::Result<()> {
        if let Some(victim) = self.registry.unbind(bus_id).await? {
            info!("Unbind of {} force-closes {}", bus_id, victim);
            self.sessions.shutdown(victim);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{MockBackend, mock_device};
    use tempfile::tempdir;

    fn test_config(dir: &std::path::Path) -> ServerConfig {
        let mut config = ServerConfig::default();
        config.server.listen_address = "127.0.0.1".to_string();
        config.server.listen_port = 0;
        config.state.state_file_path = dir.join("bindings");
        config
    }

    #[tokio::test]
    async fn test_bind_resolves_ephemeral_port() {
        let dir = tempdir().unwrap();
        let backend = Arc::new(MockBackend::with_device(mock_device("1-1")));
        let server = UsbIpServer::bind(test_config(dir.path()), backend)
            .await
            .unwrap();

        let addrs = server.local_addrs();
        assert_eq!(addrs.len(), 1);
        assert_ne!(addrs[0].port(), 0);
    }

    #[tokio::test]
    async fn test_status_reflects_registry() {
        let dir = tempdir().unwrap();
        let backend = Arc::new(MockBackend::with_device(mock_device("1-1")));
        let server = UsbIpServer::bind(test_config(dir.path()), backend)
            .await
            .unwrap();

        let status = server.status().await;
        assert_eq!(status.devices, 1);
        assert_eq!(status.exported, 0);
        assert_eq!(status.sessions, 0);
        assert_eq!(status.urbs_in_flight, 0);
    }

    #[tokio::test]
    async fn test_bind_device_via_library_api() {
        let dir = tempdir().unwrap();
        let backend = Arc::new(MockBackend::with_device(mock_device("1-1")));
        let server = UsbIpServer::bind(test_config(dir.path()), backend)
            .await
            .unwrap();

        let bus_id = BusId::new("1-1").unwrap();
        server.bind_device(&bus_id).await.unwrap();
        let listed = server.list_devices().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].1, DeviceState::Bound);

        server.unbind_device(&bus_id).await.unwrap();
        assert_eq!(
            server.list_devices().await[0].1,
            DeviceState::Available
        );
    }
}
