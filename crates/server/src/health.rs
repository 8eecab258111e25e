//! Backend and URB-table health monitoring
//!
//! Periodically probes the backend with a cheap enumerate and checks the
//! URB table against its ceiling. Three consecutive failed probes escalate
//! to the supervisor via a broadcast event; the monitor itself never
//! restarts anything (restart policy belongs to the enclosing process).

use crate::engine::TransferEngine;
use crate::network::session::SessionTable;
use common::{CancelToken, UsbBackend};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Consecutive probe failures before an escalation event fires
pub const ESCALATION_THRESHOLD: u32 = 3;

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub probe_interval: Duration,
    pub urb_table_ceiling: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(30),
            urb_table_ceiling: 4096,
        }
    }
}

/// Escalation event delivered to the supervisor
#[derive(Debug, Clone)]
pub struct HealthAlert {
    pub consecutive_failures: u32,
    pub reason: String,
    pub sessions: usize,
    pub urbs_in_flight: usize,
}

/// Periodic health prober
pub struct HealthMonitor<B: UsbBackend> {
    backend: Arc<B>,
    engine: Arc<TransferEngine<B>>,
    sessions: Arc<SessionTable>,
    config: HealthConfig,
    // Advisory events: a slow subscriber loses the oldest, never blocks us.
    events: broadcast::Sender<HealthAlert>,
}

impl<B: UsbBackend> HealthMonitor<B> {
    pub fn new(
        backend: Arc<B>,
        engine: Arc<TransferEngine<B>>,
        sessions: Arc<SessionTable>,
        config: HealthConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            backend,
            engine,
            sessions,
            config,
            events,
        }
    }

    /// Subscribe to escalation events
    pub fn subscribe(&self) -> broadcast::Receiver<HealthAlert> {
        self.events.subscribe()
    }

    /// Probe until the token fires
    pub async fn run(self, mut shutdown: CancelToken) {
        let mut interval = tokio::time::interval(self.config.probe_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut consecutive = 0u32;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            match self.probe().await {
                Ok(()) => {
                    if consecutive > 0 {
                        info!("Health probe recovered after {} failure(s)", consecutive);
                    }
                    consecutive = 0;
                }
                Err(reason) => {
                    consecutive += 1;
                    warn!("Health probe failed ({} consecutive): {}", consecutive, reason);

                    if consecutive % ESCALATION_THRESHOLD == 0 {
                        let alert = HealthAlert {
                            consecutive_failures: consecutive,
                            reason,
                            sessions: self.sessions.active(),
                            urbs_in_flight: self.engine.in_flight(),
                        };
                        error!(
                            "Health escalation: {} ({} session(s), {} URB(s) in flight)",
                            alert.reason, alert.sessions, alert.urbs_in_flight
                        );
                        let _ = self.events.send(alert);
                    }
                }
            }
        }
        debug!("Health monitor stopped");
    }

    async fn probe(&self) -> Result<(), String> {
        self.backend
            .enumerate()
            .await
            .map_err(|e| format!("backend enumerate failed: {e}"))?;

        let urbs = self.engine.in_flight();
        if urbs > self.config.urb_table_ceiling {
            return Err(format!(
                "URB table size {} exceeds ceiling {}",
                urbs, self.config.urb_table_ceiling
            ));
        }

        Ok(())
    }
}
