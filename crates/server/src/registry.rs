//! Device registry
//!
//! The authoritative view of locally visible USB devices and their export
//! state. Readers (devlist replies, import lookups) far outnumber writers
//! (bind/unbind/hotplug), so the whole registry sits behind one
//! read-write lock. Export transitions happen under the write lock, which
//! is what makes two racing imports resolve to exactly one winner.

use crate::persist::{BindRecord, PersistHandle};
use common::{DeviceError, HostDevice, HotplugEvent, Result};
use protocol::BusId;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Identifier of one TCP session, assigned at accept time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Export state of a live device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Present, not marked exportable
    Available,
    /// Present and marked exportable by the operator
    Bound,
    /// Owned by a client session
    Exported(SessionId),
    /// Physically gone; terminal for this attachment
    Detached,
}

struct DeviceEntry {
    device: HostDevice,
    state: DeviceState,
}

#[derive(Default)]
struct Inner {
    devices: HashMap<BusId, DeviceEntry>,
    binds: HashMap<BusId, BindRecord>,
}

/// Live device set plus the persistent bind set
pub struct DeviceRegistry {
    inner: RwLock<Inner>,
    persist: PersistHandle,
}

impl DeviceRegistry {
    pub fn new(persist: PersistHandle) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            persist,
        }
    }

    /// Initial load: seed the live set from enumeration and intersect it
    /// with the persisted bind set. Persisted binds for absent devices are
    /// kept (the device may reappear) but produce no live entry.
    pub async fn reconcile(&self, devices: Vec<HostDevice>, persisted: Vec<BindRecord>) {
        let mut inner = self.inner.write().await;
        inner.binds = persisted
            .into_iter()
            .map(|r| (r.bus_id.clone(), r))
            .collect();

        for device in devices {
            let state = if inner.binds.contains_key(&device.bus_id) {
                DeviceState::Bound
            } else {
                DeviceState::Available
            };
            debug!("Registered device {} as {:?}", device.bus_id, state);
            inner
                .devices
                .insert(device.bus_id.clone(), DeviceEntry { device, state });
        }

        let bound = inner
            .devices
            .values()
            .filter(|e| e.state == DeviceState::Bound)
            .count();
        info!(
            "Registry reconciled: {} device(s) live, {} bound, {} persisted bind(s)",
            inner.devices.len(),
            bound,
            inner.binds.len()
        );
    }

    /// Snapshot of all known devices with their state, detached records
    /// included
    pub async fn list(&self) -> Vec<(HostDevice, DeviceState)> {
        let inner = self.inner.read().await;
        inner
            .devices
            .values()
            .map(|e| (e.device.clone(), e.state))
            .collect()
    }

    /// Devices eligible for OP_REP_DEVLIST: a matching bind record AND
    /// present in live enumeration
    pub async fn exportable(&self) -> Vec<HostDevice> {
        let inner = self.inner.read().await;
        inner
            .devices
            .values()
            .filter(|e| matches!(e.state, DeviceState::Bound | DeviceState::Exported(_)))
            .map(|e| e.device.clone())
            .collect()
    }

    /// Look up one device; a detached record reports `Detached`
    pub async fn get(&self, bus_id: &BusId) -> Option<(HostDevice, DeviceState)> {
        let inner = self.inner.read().await;
        inner
            .devices
            .get(bus_id)
            .map(|e| (e.device.clone(), e.state))
    }

    /// Mark a device exportable and persist the bind.
    ///
    /// On persistence failure the in-memory bind still takes effect for
    /// this process; the error is returned so the caller can report the
    /// partial failure.
    pub async fn bind(&self, bus_id: &BusId) -> Result<()> {
        let records = {
            let mut inner = self.inner.write().await;
            let entry = inner
                .devices
                .get_mut(bus_id)
                .ok_or(DeviceError::NotFound)?;
            match entry.state {
                DeviceState::Available => entry.state = DeviceState::Bound,
                DeviceState::Bound | DeviceState::Exported(_) => {
                    debug!("Device {} already bound", bus_id);
                }
                DeviceState::Detached => return Err(DeviceError::Detached.into()),
            }
            let record = BindRecord {
                bus_id: bus_id.clone(),
                vendor_id: entry.device.vendor_id,
                product_id: entry.device.product_id,
            };
            inner.binds.insert(bus_id.clone(), record);
            inner.binds.values().cloned().collect::<Vec<_>>()
        };

        info!("Bound device {}", bus_id);
        self.persist.write(records).await
    }

    /// Remove a device from the persistent set. Returns the session that
    /// currently exports it, if any, so the caller can force-close it.
    pub async fn unbind(&self, bus_id: &BusId) -> Result<Option<SessionId>> {
        let (exported, records) = {
            let mut inner = self.inner.write().await;
            if inner.binds.remove(bus_id).is_none() {
                return Err(DeviceError::NotBound.into());
            }

            let mut exported = None;
            if let Some(entry) = inner.devices.get_mut(bus_id) {
                match entry.state {
                    DeviceState::Exported(session) => {
                        // The session teardown will drop it back; it lands
                        // on Available because the bind record is gone.
                        exported = Some(session);
                    }
                    DeviceState::Bound => entry.state = DeviceState::Available,
                    DeviceState::Available | DeviceState::Detached => {}
                }
            }
            (exported, inner.binds.values().cloned().collect::<Vec<_>>())
        };

        info!("Unbound device {}", bus_id);
        self.persist.write(records).await?;
        Ok(exported)
    }

    /// Atomically transition `Bound -> Exported(session)`.
    ///
    /// Exactly one of two racing imports can succeed; the loser sees
    /// `AlreadyExported`.
    pub async fn begin_export(
        &self,
        bus_id: &BusId,
        session: SessionId,
    ) -> std::result::Result<HostDevice, DeviceError> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .devices
            .get_mut(bus_id)
            .ok_or(DeviceError::NotFound)?;
        match entry.state {
            DeviceState::Bound => {
                entry.state = DeviceState::Exported(session);
                info!("Device {} exported to {}", bus_id, session);
                Ok(entry.device.clone())
            }
            DeviceState::Available => Err(DeviceError::NotBound),
            DeviceState::Exported(_) => Err(DeviceError::AlreadyExported),
            DeviceState::Detached => Err(DeviceError::Detached),
        }
    }

    /// Release whatever device `session` exports. Called on session
    /// teardown and on import rollback; a session that exports nothing is
    /// a no-op.
    pub async fn end_export(&self, session: SessionId) -> Option<BusId> {
        let mut inner = self.inner.write().await;
        let bus_id = inner.devices.iter().find_map(|(bus_id, entry)| {
            (entry.state == DeviceState::Exported(session)).then(|| bus_id.clone())
        })?;

        let bound = inner.binds.contains_key(&bus_id);
        if let Some(entry) = inner.devices.get_mut(&bus_id) {
            entry.state = if bound {
                DeviceState::Bound
            } else {
                DeviceState::Available
            };
            info!("Device {} released by {}", bus_id, session);
        }
        Some(bus_id)
    }

    /// Apply a hotplug event. A removal forces the entry to `Detached` —
    /// terminal for that physical attachment, and kept in the registry so
    /// lookups and listings observe it — retains the bind record, and
    /// returns the exporting session (if any) for teardown. A later
    /// reattachment replaces the detached record.
    pub async fn apply_hotplug(&self, event: HotplugEvent) -> Option<SessionId> {
        match event {
            HotplugEvent::Added(device) => {
                let mut inner = self.inner.write().await;
                let state = match inner.devices.get(&device.bus_id) {
                    // Spurious re-announce of a device a session owns;
                    // refresh the descriptor data but keep the owner.
                    Some(entry) if matches!(entry.state, DeviceState::Exported(_)) => entry.state,
                    _ => {
                        if inner.binds.contains_key(&device.bus_id) {
                            DeviceState::Bound
                        } else {
                            DeviceState::Available
                        }
                    }
                };
                info!("Device {} arrived ({:?})", device.bus_id, state);
                inner
                    .devices
                    .insert(device.bus_id.clone(), DeviceEntry { device, state });
                None
            }
            HotplugEvent::Removed(bus_id) => {
                let mut inner = self.inner.write().await;
                let Some(entry) = inner.devices.get_mut(&bus_id) else {
                    warn!("Removal event for unknown device {}", bus_id);
                    return None;
                };
                let exported = match entry.state {
                    DeviceState::Exported(session) => Some(session),
                    _ => None,
                };
                entry.state = DeviceState::Detached;
                info!(
                    "Device {} detached{}",
                    bus_id,
                    exported.map_or(String::new(), |s| format!(" (was exported to {s})"))
                );
                exported
            }
        }
    }

    /// Counts for status reporting: (live, exported). Detached records are
    /// not live.
    pub async fn counts(&self) -> (usize, usize) {
        let inner = self.inner.read().await;
        let mut live = 0;
        let mut exported = 0;
        for entry in inner.devices.values() {
            match entry.state {
                DeviceState::Detached => {}
                DeviceState::Exported(_) => {
                    live += 1;
                    exported += 1;
                }
                DeviceState::Available | DeviceState::Bound => live += 1,
            }
        }
        (live, exported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::spawn_persist_task;
    use common::Error;
    use common::test_utils::mock_device;
    use tempfile::tempdir;

    async fn registry_with(devices: Vec<HostDevice>, persisted: Vec<BindRecord>) -> DeviceRegistry {
        let dir = tempdir().unwrap();
        let persist = spawn_persist_task(dir.path().join("bindings"));
        // Leak the tempdir so the path stays writable for the test's life.
        std::mem::forget(dir);
        let registry = DeviceRegistry::new(persist);
        registry.reconcile(devices, persisted).await;
        registry
    }

    fn bus(s: &str) -> BusId {
        BusId::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_reconcile_intersects_binds() {
        let persisted = vec![
            BindRecord {
                bus_id: bus("1-1"),
                vendor_id: 0x1d6b,
                product_id: 0x0002,
            },
            BindRecord {
                bus_id: bus("9-9"),
                vendor_id: 0xffff,
                product_id: 0xffff,
            },
        ];
        let registry = registry_with(vec![mock_device("1-1"), mock_device("1-2")], persisted).await;

        // 1-1 is bound, 1-2 available, 9-9 absent but still persisted
        assert_eq!(
            registry.get(&bus("1-1")).await.unwrap().1,
            DeviceState::Bound
        );
        assert_eq!(
            registry.get(&bus("1-2")).await.unwrap().1,
            DeviceState::Available
        );
        assert!(registry.get(&bus("9-9")).await.is_none());

        let exportable = registry.exportable().await;
        assert_eq!(exportable.len(), 1);
        assert_eq!(exportable[0].bus_id, bus("1-1"));
    }

    #[tokio::test]
    async fn test_bind_and_unbind() {
        let registry = registry_with(vec![mock_device("1-1")], vec![]).await;

        assert!(registry.exportable().await.is_empty());
        registry.bind(&bus("1-1")).await.unwrap();
        assert_eq!(registry.exportable().await.len(), 1);

        let exported = registry.unbind(&bus("1-1")).await.unwrap();
        assert!(exported.is_none());
        assert!(registry.exportable().await.is_empty());
    }

    #[tokio::test]
    async fn test_bind_unknown_device() {
        let registry = registry_with(vec![], vec![]).await;
        let result = registry.bind(&bus("1-1")).await;
        assert!(matches!(
            result,
            Err(Error::Device(DeviceError::NotFound))
        ));
    }

    #[tokio::test]
    async fn test_export_requires_bind() {
        let registry = registry_with(vec![mock_device("1-1")], vec![]).await;
        let result = registry.begin_export(&bus("1-1"), SessionId(1)).await;
        assert_eq!(result.unwrap_err(), DeviceError::NotBound);
    }

    #[tokio::test]
    async fn test_export_exclusivity() {
        let registry = registry_with(vec![mock_device("1-1")], vec![]).await;
        registry.bind(&bus("1-1")).await.unwrap();

        registry
            .begin_export(&bus("1-1"), SessionId(1))
            .await
            .unwrap();
        let second = registry.begin_export(&bus("1-1"), SessionId(2)).await;
        assert_eq!(second.unwrap_err(), DeviceError::AlreadyExported);

        // Release by the owner makes it importable again
        assert_eq!(registry.end_export(SessionId(1)).await, Some(bus("1-1")));
        assert!(registry.begin_export(&bus("1-1"), SessionId(2)).await.is_ok());
    }

    #[tokio::test]
    async fn test_end_export_without_export_is_noop() {
        let registry = registry_with(vec![mock_device("1-1")], vec![]).await;
        assert_eq!(registry.end_export(SessionId(7)).await, None);
    }

    #[tokio::test]
    async fn test_unbind_reports_exporting_session() {
        let registry = registry_with(vec![mock_device("1-1")], vec![]).await;
        registry.bind(&bus("1-1")).await.unwrap();
        registry
            .begin_export(&bus("1-1"), SessionId(3))
            .await
            .unwrap();

        let exported = registry.unbind(&bus("1-1")).await.unwrap();
        assert_eq!(exported, Some(SessionId(3)));

        // After the forced teardown runs end_export, the device is merely
        // available (the bind record is gone).
        registry.end_export(SessionId(3)).await;
        assert_eq!(
            registry.get(&bus("1-1")).await.unwrap().1,
            DeviceState::Available
        );
    }

    #[tokio::test]
    async fn test_hotplug_removal_reports_exporter_and_keeps_bind() {
        let registry = registry_with(vec![mock_device("1-1")], vec![]).await;
        registry.bind(&bus("1-1")).await.unwrap();
        registry
            .begin_export(&bus("1-1"), SessionId(5))
            .await
            .unwrap();

        let victim = registry
            .apply_hotplug(HotplugEvent::Removed(bus("1-1")))
            .await;
        assert_eq!(victim, Some(SessionId(5)));

        // The record stays observable in its terminal state but is
        // neither exportable nor importable nor counted as live.
        assert_eq!(
            registry.get(&bus("1-1")).await.unwrap().1,
            DeviceState::Detached
        );
        assert!(registry.exportable().await.is_empty());
        assert_eq!(
            registry
                .begin_export(&bus("1-1"), SessionId(6))
                .await
                .unwrap_err(),
            DeviceError::Detached
        );
        assert!(matches!(
            registry.bind(&bus("1-1")).await,
            Err(Error::Device(DeviceError::Detached))
        ));
        assert_eq!(registry.counts().await, (0, 0));

        // The exporter's teardown must not resurrect a detached device.
        assert_eq!(registry.end_export(SessionId(5)).await, None);
        assert_eq!(
            registry.get(&bus("1-1")).await.unwrap().1,
            DeviceState::Detached
        );

        // Reattachment replaces the detached record and restores the
        // bound state from the retained bind.
        let added = registry
            .apply_hotplug(HotplugEvent::Added(mock_device("1-1")))
            .await;
        assert!(added.is_none());
        assert_eq!(
            registry.get(&bus("1-1")).await.unwrap().1,
            DeviceState::Bound
        );
        assert_eq!(registry.counts().await, (1, 0));
    }
}
