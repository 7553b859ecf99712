//! The authoritative view of known devices, fed by discovery ingest and the
//! liveness sweeps, queried by the external API.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};

use discovery::{DeviceCategory, ServiceKind, Transport};

/// Capacity of each subscriber's event buffer. A lagging subscriber loses the
/// oldest events and is told to resync.
const EVENT_BUFFER: usize = 64;

/// Liveness as seen by the gateway's probe sweeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceStatus {
    Unknown,
    Offline,
    Online,
    Error,
}

/// One known device, keyed by its FQDN.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceEntry {
    /// Stable key: the service FQDN.
    pub id: String,
    pub device_name: String,
    pub category: DeviceCategory,
    pub kind: ServiceKind,
    pub transport: Transport,
    pub port: u16,
    pub addresses: Vec<Ipv4Addr>,
    pub properties: HashMap<String, String>,
    pub status: DeviceStatus,
    /// Instant of last ingest plus the advertised TTL.
    #[serde(with = "chrono::serde::ts_seconds")]
    pub expires_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_seconds_option")]
    pub last_health_ok_at: Option<DateTime<Utc>>,
}

impl DeviceEntry {
    /// Field equality that ignores bookkeeping (`expires_at`,
    /// `last_health_ok_at`). A pure TTL refresh is not an observable change.
    fn observably_equal(&self, other: &DeviceEntry) -> bool {
        self.id == other.id
            && self.device_name == other.device_name
            && self.category == other.category
            && self.kind == other.kind
            && self.transport == other.transport
            && self.port == other.port
            && self.addresses == other.addresses
            && self.properties == other.properties
            && self.status == other.status
    }
}

/// Registry change notifications. Every variant carries the full entry
/// snapshot at emission time.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Added(DeviceEntry),
    Changed(DeviceEntry),
    Removed(DeviceEntry),
    /// Emitted to a subscriber that fell behind: re-list instead of replaying.
    Resync,
}

/// Thread-safe device registry with change fan-out.
pub struct DeviceRegistry {
    entries: RwLock<HashMap<String, DeviceEntry>>,
    event_tx: broadcast::Sender<RegistryEvent>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            entries: RwLock::new(HashMap::new()),
            event_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_tx.subscribe()
    }

    pub async fn get(&self, id: &str) -> Option<DeviceEntry> {
        self.entries.read().await.get(id).cloned()
    }

    /// All entries matching the filters, ordered by id.
    pub async fn list(&self, kind: Option<ServiceKind>, name: Option<&str>) -> Vec<DeviceEntry> {
        let needle = name.map(str::to_lowercase);
        let mut matched: Vec<DeviceEntry> = self
            .entries
            .read()
            .await
            .values()
            .filter(|entry| kind.map_or(true, |kind| entry.kind == kind))
            .filter(|entry| {
                needle
                    .as_deref()
                    .map_or(true, |needle| entry.device_name.to_lowercase().contains(needle))
            })
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.id.cmp(&b.id));
        matched
    }

    /// Inserts or merges an ingested entry.
    ///
    /// Announcement fields follow the last writer; probe bookkeeping
    /// (`status`, `last_health_ok_at`) is preserved, and `expires_at` only
    /// ever advances. Fires `DeviceAdded` for new ids, `DeviceChanged` when
    /// an observable field moved.
    pub async fn upsert(&self, mut incoming: DeviceEntry) {
        let event = {
            let mut entries = self.entries.write().await;
            match entries.get(&incoming.id) {
                None => {
                    incoming.status = DeviceStatus::Unknown;
                    incoming.last_health_ok_at = None;
                    info!("Discovered device {}", incoming.id);
                    entries.insert(incoming.id.clone(), incoming.clone());
                    Some(RegistryEvent::Added(incoming))
                }
                Some(existing) => {
                    incoming.status = existing.status;
                    incoming.last_health_ok_at = existing.last_health_ok_at;
                    incoming.expires_at = incoming.expires_at.max(existing.expires_at);
                    let changed = !existing.observably_equal(&incoming);
                    entries.insert(incoming.id.clone(), incoming.clone());
                    if changed {
                        debug!("Device {} changed", incoming.id);
                        Some(RegistryEvent::Changed(incoming))
                    } else {
                        None
                    }
                }
            }
        };
        if let Some(event) = event {
            let _ = self.event_tx.send(event);
        }
    }

    /// Removes an entry (goodbye or TTL expiry) and fires `DeviceRemoved`.
    pub async fn remove(&self, id: &str) -> Option<DeviceEntry> {
        let removed = self.entries.write().await.remove(id);
        if let Some(entry) = &removed {
            info!("Removed device {}", id);
            let _ = self.event_tx.send(RegistryEvent::Removed(entry.clone()));
        }
        removed
    }

    /// Applies one probe result. Status strictly follows the most recent
    /// probe; a transition fires `DeviceChanged`.
    pub async fn record_probe(&self, id: &str, online: bool, now: DateTime<Utc>) {
        let event = {
            let mut entries = self.entries.write().await;
            let Some(entry) = entries.get_mut(id) else {
                return;
            };
            let next = if online {
                DeviceStatus::Online
            } else {
                DeviceStatus::Offline
            };
            if online {
                entry.last_health_ok_at = Some(now);
            }
            if entry.status == next {
                None
            } else {
                entry.status = next;
                debug!("Device {} is now {:?}", id, next);
                Some(RegistryEvent::Changed(entry.clone()))
            }
        };
        if let Some(event) = event {
            let _ = self.event_tx.send(event);
        }
    }

    /// Removes every entry whose `expires_at` has passed, firing
    /// `DeviceRemoved` for each. Returns the removed entries.
    pub async fn expire_before(&self, now: DateTime<Utc>) -> Vec<DeviceEntry> {
        let expired = {
            let mut entries = self.entries.write().await;
            let ids: Vec<String> = entries
                .values()
                .filter(|entry| entry.expires_at < now)
                .map(|entry| entry.id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| entries.remove(&id))
                .collect::<Vec<_>>()
        };
        for entry in &expired {
            info!("Device {} expired", entry.id);
            let _ = self.event_tx.send(RegistryEvent::Removed(entry.clone()));
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn entry(id: &str, name: &str, kind: ServiceKind) -> DeviceEntry {
        DeviceEntry {
            id: id.to_string(),
            device_name: name.to_string(),
            category: DeviceCategory::LightLamp,
            kind,
            transport: Transport::Tcp,
            port: 4040,
            addresses: vec![Ipv4Addr::new(192, 168, 1, 20)],
            properties: HashMap::new(),
            status: DeviceStatus::Unknown,
            expires_at: Utc::now() + ChronoDuration::seconds(60),
            last_health_ok_at: None,
        }
    }

    #[tokio::test]
    async fn first_ingest_fires_added() {
        let registry = DeviceRegistry::new();
        let mut events = registry.subscribe();

        registry
            .upsert(entry("Lamp._lightlamp._tcp.local.", "Lamp", ServiceKind::Actuator))
            .await;

        match events.recv().await.unwrap() {
            RegistryEvent::Added(added) => {
                assert_eq!(added.id, "Lamp._lightlamp._tcp.local.");
                assert_eq!(added.status, DeviceStatus::Unknown);
            }
            other => panic!("expected Added, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unchanged_reingest_only_advances_expiry() {
        let registry = DeviceRegistry::new();
        let first = entry("Lamp._lightlamp._tcp.local.", "Lamp", ServiceKind::Actuator);
        registry.upsert(first.clone()).await;

        let mut events = registry.subscribe();
        let mut renewal = first.clone();
        renewal.expires_at = first.expires_at + ChronoDuration::seconds(30);
        registry.upsert(renewal.clone()).await;

        // No Changed event for a pure TTL refresh.
        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
        let stored = registry.get(&first.id).await.unwrap();
        assert_eq!(stored.expires_at, renewal.expires_at);
    }

    #[tokio::test]
    async fn expiry_never_moves_backwards() {
        let registry = DeviceRegistry::new();
        let first = entry("Lamp._lightlamp._tcp.local.", "Lamp", ServiceKind::Actuator);
        registry.upsert(first.clone()).await;

        let mut stale = first.clone();
        stale.expires_at = first.expires_at - ChronoDuration::seconds(30);
        registry.upsert(stale).await;

        let stored = registry.get(&first.id).await.unwrap();
        assert_eq!(stored.expires_at, first.expires_at);
    }

    #[tokio::test]
    async fn property_change_fires_changed() {
        let registry = DeviceRegistry::new();
        let first = entry("Lamp._lightlamp._tcp.local.", "Lamp", ServiceKind::Actuator);
        registry.upsert(first.clone()).await;

        let mut events = registry.subscribe();
        let mut updated = first.clone();
        updated
            .properties
            .insert("is_on".to_string(), "true".to_string());
        registry.upsert(updated).await;

        match events.recv().await.unwrap() {
            RegistryEvent::Changed(changed) => {
                assert_eq!(
                    changed.properties.get("is_on").map(String::as_str),
                    Some("true")
                );
            }
            other => panic!("expected Changed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn probe_results_drive_the_status_machine() {
        let registry = DeviceRegistry::new();
        let first = entry("Lamp._lightlamp._tcp.local.", "Lamp", ServiceKind::Actuator);
        registry.upsert(first.clone()).await;

        registry.record_probe(&first.id, true, Utc::now()).await;
        let stored = registry.get(&first.id).await.unwrap();
        assert_eq!(stored.status, DeviceStatus::Online);
        assert!(stored.last_health_ok_at.is_some());

        registry.record_probe(&first.id, false, Utc::now()).await;
        assert_eq!(
            registry.get(&first.id).await.unwrap().status,
            DeviceStatus::Offline
        );

        registry.record_probe(&first.id, true, Utc::now()).await;
        assert_eq!(
            registry.get(&first.id).await.unwrap().status,
            DeviceStatus::Online
        );
    }

    #[tokio::test]
    async fn repeated_probe_results_fire_no_events() {
        let registry = DeviceRegistry::new();
        let first = entry("Lamp._lightlamp._tcp.local.", "Lamp", ServiceKind::Actuator);
        registry.upsert(first.clone()).await;
        registry.record_probe(&first.id, true, Utc::now()).await;

        let mut events = registry.subscribe();
        registry.record_probe(&first.id, true, Utc::now()).await;
        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn expiry_sweep_removes_stale_entries() {
        let registry = DeviceRegistry::new();
        let mut stale = entry("Lamp._lightlamp._tcp.local.", "Lamp", ServiceKind::Actuator);
        stale.expires_at = Utc::now() - ChronoDuration::seconds(5);
        registry.upsert(stale).await;
        registry
            .upsert(entry("Sink._sink._tcp.local.", "Sink", ServiceKind::Actuator))
            .await;

        let mut events = registry.subscribe();
        let removed = registry.expire_before(Utc::now()).await;
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, "Lamp._lightlamp._tcp.local.");
        assert!(matches!(
            events.recv().await.unwrap(),
            RegistryEvent::Removed(_)
        ));
        assert_eq!(registry.list(None, None).await.len(), 1);
    }

    #[tokio::test]
    async fn list_filters_by_kind_and_name() {
        let registry = DeviceRegistry::new();
        registry
            .upsert(entry("B._lightlamp._tcp.local.", "Bedroom Lamp", ServiceKind::Actuator))
            .await;
        registry
            .upsert(entry("A._lightlamp._tcp.local.", "Attic Lamp", ServiceKind::Actuator))
            .await;
        registry
            .upsert(entry("L._waterleak._tcp.local.", "Leak Sensor", ServiceKind::Sensor))
            .await;

        let all = registry.list(None, None).await;
        let ids: Vec<&str> = all.iter().map(|entry| entry.id.as_str()).collect();
        // Stable order by id.
        assert_eq!(
            ids,
            [
                "A._lightlamp._tcp.local.",
                "B._lightlamp._tcp.local.",
                "L._waterleak._tcp.local."
            ]
        );

        let actuators = registry.list(Some(ServiceKind::Actuator), None).await;
        assert_eq!(actuators.len(), 2);

        let lamps = registry.list(None, Some("LAMP")).await;
        assert_eq!(lamps.len(), 2);

        let attic = registry.list(Some(ServiceKind::Actuator), Some("attic")).await;
        assert_eq!(attic.len(), 1);
        assert_eq!(attic[0].device_name, "Attic Lamp");
    }
}
