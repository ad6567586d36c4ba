use std::{net::IpAddr, sync::Arc, time::Duration};

use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

use lumi_common::{Device, DeviceStatus, StateFrame, SyncConfig};

use crate::{epoch_ms, store::AppStore};

/// The in-memory list of known controllers. Liveness is always derived from
/// `lastSeen` against the offline threshold; nothing writes `status`
/// directly except the recompute pass.
#[derive(Clone)]
pub struct DeviceRegistry {
    inner: Arc<Mutex<Vec<Device>>>,
    store: AppStore,
    config: SyncConfig,
    changes: watch::Sender<Vec<Device>>,
}

impl DeviceRegistry {
    pub fn new(store: AppStore, config: SyncConfig) -> Self {
        let (changes, _) = watch::channel(Vec::new());
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
            store,
            config,
            changes,
        }
    }

    /// Seed the registry from the persisted device list. Entries come back
    /// with whatever status they were saved with; the first liveness pass
    /// corrects them.
    pub async fn load(&self) -> anyhow::Result<()> {
        let devices = self.store.load_devices().await?;
        let mut inner = self.inner.lock().await;
        *inner = devices;
        self.publish(&inner);
        Ok(())
    }

    pub async fn list(&self) -> Vec<Device> {
        self.inner.lock().await.clone()
    }

    /// Watch the ordered device list. The receiver sees the list exactly as
    /// `list()` would return it at that moment.
    pub fn subscribe(&self) -> watch::Receiver<Vec<Device>> {
        self.changes.subscribe()
    }

    /// Record a sighting of `ip`, creating the entry when it is new.
    /// Returns true when the device was not known before.
    pub async fn upsert(
        &self,
        ip: IpAddr,
        name: Option<&str>,
        location: Option<&str>,
        now_ms: u64,
    ) -> bool {
        let mut inner = self.inner.lock().await;
        let inserted = match inner.iter_mut().find(|d| d.ip == ip) {
            Some(device) => {
                if let Some(name) = name {
                    device.name = name.to_string();
                }
                if let Some(location) = location {
                    device.location = location.to_string();
                }
                device.last_seen_ms = now_ms;
                device.status = DeviceStatus::Online;
                false
            }
            None => {
                inner.push(Device {
                    ip,
                    name: name.unwrap_or("ESP32-Device").to_string(),
                    location: location.unwrap_or_default().to_string(),
                    status: DeviceStatus::Online,
                    last_seen_ms: now_ms,
                });
                true
            }
        };
        self.publish(&inner);
        inserted
    }

    /// Refresh `lastSeen` for an already-known device. Sightings of unknown
    /// addresses are ignored; keepalives alone carry no identity.
    pub async fn mark_seen(&self, ip: IpAddr, now_ms: u64) {
        let mut inner = self.inner.lock().await;
        if let Some(device) = inner.iter_mut().find(|d| d.ip == ip) {
            device.last_seen_ms = now_ms;
            device.status = DeviceStatus::Online;
            self.publish(&inner);
        } else {
            debug!(%ip, "sighting of unknown device ignored");
        }
    }

    /// Fold a broadcast state frame into the registry: identity fields and
    /// the sighting timestamp only. Relay and PWM belong to the per-device
    /// session, not the registry.
    pub async fn apply_state_frame(&self, frame: &StateFrame, source: IpAddr, now_ms: u64) {
        let ip = frame.ip.unwrap_or(source);
        self.upsert(
            ip,
            frame.device_name.as_deref(),
            frame.device_location.as_deref(),
            now_ms,
        )
        .await;
    }

    pub async fn remove(&self, ip: IpAddr) -> anyhow::Result<bool> {
        let mut inner = self.inner.lock().await;
        let before = inner.len();
        inner.retain(|d| d.ip != ip);
        let removed = inner.len() != before;
        if removed {
            self.store.save_devices(&inner).await?;
            self.publish(&inner);
        }
        Ok(removed)
    }

    pub async fn persist(&self) -> anyhow::Result<()> {
        let inner = self.inner.lock().await;
        self.store.save_devices(&inner).await
    }

    /// Re-derive every status from its age and move offline devices after
    /// the online ones. The sort is stable, so relative order within each
    /// group is preserved.
    pub async fn recompute_liveness(&self, now_ms: u64) {
        let mut inner = self.inner.lock().await;
        for device in inner.iter_mut() {
            device.status =
                DeviceStatus::from_age_ms(device.age_ms(now_ms), self.config.offline_after_ms);
        }
        inner.sort_by_key(|d| d.status == DeviceStatus::Offline);
        self.publish(&inner);
    }

    /// Periodic liveness pass, one tick per `liveness_tick_ms`.
    pub fn spawn_liveness_task(&self) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        let tick = Duration::from_millis(registry.config.liveness_tick_ms);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                registry.recompute_liveness(epoch_ms()).await;
                if let Err(err) = registry.persist().await {
                    warn!(error = %err, "failed to persist device list");
                }
            }
        })
    }

    fn publish(&self, inner: &[Device]) {
        let _ = self.changes.send(inner.to_vec());
    }
}
