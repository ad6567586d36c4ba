use std::{
    collections::HashSet,
    net::IpAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::sync::{broadcast::error::RecvError, watch};
use tracing::{info, warn};

use lumi_common::{Frame, SyncConfig};

use crate::{discovery::DiscoveryListener, registry::DeviceRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Scanning,
}

/// Drives the time-boxed scan window: devices announce themselves, the scan
/// just watches the discovery feed for frames that carry a full identity and
/// persists newcomers as they appear.
pub struct ScanOrchestrator {
    registry: DeviceRegistry,
    listener: Arc<DiscoveryListener>,
    config: SyncConfig,
    scanning: Arc<AtomicBool>,
    status: watch::Sender<Option<String>>,
}

impl ScanOrchestrator {
    pub fn new(
        registry: DeviceRegistry,
        listener: Arc<DiscoveryListener>,
        config: SyncConfig,
    ) -> Self {
        let (status, _) = watch::channel(None);
        Self {
            registry,
            listener,
            config,
            scanning: Arc::new(AtomicBool::new(false)),
            status,
        }
    }

    pub fn state(&self) -> ScanState {
        if self.scanning.load(Ordering::SeqCst) {
            ScanState::Scanning
        } else {
            ScanState::Idle
        }
    }

    /// Human-readable outcome of the last scan. Set when a window closes,
    /// cleared again a few seconds later.
    pub fn subscribe_status(&self) -> watch::Receiver<Option<String>> {
        self.status.subscribe()
    }

    /// Kick off a scan window in the background. A scan already in flight
    /// wins; the call is a no-op.
    pub fn start_scan(self: &Arc<Self>) {
        if self.scanning.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.scan_once().await;
            this.scanning.store(false, Ordering::SeqCst);
        });
    }

    /// One full scan window, inline. The caller owns the scanning flag.
    async fn scan_once(&self) {
        if let Err(err) = self.listener.start().await {
            warn!(error = %err, "scan aborted, discovery listener unavailable");
            let _ = self.status.send(Some("Scan failed: network unavailable".to_string()));
            self.schedule_status_clear();
            return;
        }

        let known: HashSet<IpAddr> = self
            .registry
            .list()
            .await
            .into_iter()
            .map(|d| d.ip)
            .collect();
        let mut found: HashSet<IpAddr> = HashSet::new();
        let mut events = self.listener.subscribe();

        info!(window_ms = self.config.scan_window_ms, "scan started");
        let deadline = tokio::time::sleep(Duration::from_millis(self.config.scan_window_ms));
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => break,
                event = events.recv() => {
                    let event = match event {
                        Ok(event) => event,
                        Err(RecvError::Lagged(_)) => continue,
                        Err(RecvError::Closed) => break,
                    };
                    let Frame::State(state) = &event.frame else { continue };
                    if !state.has_identity() {
                        continue;
                    }
                    let ip = state.ip.unwrap_or(event.source);
                    if known.contains(&ip) || !found.insert(ip) {
                        continue;
                    }
                    // The listener already upserted the entry; make it
                    // durable right away rather than at window close.
                    if let Err(err) = self.registry.persist().await {
                        warn!(error = %err, "failed to persist discovered device");
                    }
                }
            }
        }

        let message = match found.len() {
            0 => "Scan complete: no new devices".to_string(),
            1 => "Scan complete: found 1 new device".to_string(),
            n => format!("Scan complete: found {n} new devices"),
        };
        info!(new_devices = found.len(), "scan finished");
        let _ = self.status.send(Some(message));
        self.schedule_status_clear();
    }

    fn schedule_status_clear(&self) {
        let status = self.status.clone();
        let clear_after = Duration::from_millis(self.config.scan_status_clear_ms);
        tokio::spawn(async move {
            tokio::time::sleep(clear_after).await;
            let _ = status.send(None);
        });
    }
}
