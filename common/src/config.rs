use std::net::{IpAddr, Ipv4Addr};

use serde::{Deserialize, Serialize};

/// Reserved, non-routable identity for the simulated controller.
pub const DEMO_DEVICE_ADDR: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub discovery_port: u16,
    pub offline_after_ms: u64,
    pub liveness_tick_ms: u64,
    pub scan_window_ms: u64,
    pub scan_status_clear_ms: u64,
    pub request_timeout_ms: u64,
    pub update_probe_interval_ms: u64,
    pub update_probe_timeout_ms: u64,
    pub update_probe_max_attempts: u32,
    pub min_presence_timeout_secs: u32,
    pub firmware_feed_url: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            discovery_port: 4210,
            offline_after_ms: 10_000,
            liveness_tick_ms: 5_000,
            scan_window_ms: 15_000,
            scan_status_clear_ms: 5_000,
            request_timeout_ms: 5_000,
            update_probe_interval_ms: 3_000,
            update_probe_timeout_ms: 2_000,
            update_probe_max_attempts: 100,
            min_presence_timeout_secs: 60,
            firmware_feed_url: "https://storage.yandexcloud.net/firmware-updates/firmware_version.txt"
                .to_string(),
        }
    }
}

impl SyncConfig {
    pub fn sanitize(&mut self) {
        if self.offline_after_ms == 0 {
            self.offline_after_ms = 10_000;
        }
        if self.liveness_tick_ms == 0 {
            self.liveness_tick_ms = 5_000;
        }
        self.update_probe_max_attempts = self.update_probe_max_attempts.clamp(1, 1_000);
        self.min_presence_timeout_secs = self.min_presence_timeout_secs.max(60);
    }
}
