use std::{net::IpAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize};
use tokio::{sync::watch, sync::Mutex, task::JoinHandle};
use thiserror::Error;
use tracing::{debug, warn};

use lumi_common::{
    match_preset, DeviceInfo, FirmwareVersions, Frame, PresenceSensor, Preset, PwmLevels,
    Schedule, ScheduleEntry, SchedulePatch, StateFrame, SwitchState, SyncConfig, Weekday,
    DEMO_DEVICE_ADDR,
};
use lumi_common::schedule::format_hhmm;

use crate::{discovery::DiscoveryListener, sim::SimulatedSession};

/// Everything the runtime knows about one controller, refreshed over HTTP
/// and patched live by broadcast state frames.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSnapshot {
    pub info: DeviceInfo,
    pub pwm: PwmLevels,
    pub relay_on: bool,
    pub auto_mode: bool,
    pub hold_mode: bool,
    pub schedule: Schedule,
    pub presence: PresenceSensor,
}

impl SessionSnapshot {
    /// The catalogue preset the current channels correspond to, if any.
    pub fn active_preset(&self) -> Option<&'static Preset> {
        match_preset(&self.pwm, self.relay_on)
    }

    pub fn can_adjust_pwm(&self) -> bool {
        self.relay_on
    }

    /// A manual channel edit while the schedule is driving the light needs
    /// an explicit hold acknowledgement first.
    pub fn needs_hold_confirmation(&self) -> bool {
        self.auto_mode && !self.hold_mode
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("controller answered with status {0}")]
    Status(u16),
    #[error("controller did not come back after the update")]
    UpdateTimedOut,
    #[error("not available on the simulated device")]
    SimulatedDevice,
}

/// Uniform surface over a real controller and the simulated one; callers
/// never branch on which they hold.
#[async_trait]
pub trait DeviceSession: Send + Sync {
    fn addr(&self) -> IpAddr;
    async fn snapshot(&self) -> SessionSnapshot;
    fn subscribe(&self) -> watch::Receiver<SessionSnapshot>;

    /// Pull every readable facet of device state. Individual fetch failures
    /// keep the prior value; the refresh itself never fails.
    async fn refresh_all(&self);

    async fn set_relay(&self, on: bool) -> Result<(), SessionError>;
    async fn set_pwm(&self, pwm: PwmLevels) -> Result<(), SessionError>;
    async fn set_auto_mode(&self, enabled: bool) -> Result<(), SessionError>;
    async fn set_hold_mode(&self, enabled: bool) -> Result<(), SessionError>;
    async fn set_schedule(&self, day: Weekday, patch: SchedulePatch) -> Result<(), SessionError>;
    async fn set_timezone(&self, offset_hours: i32) -> Result<(), SessionError>;
    async fn set_presence_sensor(
        &self,
        enabled: bool,
        timeout_minutes: u32,
    ) -> Result<(), SessionError>;
    async fn set_device_name(&self, name: &str) -> Result<(), SessionError>;
    async fn set_device_location(&self, location: &str) -> Result<(), SessionError>;

    /// Controller wall clock as an `HH:MM` label plus its weekday.
    async fn current_time(&self) -> Result<(String, Weekday), SessionError>;
    async fn check_version(&self) -> Result<FirmwareVersions, SessionError>;
    async fn apply_update(&self) -> Result<(), SessionError>;
}

/// Snapshot cell shared between a session and its background ingest task.
pub(crate) struct SessionShared {
    state: Mutex<SessionSnapshot>,
    updates: watch::Sender<SessionSnapshot>,
}

impl SessionShared {
    pub(crate) fn new(initial: SessionSnapshot) -> Self {
        let (updates, _) = watch::channel(initial.clone());
        Self {
            state: Mutex::new(initial),
            updates,
        }
    }

    pub(crate) async fn snapshot(&self) -> SessionSnapshot {
        self.state.lock().await.clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.updates.subscribe()
    }

    pub(crate) async fn mutate(&self, apply: impl FnOnce(&mut SessionSnapshot)) {
        let mut state = self.state.lock().await;
        apply(&mut state);
        let _ = self.updates.send(state.clone());
    }
}

#[derive(Deserialize)]
struct RelayStateBody {
    #[serde(rename = "relayState")]
    relay_state: SwitchState,
}

#[derive(Deserialize)]
struct AutoModeBody {
    #[serde(rename = "autoMode")]
    auto_mode: bool,
    #[serde(rename = "holdMode", default)]
    hold_mode: bool,
}

#[derive(Deserialize)]
struct ScheduleBody {
    schedule: Vec<ScheduleEntry>,
}

#[derive(Deserialize)]
struct TimeBody {
    time: String,
    day: u32,
}

#[derive(Deserialize)]
struct VersionBody {
    version: String,
}

/// A live session against one controller's HTTP endpoints.
pub struct HttpDeviceSession {
    addr: IpAddr,
    base: String,
    client: reqwest::Client,
    config: SyncConfig,
    shared: Arc<SessionShared>,
    ingest: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl HttpDeviceSession {
    pub fn new(addr: IpAddr, config: SyncConfig) -> Result<Self, SessionError> {
        let base = format!("http://{addr}");
        Self::with_base(addr, base, config)
    }

    /// Session pointed at an explicit base URL instead of the device
    /// address itself.
    pub fn with_base(addr: IpAddr, base: String, config: SyncConfig) -> Result<Self, SessionError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;
        Ok(Self {
            addr,
            base,
            client,
            config,
            shared: Arc::new(SessionShared::new(SessionSnapshot::default())),
            ingest: std::sync::Mutex::new(None),
        })
    }

    /// Feed broadcast state frames for this device into the snapshot.
    pub async fn attach(&self, listener: &DiscoveryListener) {
        let mut events = listener.subscribe();
        let shared = Arc::clone(&self.shared);
        let addr = self.addr;
        let handle = tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "session ingest lagged behind discovery feed");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                };
                let Frame::State(state) = event.frame else { continue };
                if state.ip != Some(addr) && event.source != addr {
                    continue;
                }
                merge_state_frame(&shared, &state).await;
            }
        });
        if let Ok(mut slot) = self.ingest.lock() {
            if let Some(previous) = slot.replace(handle) {
                previous.abort();
            }
        }
    }

    /// Fold one broadcast frame into the snapshot, field by field. Absent
    /// keys leave the current value alone; present keys win, even over a
    /// just-made local edit.
    pub async fn ingest_state_frame(&self, frame: &StateFrame) {
        merge_state_frame(&self.shared, frame).await;
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, SessionError> {
        let response = self.client.get(self.url(path)).send().await?;
        if !response.status().is_success() {
            return Err(SessionError::Status(response.status().as_u16()));
        }
        Ok(response.json().await?)
    }

    async fn send_ok(&self, request: reqwest::RequestBuilder) -> Result<(), SessionError> {
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(SessionError::Status(response.status().as_u16()));
        }
        Ok(())
    }

    /// One liveness probe during the post-update blackout. Back means the
    /// version endpoint answers again.
    async fn probe_alive(&self) -> bool {
        let request = self
            .client
            .get(self.url("/getFirmwareVersion"))
            .timeout(Duration::from_millis(self.config.update_probe_timeout_ms));
        match request.send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

async fn merge_state_frame(shared: &SessionShared, frame: &StateFrame) {
    shared
        .mutate(|state| {
            if let Some(name) = &frame.device_name {
                state.info.name = name.clone();
            }
            if let Some(location) = &frame.device_location {
                state.info.location = location.clone();
            }
            if let Some(on) = frame.relay_state {
                state.relay_on = on;
            }
            if let Some(value) = frame.pwm_3000k {
                state.pwm.pwm_3000k = value;
            }
            if let Some(value) = frame.pwm_4000k {
                state.pwm.pwm_4000k = value;
            }
            if let Some(value) = frame.pwm_5000k {
                state.pwm.pwm_5000k = value;
            }
            if let Some(value) = frame.pwm_5700k {
                state.pwm.pwm_5700k = value;
            }
            if let Some(entries) = &frame.schedule {
                state.schedule.merge_wire_entries(entries);
            }
            if let Some(auto) = frame.auto_mode {
                state.auto_mode = auto;
            }
        })
        .await;
}

#[async_trait]
impl DeviceSession for HttpDeviceSession {
    fn addr(&self) -> IpAddr {
        self.addr
    }

    async fn snapshot(&self) -> SessionSnapshot {
        self.shared.snapshot().await
    }

    fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.shared.subscribe()
    }

    async fn refresh_all(&self) {
        let (info, pwm, relay, auto, schedule, presence) = tokio::join!(
            self.get_json::<DeviceInfo>("/getDeviceInfo"),
            self.get_json::<PwmLevels>("/getPWM"),
            self.get_json::<RelayStateBody>("/getRelayState"),
            self.get_json::<AutoModeBody>("/getAutoMode"),
            self.get_json::<ScheduleBody>("/getSchedule"),
            self.get_json::<PresenceSensor>("/getPresenceSensor"),
        );

        self.shared
            .mutate(|state| {
                match info {
                    Ok(info) => state.info = info,
                    Err(err) => warn!(error = %err, "device info refresh failed"),
                }
                match pwm {
                    Ok(pwm) => state.pwm = pwm,
                    Err(err) => warn!(error = %err, "pwm refresh failed"),
                }
                match relay {
                    Ok(body) => state.relay_on = body.relay_state.is_on(),
                    Err(err) => warn!(error = %err, "relay refresh failed"),
                }
                match auto {
                    Ok(body) => {
                        state.auto_mode = body.auto_mode;
                        state.hold_mode = body.hold_mode;
                    }
                    Err(err) => warn!(error = %err, "auto mode refresh failed"),
                }
                match schedule {
                    Ok(body) => state.schedule.merge_wire_entries(&body.schedule),
                    Err(err) => warn!(error = %err, "schedule refresh failed"),
                }
                match presence {
                    Ok(presence) => state.presence = presence,
                    Err(err) => warn!(error = %err, "presence sensor refresh failed"),
                }
            })
            .await;
    }

    async fn set_relay(&self, on: bool) -> Result<(), SessionError> {
        let state = SwitchState::from(on);
        self.send_ok(
            self.client
                .post(self.url("/setRelay"))
                .query(&[("state", state.as_str())]),
        )
        .await?;
        self.shared.mutate(|s| s.relay_on = on).await;
        Ok(())
    }

    async fn set_pwm(&self, pwm: PwmLevels) -> Result<(), SessionError> {
        // Channel edits mean nothing while the relay is off; the firmware
        // ignores them, so do not bother it.
        if !self.shared.snapshot().await.relay_on {
            return Ok(());
        }
        self.send_ok(self.client.post(self.url("/setPWM")).query(&[
            ("pwm3000K", pwm.pwm_3000k.to_string()),
            ("pwm4000K", pwm.pwm_4000k.to_string()),
            ("pwm5000K", pwm.pwm_5000k.to_string()),
            ("pwm5700K", pwm.pwm_5700k.to_string()),
        ]))
        .await?;
        self.shared.mutate(|s| s.pwm = pwm).await;
        Ok(())
    }

    async fn set_auto_mode(&self, enabled: bool) -> Result<(), SessionError> {
        self.send_ok(
            self.client
                .post(self.url("/setAutoMode"))
                .form(&[("state", SwitchState::from(enabled).as_str())]),
        )
        .await?;
        self.shared
            .mutate(|s| {
                s.auto_mode = enabled;
                if !enabled {
                    s.hold_mode = false;
                }
            })
            .await;
        Ok(())
    }

    async fn set_hold_mode(&self, enabled: bool) -> Result<(), SessionError> {
        self.send_ok(
            self.client
                .post(self.url("/setHoldMode"))
                .form(&[("state", SwitchState::from(enabled).as_str())]),
        )
        .await?;
        self.shared.mutate(|s| s.hold_mode = enabled).await;
        Ok(())
    }

    async fn set_schedule(&self, day: Weekday, patch: SchedulePatch) -> Result<(), SessionError> {
        let mut schedule = self.shared.snapshot().await.schedule;
        schedule.apply(day, patch);
        // The whole week goes out on every edit.
        let url = format!("{}?{}", self.url("/setSchedule"), schedule.to_query());
        self.send_ok(self.client.get(url)).await?;
        self.shared.mutate(|s| s.schedule = schedule).await;
        Ok(())
    }

    async fn set_timezone(&self, offset_hours: i32) -> Result<(), SessionError> {
        self.send_ok(
            self.client
                .post(self.url("/setTimezone"))
                .form(&[("timezone", offset_hours.to_string())]),
        )
        .await?;
        self.shared.mutate(|s| s.info.timezone = offset_hours).await;
        Ok(())
    }

    async fn set_presence_sensor(
        &self,
        enabled: bool,
        timeout_minutes: u32,
    ) -> Result<(), SessionError> {
        let timeout_secs =
            (timeout_minutes.max(1) * 60).max(self.config.min_presence_timeout_secs);
        let previous = self.shared.snapshot().await.presence;

        // Optimistic flip so the toggle does not lag; rolled back on error.
        self.shared
            .mutate(|s| {
                s.presence = PresenceSensor {
                    enabled,
                    timeout_secs,
                }
            })
            .await;

        let result = self
            .send_ok(self.client.post(self.url("/setPresenceSensor")).form(&[
                ("enabled", enabled.to_string()),
                ("timeout", timeout_secs.to_string()),
            ]))
            .await;

        if result.is_err() {
            self.shared.mutate(|s| s.presence = previous).await;
        }
        result
    }

    async fn set_device_name(&self, name: &str) -> Result<(), SessionError> {
        self.send_ok(
            self.client
                .post(self.url("/setDeviceInfo"))
                .form(&[("device_name", name)]),
        )
        .await?;
        let name = name.to_string();
        self.shared.mutate(|s| s.info.name = name).await;
        Ok(())
    }

    async fn set_device_location(&self, location: &str) -> Result<(), SessionError> {
        self.send_ok(
            self.client
                .post(self.url("/setDeviceInfo"))
                .form(&[("device_location", location)]),
        )
        .await?;
        let location = location.to_string();
        self.shared.mutate(|s| s.info.location = location).await;
        Ok(())
    }

    async fn current_time(&self) -> Result<(String, Weekday), SessionError> {
        let body: TimeBody = self.get_json("/getTime").await?;
        Ok((
            format_hhmm(&body.time),
            Weekday::from_index(body.day as usize),
        ))
    }

    async fn check_version(&self) -> Result<FirmwareVersions, SessionError> {
        let body: VersionBody = self.get_json("/getFirmwareVersion").await?;
        let current = body.version;

        // A dead feed must not block the settings screen; fall back to
        // "nothing newer known".
        let latest = match self.fetch_feed_version().await {
            Ok(version) => version,
            Err(err) => {
                warn!(error = %err, "firmware feed unreachable");
                current.clone()
            }
        };

        Ok(FirmwareVersions { current, latest })
    }

    async fn apply_update(&self) -> Result<(), SessionError> {
        self.send_ok(self.client.post(self.url("/updateFirmware")))
            .await?;

        // The controller reboots into the new image; poll until it answers
        // again or the attempt budget runs out.
        let interval = Duration::from_millis(self.config.update_probe_interval_ms);
        for attempt in 1..=self.config.update_probe_max_attempts {
            tokio::time::sleep(interval).await;
            if self.probe_alive().await {
                debug!(attempt, "controller back after update");
                self.refresh_all().await;
                return Ok(());
            }
        }
        Err(SessionError::UpdateTimedOut)
    }
}

impl HttpDeviceSession {
    async fn fetch_feed_version(&self) -> Result<String, SessionError> {
        let response = self.client.get(&self.config.firmware_feed_url).send().await?;
        if !response.status().is_success() {
            return Err(SessionError::Status(response.status().as_u16()));
        }
        Ok(response.text().await?.trim().to_string())
    }
}

impl Drop for HttpDeviceSession {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.ingest.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

/// Open a session for `addr`, routing the reserved demo address to the
/// simulated device.
pub async fn open_session(
    addr: IpAddr,
    config: &SyncConfig,
    listener: Option<&DiscoveryListener>,
) -> Result<Arc<dyn DeviceSession>, SessionError> {
    if addr == DEMO_DEVICE_ADDR {
        return Ok(Arc::new(SimulatedSession::new()));
    }
    let session = HttpDeviceSession::new(addr, config.clone())?;
    if let Some(listener) = listener {
        session.attach(listener).await;
    }
    Ok(Arc::new(session))
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Mutex as StdMutex,
    };

    use axum::{
        extract::RawQuery,
        http::StatusCode,
        response::IntoResponse,
        routing::{get, post},
        Json, Router,
    };
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use lumi_common::schedule::time_of_day;

    #[derive(Default)]
    struct MockInner {
        relay_on: bool,
        requests: Vec<String>,
        presence_fails: bool,
        update_downtime_probes: u32,
    }

    #[derive(Clone, Default)]
    struct Mock {
        inner: Arc<StdMutex<MockInner>>,
        probes: Arc<AtomicU32>,
    }

    impl Mock {
        fn record(&self, line: String) {
            self.inner.lock().unwrap().requests.push(line);
        }

        fn requests(&self) -> Vec<String> {
            self.inner.lock().unwrap().requests.clone()
        }

        fn requests_to(&self, path: &str) -> Vec<String> {
            self.requests()
                .into_iter()
                .filter(|line| line.starts_with(path))
                .collect()
        }
    }

    fn schedule_json() -> serde_json::Value {
        let entries: Vec<_> = (0..7)
            .map(|i| {
                json!({
                    "start": format!("{:02}:00", 6 + i),
                    "end": format!("{:02}:00", 8 + i),
                    "enabled": i % 2 == 0,
                })
            })
            .collect();
        json!({ "schedule": entries })
    }

    fn router(mock: Mock) -> Router {
        let relay_mock = mock.clone();
        let set_relay_mock = mock.clone();
        let set_pwm_mock = mock.clone();
        let set_schedule_mock = mock.clone();
        let set_presence_mock = mock.clone();
        let set_info_mock = mock.clone();
        let set_auto_mock = mock.clone();
        let set_hold_mock = mock.clone();
        let set_tz_mock = mock.clone();
        let update_mock = mock.clone();
        let version_mock = mock.clone();

        Router::new()
            .route(
                "/getDeviceInfo",
                get(|| async {
                    Json(json!({
                        "device_name": "Lumi-1",
                        "device_location": "Kitchen",
                        "timezone": 3,
                    }))
                }),
            )
            .route(
                "/getPWM",
                get(|| async {
                    Json(json!({
                        "pwm3000K": 255, "pwm4000K": 80, "pwm5000K": 40, "pwm5700K": 20,
                    }))
                }),
            )
            .route(
                "/getRelayState",
                get(move || {
                    let mock = relay_mock.clone();
                    async move {
                        let on = mock.inner.lock().unwrap().relay_on;
                        Json(json!({ "relayState": if on { "on" } else { "off" } }))
                    }
                }),
            )
            .route(
                "/getAutoMode",
                get(|| async { Json(json!({ "autoMode": true, "holdMode": false })) }),
            )
            .route("/getSchedule", get(|| async { Json(schedule_json()) }))
            .route(
                "/getPresenceSensor",
                get(|| async { Json(json!({ "enabled": true, "timeout": 300 })) }),
            )
            .route(
                "/getTime",
                get(|| async { Json(json!({ "time": "6:5", "day": 2 })) }),
            )
            .route(
                "/getFirmwareVersion",
                get(move || {
                    let mock = version_mock.clone();
                    async move {
                        let downtime = mock.inner.lock().unwrap().update_downtime_probes;
                        if mock.probes.fetch_add(1, Ordering::SeqCst) < downtime {
                            return StatusCode::SERVICE_UNAVAILABLE.into_response();
                        }
                        Json(json!({ "version": "1.0.0" })).into_response()
                    }
                }),
            )
            .route(
                "/setRelay",
                post(move |RawQuery(query): RawQuery| {
                    let mock = set_relay_mock.clone();
                    async move {
                        let query = query.unwrap_or_default();
                        let mut inner = mock.inner.lock().unwrap();
                        inner.relay_on = query.contains("state=on");
                        inner.requests.push(format!("/setRelay?{query}"));
                        StatusCode::OK
                    }
                }),
            )
            .route(
                "/setPWM",
                post(move |RawQuery(query): RawQuery| {
                    let mock = set_pwm_mock.clone();
                    async move {
                        mock.record(format!("/setPWM?{}", query.unwrap_or_default()));
                        StatusCode::OK
                    }
                }),
            )
            .route(
                "/setSchedule",
                get(move |RawQuery(query): RawQuery| {
                    let mock = set_schedule_mock.clone();
                    async move {
                        mock.record(format!("/setSchedule?{}", query.unwrap_or_default()));
                        StatusCode::OK
                    }
                }),
            )
            .route(
                "/setPresenceSensor",
                post(move |body: String| {
                    let mock = set_presence_mock.clone();
                    async move {
                        let fails = mock.inner.lock().unwrap().presence_fails;
                        mock.record(format!("/setPresenceSensor {body}"));
                        if fails {
                            StatusCode::INTERNAL_SERVER_ERROR
                        } else {
                            StatusCode::OK
                        }
                    }
                }),
            )
            .route(
                "/setDeviceInfo",
                post(move |body: String| {
                    let mock = set_info_mock.clone();
                    async move {
                        mock.record(format!("/setDeviceInfo {body}"));
                        StatusCode::OK
                    }
                }),
            )
            .route(
                "/setAutoMode",
                post(move |body: String| {
                    let mock = set_auto_mock.clone();
                    async move {
                        mock.record(format!("/setAutoMode {body}"));
                        StatusCode::OK
                    }
                }),
            )
            .route(
                "/setHoldMode",
                post(move |body: String| {
                    let mock = set_hold_mock.clone();
                    async move {
                        mock.record(format!("/setHoldMode {body}"));
                        StatusCode::OK
                    }
                }),
            )
            .route(
                "/setTimezone",
                post(move |body: String| {
                    let mock = set_tz_mock.clone();
                    async move {
                        mock.record(format!("/setTimezone {body}"));
                        StatusCode::OK
                    }
                }),
            )
            .route(
                "/updateFirmware",
                post(move || {
                    let mock = update_mock.clone();
                    async move {
                        mock.record("/updateFirmware".to_string());
                        StatusCode::OK
                    }
                }),
            )
            .route("/feed.txt", get(|| async { "1.1.0\n" }))
    }

    async fn serve(mock: Mock) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(mock)).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn test_config(base: &str) -> SyncConfig {
        SyncConfig {
            request_timeout_ms: 2_000,
            update_probe_interval_ms: 30,
            update_probe_timeout_ms: 500,
            update_probe_max_attempts: 10,
            firmware_feed_url: format!("{base}/feed.txt"),
            ..SyncConfig::default()
        }
    }

    async fn session(mock: Mock) -> HttpDeviceSession {
        let base = serve(mock).await;
        let config = test_config(&base);
        HttpDeviceSession::with_base("192.168.1.50".parse().unwrap(), base, config).unwrap()
    }

    #[test]
    fn hold_confirmation_gates_manual_edits_in_auto_mode() {
        let mut snapshot = SessionSnapshot {
            auto_mode: true,
            ..Default::default()
        };
        assert!(snapshot.needs_hold_confirmation());

        snapshot.hold_mode = true;
        assert!(!snapshot.needs_hold_confirmation());

        snapshot.auto_mode = false;
        snapshot.hold_mode = false;
        assert!(!snapshot.needs_hold_confirmation());
    }

    #[tokio::test]
    async fn refresh_all_populates_the_snapshot() {
        let mock = Mock::default();
        mock.inner.lock().unwrap().relay_on = true;
        let session = session(mock).await;

        session.refresh_all().await;
        let snapshot = session.snapshot().await;

        assert_eq!(snapshot.info.name, "Lumi-1");
        assert_eq!(snapshot.info.location, "Kitchen");
        assert_eq!(snapshot.info.timezone, 3);
        assert_eq!(snapshot.pwm, PwmLevels::new(255, 80, 40, 20));
        assert!(snapshot.relay_on);
        assert!(snapshot.auto_mode);
        assert_eq!(snapshot.presence.timeout_secs, 300);
        assert_eq!(snapshot.schedule.entry(Weekday::Sun).start, time_of_day(6, 0));
        assert_eq!(snapshot.active_preset().unwrap().name, "Dawn");
    }

    #[tokio::test]
    async fn pwm_edits_are_dropped_while_the_relay_is_off() {
        let mock = Mock::default();
        let session = session(mock.clone()).await;
        session.refresh_all().await;
        assert!(!session.snapshot().await.relay_on);

        session
            .set_pwm(PwmLevels::new(10, 20, 30, 40))
            .await
            .unwrap();
        assert!(mock.requests_to("/setPWM").is_empty());
        assert_eq!(session.snapshot().await.pwm, PwmLevels::new(255, 80, 40, 20));

        session.set_relay(true).await.unwrap();
        session
            .set_pwm(PwmLevels::new(10, 20, 30, 40))
            .await
            .unwrap();

        let sent = mock.requests_to("/setPWM");
        assert_eq!(
            sent,
            vec!["/setPWM?pwm3000K=10&pwm4000K=20&pwm5000K=30&pwm5700K=40".to_string()]
        );
        assert_eq!(session.snapshot().await.pwm, PwmLevels::new(10, 20, 30, 40));
    }

    #[tokio::test]
    async fn presence_edit_rolls_back_when_the_controller_rejects_it() {
        let mock = Mock::default();
        mock.inner.lock().unwrap().presence_fails = true;
        let session = session(mock.clone()).await;
        session.refresh_all().await;

        let before = session.snapshot().await.presence;
        let err = session.set_presence_sensor(false, 5).await.unwrap_err();

        assert!(matches!(err, SessionError::Status(500)));
        assert_eq!(session.snapshot().await.presence, before);
    }

    #[tokio::test]
    async fn presence_timeout_goes_out_in_seconds() {
        let mock = Mock::default();
        let session = session(mock.clone()).await;

        session.set_presence_sensor(true, 5).await.unwrap();

        let sent = mock.requests_to("/setPresenceSensor");
        assert_eq!(sent, vec!["/setPresenceSensor enabled=true&timeout=300".to_string()]);
        assert_eq!(session.snapshot().await.presence.timeout_secs, 300);
    }

    #[tokio::test]
    async fn schedule_edit_transmits_the_whole_week() {
        let mock = Mock::default();
        let session = session(mock.clone()).await;
        session.refresh_all().await;

        session
            .set_schedule(Weekday::Mon, SchedulePatch::start(time_of_day(6, 30)))
            .await
            .unwrap();

        let sent = mock.requests_to("/setSchedule");
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("start1=06:30"));
        assert_eq!(sent[0].matches("enabled").count(), 7);
        assert_eq!(
            session.snapshot().await.schedule.entry(Weekday::Mon).start,
            time_of_day(6, 30)
        );
    }

    #[tokio::test]
    async fn mode_toggles_speak_switch_state() {
        let mock = Mock::default();
        let session = session(mock.clone()).await;

        session.set_auto_mode(true).await.unwrap();
        session.set_hold_mode(true).await.unwrap();
        session.set_auto_mode(false).await.unwrap();

        assert_eq!(
            mock.requests_to("/setAutoMode"),
            vec![
                "/setAutoMode state=on".to_string(),
                "/setAutoMode state=off".to_string(),
            ]
        );
        assert_eq!(
            mock.requests_to("/setHoldMode"),
            vec!["/setHoldMode state=on".to_string()]
        );

        // Dropping auto mode releases the hold with it.
        let snapshot = session.snapshot().await;
        assert!(!snapshot.auto_mode);
        assert!(!snapshot.hold_mode);
    }

    #[tokio::test]
    async fn current_time_is_padded_and_day_decoded() {
        let session = session(Mock::default()).await;

        let (time, day) = session.current_time().await.unwrap();
        assert_eq!(time, "06:05");
        assert_eq!(day, Weekday::Tue);
    }

    #[tokio::test]
    async fn check_version_consults_the_feed() {
        let session = session(Mock::default()).await;

        let versions = session.check_version().await.unwrap();
        assert_eq!(versions.current, "1.0.0");
        assert_eq!(versions.latest, "1.1.0");
        assert!(versions.update_available());
    }

    #[tokio::test]
    async fn check_version_survives_a_dead_feed() {
        let mock = Mock::default();
        let base = serve(mock).await;
        let mut config = test_config(&base);
        config.firmware_feed_url = "http://127.0.0.1:1/feed.txt".to_string();
        let session =
            HttpDeviceSession::with_base("192.168.1.50".parse().unwrap(), base, config).unwrap();

        let versions = session.check_version().await.unwrap();
        assert_eq!(versions.current, "1.0.0");
        assert_eq!(versions.latest, "1.0.0");
        assert!(!versions.update_available());
    }

    #[tokio::test]
    async fn apply_update_waits_out_the_reboot() {
        let mock = Mock::default();
        // The first three version probes fail, as if the device rebooted.
        mock.inner.lock().unwrap().update_downtime_probes = 3;
        let session = session(mock.clone()).await;

        session.apply_update().await.unwrap();

        assert_eq!(mock.requests_to("/updateFirmware").len(), 1);
        assert!(mock.probes.load(Ordering::SeqCst) >= 4);
    }

    #[tokio::test]
    async fn apply_update_gives_up_after_the_probe_budget() {
        let mock = Mock::default();
        mock.inner.lock().unwrap().update_downtime_probes = u32::MAX;
        let base = serve(mock).await;
        let mut config = test_config(&base);
        config.update_probe_max_attempts = 3;
        let session =
            HttpDeviceSession::with_base("192.168.1.50".parse().unwrap(), base, config).unwrap();

        let err = session.apply_update().await.unwrap_err();
        assert!(matches!(err, SessionError::UpdateTimedOut));
    }

    #[tokio::test]
    async fn broadcast_frames_patch_fields_individually() {
        let session = session(Mock::default()).await;
        session.refresh_all().await;

        let frame = StateFrame {
            relay_state: Some(true),
            pwm_4000k: Some(99),
            ..Default::default()
        };
        session.ingest_state_frame(&frame).await;

        let snapshot = session.snapshot().await;
        assert!(snapshot.relay_on);
        // Only the channel the frame carried moved.
        assert_eq!(snapshot.pwm, PwmLevels::new(255, 99, 40, 20));
        assert_eq!(snapshot.info.name, "Lumi-1");
    }

    #[tokio::test]
    async fn watchers_observe_local_edits() {
        let session = session(Mock::default()).await;
        let mut updates = session.subscribe();

        session.set_relay(true).await.unwrap();
        updates.changed().await.unwrap();
        assert!(updates.borrow().relay_on);
    }
}
