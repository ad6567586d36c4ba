use std::net::IpAddr;

use async_trait::async_trait;
use chrono::{Datelike, Timelike};
use tokio::sync::watch;

use lumi_common::{
    DeviceInfo, FirmwareVersions, PresenceSensor, PwmLevels, Schedule, ScheduleEntry,
    SchedulePatch, Weekday, DEMO_DEVICE_ADDR,
};
use lumi_common::schedule::time_of_day;

use crate::session::{DeviceSession, SessionError, SessionShared, SessionSnapshot};

const DEMO_FIRMWARE_CURRENT: &str = "1.0.0-demo";
const DEMO_FIRMWARE_LATEST: &str = "1.1.0-demo";

/// An in-memory stand-in for a real controller: same trait, no network.
/// Every setter lands immediately and state lives only as long as the
/// session does.
pub struct SimulatedSession {
    shared: SessionShared,
}

impl SimulatedSession {
    pub fn new() -> Self {
        Self {
            shared: SessionShared::new(Self::initial_snapshot()),
        }
    }

    fn initial_snapshot() -> SessionSnapshot {
        let mut schedule = Schedule::default();
        for (i, day) in Weekday::all().into_iter().enumerate() {
            let entry = ScheduleEntry {
                start: time_of_day((6 + i as u32) % 24, 0),
                end: time_of_day((8 + i as u32) % 24, 0),
                enabled: i % 2 == 0,
            };
            schedule.apply(
                day,
                SchedulePatch {
                    start: Some(entry.start),
                    end: Some(entry.end),
                    enabled: Some(entry.enabled),
                },
            );
        }

        SessionSnapshot {
            info: DeviceInfo {
                name: "Demo Device".to_string(),
                location: "Simulation".to_string(),
                timezone: 3,
            },
            pwm: PwmLevels::new(180, 160, 120, 100),
            relay_on: true,
            auto_mode: true,
            hold_mode: false,
            schedule,
            presence: PresenceSensor {
                enabled: true,
                timeout_secs: 300,
            },
        }
    }
}

impl Default for SimulatedSession {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceSession for SimulatedSession {
    fn addr(&self) -> IpAddr {
        DEMO_DEVICE_ADDR
    }

    async fn snapshot(&self) -> SessionSnapshot {
        self.shared.snapshot().await
    }

    fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.shared.subscribe()
    }

    async fn refresh_all(&self) {}

    async fn set_relay(&self, on: bool) -> Result<(), SessionError> {
        self.shared.mutate(|s| s.relay_on = on).await;
        Ok(())
    }

    async fn set_pwm(&self, pwm: PwmLevels) -> Result<(), SessionError> {
        // Same gate as the real device: channels are frozen with the relay
        // off.
        self.shared
            .mutate(|s| {
                if s.relay_on {
                    s.pwm = pwm;
                }
            })
            .await;
        Ok(())
    }

    async fn set_auto_mode(&self, enabled: bool) -> Result<(), SessionError> {
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
        self.shared.mutate(|s| s.hold_mode = enabled).await;
        Ok(())
    }

    async fn set_schedule(&self, day: Weekday, patch: SchedulePatch) -> Result<(), SessionError> {
        self.shared.mutate(|s| s.schedule.apply(day, patch)).await;
        Ok(())
    }

    async fn set_timezone(&self, offset_hours: i32) -> Result<(), SessionError> {
        self.shared.mutate(|s| s.info.timezone = offset_hours).await;
        Ok(())
    }

    async fn set_presence_sensor(
        &self,
        enabled: bool,
        timeout_minutes: u32,
    ) -> Result<(), SessionError> {
        let timeout_secs = timeout_minutes.max(1) * 60;
        self.shared
            .mutate(|s| {
                s.presence = PresenceSensor {
                    enabled,
                    timeout_secs,
                }
            })
            .await;
        Ok(())
    }

    async fn set_device_name(&self, name: &str) -> Result<(), SessionError> {
        let name = name.to_string();
        self.shared.mutate(|s| s.info.name = name).await;
        Ok(())
    }

    async fn set_device_location(&self, location: &str) -> Result<(), SessionError> {
        let location = location.to_string();
        self.shared.mutate(|s| s.info.location = location).await;
        Ok(())
    }

    async fn current_time(&self) -> Result<(String, Weekday), SessionError> {
        let now = chrono::Local::now();
        let label = format!("{:02}:{:02}", now.hour(), now.minute());
        Ok((label, Weekday::from_chrono(now.weekday())))
    }

    async fn check_version(&self) -> Result<FirmwareVersions, SessionError> {
        Ok(FirmwareVersions {
            current: DEMO_FIRMWARE_CURRENT.to_string(),
            latest: DEMO_FIRMWARE_LATEST.to_string(),
        })
    }

    async fn apply_update(&self) -> Result<(), SessionError> {
        Err(SessionError::SimulatedDevice)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn starts_with_the_fixed_demo_state() {
        let session = SimulatedSession::new();
        let snapshot = session.snapshot().await;

        assert_eq!(session.addr(), DEMO_DEVICE_ADDR);
        assert_eq!(snapshot.info.name, "Demo Device");
        assert_eq!(snapshot.info.timezone, 3);
        assert_eq!(snapshot.pwm, PwmLevels::new(180, 160, 120, 100));
        assert!(snapshot.relay_on);

        // Alternating enabled days, offsets walking through the week.
        assert!(snapshot.schedule.entry(Weekday::Sun).enabled);
        assert!(!snapshot.schedule.entry(Weekday::Mon).enabled);
        assert_eq!(snapshot.schedule.entry(Weekday::Mon).start, time_of_day(7, 0));
        assert_eq!(snapshot.schedule.entry(Weekday::Mon).end, time_of_day(9, 0));
    }

    #[tokio::test]
    async fn setters_apply_locally() {
        let session = SimulatedSession::new();

        session.set_relay(false).await.unwrap();
        session.set_pwm(PwmLevels::new(1, 2, 3, 4)).await.unwrap();
        // Relay is off, so the channel edit was dropped.
        assert_eq!(
            session.snapshot().await.pwm,
            PwmLevels::new(180, 160, 120, 100)
        );

        session.set_relay(true).await.unwrap();
        session.set_pwm(PwmLevels::new(1, 2, 3, 4)).await.unwrap();
        assert_eq!(session.snapshot().await.pwm, PwmLevels::new(1, 2, 3, 4));

        session.set_device_name("Bench Light").await.unwrap();
        session.set_presence_sensor(false, 2).await.unwrap();

        let snapshot = session.snapshot().await;
        assert_eq!(snapshot.info.name, "Bench Light");
        assert_eq!(snapshot.presence.timeout_secs, 120);
        assert!(!snapshot.presence.enabled);
    }

    #[tokio::test]
    async fn an_update_is_always_pending_and_never_applicable() {
        let session = SimulatedSession::new();

        let versions = session.check_version().await.unwrap();
        assert!(versions.update_available());

        let err = session.apply_update().await.unwrap_err();
        assert!(matches!(err, SessionError::SimulatedDevice));
    }
}
