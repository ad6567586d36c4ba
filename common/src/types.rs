use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Liveness of a known controller. Always derived from `now - lastSeen`
/// against the offline threshold, never assigned on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceStatus {
    Online,
    Offline,
}

impl DeviceStatus {
    pub fn from_age_ms(age_ms: u64, offline_after_ms: u64) -> Self {
        if age_ms > offline_after_ms {
            Self::Offline
        } else {
            Self::Online
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "Online",
            Self::Offline => "Offline",
        }
    }
}

/// On/off state as the controller spells it on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwitchState {
    On,
    Off,
}

impl SwitchState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
        }
    }

    pub fn is_on(self) -> bool {
        self == Self::On
    }
}

impl From<bool> for SwitchState {
    fn from(on: bool) -> Self {
        if on {
            Self::On
        } else {
            Self::Off
        }
    }
}

/// A discovered controller as held by the registry and persisted to the
/// device list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub ip: IpAddr,
    pub name: String,
    pub location: String,
    pub status: DeviceStatus,
    #[serde(rename = "lastSeen")]
    pub last_seen_ms: u64,
}

impl Device {
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_seen_ms)
    }
}

/// Four fixed PWM channels, named after their nominal color temperatures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PwmLevels {
    #[serde(rename = "pwm3000K")]
    pub pwm_3000k: u8,
    #[serde(rename = "pwm4000K")]
    pub pwm_4000k: u8,
    #[serde(rename = "pwm5000K")]
    pub pwm_5000k: u8,
    #[serde(rename = "pwm5700K")]
    pub pwm_5700k: u8,
}

impl PwmLevels {
    pub const fn new(pwm_3000k: u8, pwm_4000k: u8, pwm_5000k: u8, pwm_5700k: u8) -> Self {
        Self {
            pwm_3000k,
            pwm_4000k,
            pwm_5000k,
            pwm_5700k,
        }
    }

    pub fn channels(&self) -> [u8; 4] {
        [
            self.pwm_3000k,
            self.pwm_4000k,
            self.pwm_5000k,
            self.pwm_5700k,
        ]
    }

    /// True when every channel is within `tolerance` of the other tuple.
    pub fn within_tolerance_of(&self, other: &Self, tolerance: u8) -> bool {
        self.channels()
            .iter()
            .zip(other.channels())
            .all(|(a, b)| a.abs_diff(b) <= tolerance)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    #[serde(rename = "device_name")]
    pub name: String,
    #[serde(rename = "device_location")]
    pub location: String,
    /// UTC offset in whole hours, as the controller stores it.
    #[serde(default)]
    pub timezone: i32,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            name: "ESP32-Device".to_string(),
            location: String::new(),
            timezone: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceSensor {
    pub enabled: bool,
    /// Shut-off delay in seconds on the wire; edited in whole minutes >= 1.
    #[serde(rename = "timeout")]
    pub timeout_secs: u32,
}

impl Default for PresenceSensor {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_secs: 300,
        }
    }
}

impl PresenceSensor {
    pub fn timeout_minutes(&self) -> u32 {
        (self.timeout_secs / 60).max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareVersions {
    pub current: String,
    pub latest: String,
}

impl FirmwareVersions {
    pub fn update_available(&self) -> bool {
        self.current != self.latest
    }
}
