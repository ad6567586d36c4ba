use std::net::IpAddr;

use serde::Deserialize;
use thiserror::Error;

use crate::{schedule::ScheduleEntry, types::PwmLevels};

/// Keepalive frames are plain text: the prefix followed by the sender's own
/// address, nothing else.
pub const KEEPALIVE_PREFIX: &str = "ESP_KEEP_ALIVE:";

/// One state frame as broadcast by a controller. Every key is optional; a
/// frame carries whatever subset the firmware felt like pushing and absent
/// keys must leave the local value untouched.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StateFrame {
    pub ip: Option<IpAddr>,
    #[serde(rename = "deviceName")]
    pub device_name: Option<String>,
    #[serde(rename = "deviceLocation")]
    pub device_location: Option<String>,
    #[serde(rename = "relayState")]
    pub relay_state: Option<bool>,
    #[serde(rename = "pwm3000K")]
    pub pwm_3000k: Option<u8>,
    #[serde(rename = "pwm4000K")]
    pub pwm_4000k: Option<u8>,
    #[serde(rename = "pwm5000K")]
    pub pwm_5000k: Option<u8>,
    #[serde(rename = "pwm5700K")]
    pub pwm_5700k: Option<u8>,
    pub schedule: Option<Vec<ScheduleEntry>>,
    #[serde(rename = "autoMode")]
    pub auto_mode: Option<bool>,
}

impl StateFrame {
    /// The complete PWM tuple, when the frame carries all four channels.
    pub fn pwm(&self) -> Option<PwmLevels> {
        Some(PwmLevels {
            pwm_3000k: self.pwm_3000k?,
            pwm_4000k: self.pwm_4000k?,
            pwm_5000k: self.pwm_5000k?,
            pwm_5700k: self.pwm_5700k?,
        })
    }

    /// Whether the frame identifies a device well enough for discovery:
    /// address plus both display fields.
    pub fn has_identity(&self) -> bool {
        self.ip.is_some() && self.device_name.is_some() && self.device_location.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    KeepAlive(IpAddr),
    State(StateFrame),
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("datagram is not valid UTF-8")]
    NotUtf8,
    #[error("keepalive carries an unparsable address: {0:?}")]
    BadKeepAlive(String),
    /// Not one of ours; expected subnet noise, dropped without logging an
    /// error.
    #[error("foreign datagram")]
    Foreign,
    #[error("malformed state frame: {0}")]
    Json(#[from] serde_json::Error),
}

impl FrameError {
    pub fn is_foreign(&self) -> bool {
        matches!(self, Self::Foreign)
    }
}

/// Demultiplex one inbound datagram. Only payloads that start with the
/// keepalive prefix or the JSON object delimiter are recognized.
pub fn parse_frame(payload: &[u8]) -> Result<Frame, FrameError> {
    let text = std::str::from_utf8(payload).map_err(|_| FrameError::NotUtf8)?;
    let text = text.trim();

    if let Some(addr) = text.strip_prefix(KEEPALIVE_PREFIX) {
        let addr = addr.trim();
        return addr
            .parse::<IpAddr>()
            .map(Frame::KeepAlive)
            .map_err(|_| FrameError::BadKeepAlive(addr.to_string()));
    }

    if !text.starts_with('{') {
        return Err(FrameError::Foreign);
    }

    Ok(Frame::State(serde_json::from_str(text)?))
}
