pub mod config;
pub mod presets;
pub mod schedule;
pub mod types;
pub mod wire;

pub use config::{SyncConfig, DEMO_DEVICE_ADDR};
pub use presets::{match_preset, Preset, MATCH_TOLERANCE, PRESETS};
pub use schedule::{Schedule, ScheduleEntry, SchedulePatch, Weekday};
pub use types::{
    Device, DeviceInfo, DeviceStatus, FirmwareVersions, PresenceSensor, PwmLevels, SwitchState,
};
pub use wire::{parse_frame, Frame, FrameError, StateFrame, KEEPALIVE_PREFIX};
