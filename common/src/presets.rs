use crate::types::PwmLevels;

/// Per-channel slack when deciding whether a live tuple still counts as a
/// named preset (out of 255).
pub const MATCH_TOLERANCE: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preset {
    pub name: &'static str,
    pub pwm: PwmLevels,
}

/// Built-in daylight presets, in catalogue order. Matching picks the first
/// entry that fits, so the order is part of the contract.
pub const PRESETS: [Preset; 8] = [
    Preset {
        name: "Dawn",
        pwm: PwmLevels::new(255, 80, 40, 20),
    },
    Preset {
        name: "Morning Sun",
        pwm: PwmLevels::new(255, 150, 100, 50),
    },
    Preset {
        name: "Daylight",
        pwm: PwmLevels::new(180, 200, 200, 180),
    },
    Preset {
        name: "Midday Glow",
        pwm: PwmLevels::new(120, 180, 255, 255),
    },
    Preset {
        name: "Afternoon Sun",
        pwm: PwmLevels::new(160, 180, 160, 120),
    },
    Preset {
        name: "Sunset",
        pwm: PwmLevels::new(255, 120, 80, 40),
    },
    Preset {
        name: "Pre-sunset Glow",
        pwm: PwmLevels::new(255, 80, 40, 1),
    },
    Preset {
        name: "Dusk",
        pwm: PwmLevels::new(180, 60, 20, 1),
    },
];

/// Classify the current tuple against the catalogue. Purely derived display
/// state: with the relay off the channels are meaningless and nothing
/// matches.
pub fn match_preset(pwm: &PwmLevels, relay_on: bool) -> Option<&'static Preset> {
    if !relay_on {
        return None;
    }
    PRESETS
        .iter()
        .find(|preset| pwm.within_tolerance_of(&preset.pwm, MATCH_TOLERANCE))
}
