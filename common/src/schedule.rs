use std::fmt::Write as _;

use chrono::{NaiveTime, Timelike, Weekday as ChronoWeekday};
use serde::{Deserialize, Serialize};

/// Controller-native weekday indexing: 0 = Sunday through 6 = Saturday,
/// fixed and independent of host locale. Locale ordering is a display
/// concern and never enters this model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Weekday {
    Sun,
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
}

impl Weekday {
    pub fn index(self) -> usize {
        match self {
            Self::Sun => 0,
            Self::Mon => 1,
            Self::Tue => 2,
            Self::Wed => 3,
            Self::Thu => 4,
            Self::Fri => 5,
            Self::Sat => 6,
        }
    }

    pub fn from_index(index: usize) -> Self {
        match index % 7 {
            0 => Self::Sun,
            1 => Self::Mon,
            2 => Self::Tue,
            3 => Self::Wed,
            4 => Self::Thu,
            5 => Self::Fri,
            _ => Self::Sat,
        }
    }

    pub fn from_chrono(weekday: ChronoWeekday) -> Self {
        match weekday {
            ChronoWeekday::Sun => Self::Sun,
            ChronoWeekday::Mon => Self::Mon,
            ChronoWeekday::Tue => Self::Tue,
            ChronoWeekday::Wed => Self::Wed,
            ChronoWeekday::Thu => Self::Thu,
            ChronoWeekday::Fri => Self::Fri,
            ChronoWeekday::Sat => Self::Sat,
        }
    }

    pub fn all() -> [Self; 7] {
        [
            Self::Sun,
            Self::Mon,
            Self::Tue,
            Self::Wed,
            Self::Thu,
            Self::Fri,
            Self::Sat,
        ]
    }
}

/// Wall-clock `HH:MM` codec for schedule times. The controller transmits no
/// date component and no seconds.
mod hhmm {
    use chrono::NaiveTime;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        NaiveTime::parse_from_str(raw.trim(), "%H:%M").map_err(D::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    #[serde(with = "hhmm")]
    pub start: NaiveTime,
    #[serde(with = "hhmm")]
    pub end: NaiveTime,
    pub enabled: bool,
}

impl Default for ScheduleEntry {
    fn default() -> Self {
        Self {
            start: NaiveTime::MIN,
            end: NaiveTime::MIN,
            enabled: false,
        }
    }
}

/// Single-field edit applied to one weekday's entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulePatch {
    pub start: Option<NaiveTime>,
    pub end: Option<NaiveTime>,
    pub enabled: Option<bool>,
}

impl SchedulePatch {
    pub fn start(time: NaiveTime) -> Self {
        Self {
            start: Some(time),
            ..Self::default()
        }
    }

    pub fn end(time: NaiveTime) -> Self {
        Self {
            end: Some(time),
            ..Self::default()
        }
    }

    pub fn enabled(enabled: bool) -> Self {
        Self {
            enabled: Some(enabled),
            ..Self::default()
        }
    }
}

/// Weekly schedule: exactly one entry per controller weekday index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schedule {
    entries: [ScheduleEntry; 7],
}

impl Schedule {
    pub fn entry(&self, day: Weekday) -> &ScheduleEntry {
        &self.entries[day.index()]
    }

    pub fn entries(&self) -> &[ScheduleEntry; 7] {
        &self.entries
    }

    pub fn apply(&mut self, day: Weekday, patch: SchedulePatch) {
        let entry = &mut self.entries[day.index()];
        if let Some(start) = patch.start {
            entry.start = start;
        }
        if let Some(end) = patch.end {
            entry.end = end;
        }
        if let Some(enabled) = patch.enabled {
            entry.enabled = enabled;
        }
    }

    /// Rebuild from a wire array. The controller always pushes seven
    /// entries; anything shorter leaves the remaining days untouched and
    /// anything longer is ignored.
    pub fn merge_wire_entries(&mut self, entries: &[ScheduleEntry]) {
        for (slot, entry) in self.entries.iter_mut().zip(entries.iter()) {
            *slot = *entry;
        }
    }

    /// Encode the full week as `/setSchedule` query parameters
    /// (`start{i}`, `end{i}`, `enabled{i}` for i = 0..6). Every change
    /// transmits all seven entries.
    pub fn to_query(&self) -> String {
        let mut query = String::new();
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                query.push('&');
            }
            let _ = write!(
                query,
                "start{i}={}&end{i}={}&enabled{i}={}",
                entry.start.format("%H:%M"),
                entry.end.format("%H:%M"),
                entry.enabled,
            );
        }
        query
    }
}

pub fn time_of_day(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour % 24, minute % 60, 0).unwrap_or(NaiveTime::MIN)
}

/// `HH:MM` label used for current-time displays; tolerant of the
/// controller's unpadded variants.
pub fn format_hhmm(raw: &str) -> String {
    let mut parts = raw.trim().split(':');
    let (Some(hours), Some(minutes)) = (parts.next(), parts.next()) else {
        return "00:00".to_string();
    };
    format!("{:0>2}:{:0>2}", hours, minutes)
}

pub fn naive_time_hhmm(time: NaiveTime) -> String {
    format!("{:02}:{:02}", time.hour(), time.minute())
}
