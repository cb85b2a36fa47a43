//! Payloads exchanged with the heating controller.
//!
//! Field names follow the camelCase frames of the serial bridge so the same
//! structs decode responses directly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    /// Operating state number (burner off, ignition, heating, ...).
    pub state: i32,
    pub mode: i32,
    /// Controller clock.
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub state_text: String,
    #[serde(default)]
    pub mode_text: String,
}

/// Self-description of one measured value as reported by the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueSpec {
    pub address: i32,
    pub name: String,
    pub factor: i32,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IoValue {
    pub address: i32,
    pub state: i32,
    /// Manual/automatic mode; 0xff marks "automatic" on analog outputs.
    #[serde(default)]
    pub mode: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MenuItemKind {
    Parameter,
    Value,
    DigitalOut,
    DigitalIn,
    AnalogOut,
    Firmware,
    Group,
    Reset,
    TimeRange,
    #[serde(other)]
    Other,
}

impl MenuItemKind {
    const CODES: [(MenuItemKind, i32); 10] = [
        (MenuItemKind::Parameter, 1),
        (MenuItemKind::Value, 2),
        (MenuItemKind::DigitalOut, 3),
        (MenuItemKind::DigitalIn, 4),
        (MenuItemKind::AnalogOut, 5),
        (MenuItemKind::Firmware, 6),
        (MenuItemKind::Group, 7),
        (MenuItemKind::Reset, 8),
        (MenuItemKind::TimeRange, 9),
        (MenuItemKind::Other, 0),
    ];

    pub fn code(self) -> i32 {
        Self::CODES
            .iter()
            .find(|(k, _)| *k == self)
            .map(|(_, c)| *c)
            .unwrap_or_default()
    }

    pub fn from_code(code: i32) -> Self {
        Self::CODES
            .iter()
            .find(|(_, c)| *c == code)
            .map(|(k, _)| *k)
            .unwrap_or(MenuItemKind::Other)
    }

    /// I/O lines that get a synthetic catalog entry.
    pub fn is_io_line(self) -> bool {
        matches!(self, MenuItemKind::DigitalOut | MenuItemKind::DigitalIn | MenuItemKind::AnalogOut)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MenuItem {
    pub address: i32,
    pub parent: i32,
    pub child: i32,
    pub kind: MenuItemKind,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub unit: String,
    /// Last value read through an interactive refresh.
    #[serde(default)]
    pub value: Option<String>,
}

/// A configuration parameter, value already formatted for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigParameter {
    pub address: i32,
    pub value: String,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub min: Option<String>,
    #[serde(default)]
    pub max: Option<String>,
    #[serde(default)]
    pub default: Option<String>,
}

/// Up to four `HH:MM` windows for one heating circuit address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeRanges {
    pub address: i32,
    pub ranges: Vec<TimeRange>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: String,
    pub to: String,
}

impl TimeRange {
    /// A range is usable when both ends are `HH:MM` within a day.
    pub fn is_valid(&self) -> bool {
        fn parse(s: &str) -> Option<(u32, u32)> {
            let (h, m) = s.trim().split_once(':')?;
            let (h, m) = (h.parse::<u32>().ok()?, m.parse::<u32>().ok()?);
            (h <= 24 && m < 60).then_some((h, m))
        }
        parse(&self.from).is_some() && parse(&self.to).is_some()
    }
}

/// One line of the controller's error log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceErrorInfo {
    pub number: i32,
    /// 1 = occurred, 2 = gone, 4 = acknowledged.
    pub state: i32,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub info: i32,
    #[serde(default)]
    pub text: String,
}
