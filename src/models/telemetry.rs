//! Catalog, sample and alert-rule types shared by the store, the poller and
//! the alert engine.
//!
//! These are the domain shapes; `crate::db::models` carries the diesel row
//! structs and converts into them.

use chrono::{DateTime, Utc};
use core::fmt;
use serde::{Deserialize, Serialize};

/// Protocol type of a catalog entry. Stored as its two-letter code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FactKind {
    #[serde(rename = "VA")]
    AnalogValue,
    #[serde(rename = "DO")]
    DigitalOut,
    #[serde(rename = "DI")]
    DigitalIn,
    #[serde(rename = "AO")]
    AnalogOut,
    #[serde(rename = "W1")]
    OneWire,
    #[serde(rename = "UD")]
    UserDefined,
    #[serde(rename = "SC")]
    Script,
}

impl FactKind {
    pub const ALL: [FactKind; 7] = [
        FactKind::AnalogValue,
        FactKind::DigitalOut,
        FactKind::DigitalIn,
        FactKind::AnalogOut,
        FactKind::OneWire,
        FactKind::UserDefined,
        FactKind::Script,
    ];

    pub fn code(self) -> &'static str {
        match self {
            FactKind::AnalogValue => "VA",
            FactKind::DigitalOut => "DO",
            FactKind::DigitalIn => "DI",
            FactKind::AnalogOut => "AO",
            FactKind::OneWire => "W1",
            FactKind::UserDefined => "UD",
            FactKind::Script => "SC",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.code() == code)
    }
}

impl fmt::Display for FactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// `(address, kind)` identifies a sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FactKey {
    pub address: i32,
    pub kind: FactKind,
}

impl FactKey {
    pub fn new(address: i32, kind: FactKind) -> Self {
        FactKey { address, kind }
    }
}

impl fmt::Display for FactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:0x{:02x}", self.kind, self.address)
    }
}

/// Addresses of the `UD` facts every installation carries.
pub mod user_defined {
    pub const STATE: i32 = 1;
    pub const MODE: i32 = 2;
    pub const CLOCK: i32 = 3;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueFact {
    /// Store-assigned id; defines registry (insertion) order. Zero until stored.
    pub id: i64,
    pub address: i32,
    pub kind: FactKind,
    pub name: String,
    pub title: String,
    pub usr_title: Option<String>,
    pub unit: String,
    /// Integer divisor applied to raw device values.
    pub factor: i32,
    /// Recorded and alerted on only when set.
    pub active: bool,
    pub group_id: Option<i32>,
    pub max_scale: Option<i32>,
}

impl ValueFact {
    pub fn key(&self) -> FactKey {
        FactKey::new(self.address, self.kind)
    }

    /// Operator title when present, device title otherwise.
    pub fn display_title(&self) -> &str {
        match self.usr_title.as_deref() {
            Some(t) if !t.trim().is_empty() => t,
            _ => &self.title,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Aggregate {
    #[serde(rename = "S")]
    Raw,
    #[serde(rename = "A")]
    Aggregated,
}

impl Aggregate {
    pub fn code(self) -> &'static str {
        match self {
            Aggregate::Raw => "S",
            Aggregate::Aggregated => "A",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "S" => Some(Aggregate::Raw),
            "A" => Some(Aggregate::Aggregated),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub time: DateTime<Utc>,
    pub address: i32,
    pub kind: FactKind,
    pub aggregate: Aggregate,
    pub value: f64,
    pub text: Option<String>,
    /// Number of raw observations folded into this row (1 for raw rows).
    pub samples: i32,
}

impl Sample {
    pub fn key(&self) -> FactKey {
        FactKey::new(self.address, self.kind)
    }
}

/// Latest value of one active fact, as produced by the last sweep.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    pub address: i32,
    pub kind: FactKind,
    pub name: String,
    pub title: String,
    pub unit: String,
    pub value: f64,
    pub text: Option<String>,
    pub group_id: Option<i32>,
    pub time: DateTime<Utc>,
}

impl Reading {
    pub fn key(&self) -> FactKey {
        FactKey::new(self.address, self.kind)
    }
}

/// All-time running min/max of one sensor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Peak {
    pub address: i32,
    pub kind: FactKind,
    pub min: f64,
    pub max: f64,
}

impl Peak {
    pub fn key(&self) -> FactKey {
        FactKey::new(self.address, self.kind)
    }
}

/// Operator joining a rule's own verdict (left) with its sub-rule's verdict (right).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogicalOp {
    And,
    Or,
    AndNot,
    OrNot,
}

impl LogicalOp {
    pub fn code(self) -> &'static str {
        match self {
            LogicalOp::And => "and",
            LogicalOp::Or => "or",
            LogicalOp::AndNot => "and-not",
            LogicalOp::OrNot => "or-not",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim().to_ascii_lowercase().as_str() {
            "and" => Some(LogicalOp::And),
            "or" => Some(LogicalOp::Or),
            "and-not" | "and_not" | "andnot" => Some(LogicalOp::AndNot),
            "or-not" | "or_not" | "ornot" => Some(LogicalOp::OrNot),
            _ => None,
        }
    }

    pub fn combine(self, own: bool, sub: bool) -> bool {
        match self {
            LogicalOp::And => own && sub,
            LogicalOp::Or => own || sub,
            LogicalOp::AndNot => own && !sub,
            LogicalOp::OrNot => own || !sub,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: i64,
    pub address: i32,
    pub kind: FactKind,
    /// Inactive rules are only evaluated as somebody's sub-rule.
    pub active: bool,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub range_minutes: Option<i32>,
    pub delta: Option<f64>,
    pub sub_id: Option<i64>,
    pub logical_op: LogicalOp,
    pub max_repeat_minutes: i32,
    pub last_alert_at: Option<DateTime<Utc>>,
    pub mail_to: String,
    pub subject: String,
    pub body: String,
}

impl AlertRule {
    pub fn key(&self) -> FactKey {
        FactKey::new(self.address, self.kind)
    }
}

/// Lifecycle state of an entry in the controller's error log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorState {
    Occurred,
    Gone,
    Acknowledged,
}

impl ErrorState {
    /// Device-side state number (1, 2, 4).
    pub fn from_device(state: i32) -> Option<Self> {
        match state {
            1 => Some(ErrorState::Occurred),
            2 => Some(ErrorState::Gone),
            4 => Some(ErrorState::Acknowledged),
            _ => None,
        }
    }

    pub fn text(self) -> &'static str {
        match self {
            ErrorState::Occurred => "occurred",
            ErrorState::Gone => "gone",
            ErrorState::Acknowledged => "acknowledged",
        }
    }

    pub fn from_text(text: &str) -> Option<Self> {
        match text {
            "occurred" => Some(ErrorState::Occurred),
            "gone" => Some(ErrorState::Gone),
            "acknowledged" => Some(ErrorState::Acknowledged),
            _ => None,
        }
    }
}

/// One folded entry of the controller's error log, keyed by `(number, time1)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceErrorRecord {
    pub id: Option<i64>,
    pub number: i32,
    pub info: i32,
    pub text: String,
    pub state: ErrorState,
    pub time1: DateTime<Utc>,
    pub time2: Option<DateTime<Utc>>,
    pub time4: Option<DateTime<Utc>>,
    pub mail_count: i32,
}

impl DeviceErrorRecord {
    /// Not acknowledged and not mailed yet.
    pub fn is_pending(&self) -> bool {
        self.state != ErrorState::Acknowledged && self.mail_count == 0
    }

    pub fn latest_time(&self) -> DateTime<Utc> {
        [Some(self.time1), self.time2, self.time4]
            .into_iter()
            .flatten()
            .max()
            .unwrap_or(self.time1)
    }
}
