//! Diesel row structs and their mapping onto the domain types.
//!
//! Enum columns (`kind`, `aggregate`, `logical_op`, error `state`) are stored as
//! short text codes; rows carrying an unknown code map to `StoreError::Data`.

use chrono::{DateTime, Utc};
use diesel::prelude::*;

use crate::models::device::{MenuItem, MenuItemKind, TimeRanges};
use crate::models::telemetry::*;
use crate::schema;
use crate::store::StoreError;

fn parse_kind(code: &str) -> Result<FactKind, StoreError> {
    FactKind::from_code(code).ok_or_else(|| StoreError::Data(format!("unknown fact kind '{}'", code)))
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = schema::value_facts)]
pub struct ValueFactRow {
    pub id: i64,
    pub address: i32,
    pub kind: String,
    pub name: String,
    pub title: String,
    pub usr_title: Option<String>,
    pub unit: String,
    pub factor: i32,
    pub active: bool,
    pub group_id: Option<i32>,
    pub max_scale: Option<i32>,
}

impl TryFrom<ValueFactRow> for ValueFact {
    type Error = StoreError;

    fn try_from(row: ValueFactRow) -> Result<Self, Self::Error> {
        Ok(ValueFact {
            id: row.id,
            address: row.address,
            kind: parse_kind(&row.kind)?,
            name: row.name,
            title: row.title,
            usr_title: row.usr_title,
            unit: row.unit,
            factor: row.factor,
            active: row.active,
            group_id: row.group_id,
            max_scale: row.max_scale,
        })
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = schema::value_facts)]
pub struct ValueFactValues {
    pub address: i32,
    pub kind: String,
    pub name: String,
    pub title: String,
    pub usr_title: Option<String>,
    pub unit: String,
    pub factor: i32,
    pub active: bool,
    pub group_id: Option<i32>,
    pub max_scale: Option<i32>,
}

impl From<&ValueFact> for ValueFactValues {
    fn from(f: &ValueFact) -> Self {
        ValueFactValues {
            address: f.address,
            kind: f.kind.code().to_string(),
            name: f.name.clone(),
            title: f.title.clone(),
            usr_title: f.usr_title.clone(),
            unit: f.unit.clone(),
            factor: f.factor,
            active: f.active,
            group_id: f.group_id,
            max_scale: f.max_scale,
        }
    }
}

/// Device-described columns; `active`, `usr_title` and `group_id` belong to the operator.
#[derive(Debug, Clone, AsChangeset)]
#[diesel(table_name = schema::value_facts)]
#[diesel(treat_none_as_null = true)]
pub struct ValueFactChanges {
    pub name: String,
    pub title: String,
    pub unit: String,
    pub factor: i32,
    pub max_scale: Option<i32>,
}

impl From<&ValueFact> for ValueFactChanges {
    fn from(f: &ValueFact) -> Self {
        ValueFactChanges {
            name: f.name.clone(),
            title: f.title.clone(),
            unit: f.unit.clone(),
            factor: f.factor,
            max_scale: f.max_scale,
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = schema::samples)]
pub struct SampleRow {
    pub time: DateTime<Utc>,
    pub address: i32,
    pub kind: String,
    pub aggregate: String,
    pub value: f64,
    pub text: Option<String>,
    pub sample_count: i32,
}

impl From<&Sample> for SampleRow {
    fn from(s: &Sample) -> Self {
        SampleRow {
            time: s.time,
            address: s.address,
            kind: s.kind.code().to_string(),
            aggregate: s.aggregate.code().to_string(),
            value: s.value,
            text: s.text.clone(),
            sample_count: s.samples,
        }
    }
}

impl TryFrom<SampleRow> for Sample {
    type Error = StoreError;

    fn try_from(row: SampleRow) -> Result<Self, Self::Error> {
        Ok(Sample {
            time: row.time,
            address: row.address,
            kind: parse_kind(&row.kind)?,
            aggregate: Aggregate::from_code(&row.aggregate)
                .ok_or_else(|| StoreError::Data(format!("unknown aggregate '{}'", row.aggregate)))?,
            value: row.value,
            text: row.text,
            samples: row.sample_count,
        })
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = schema::peaks)]
pub struct PeakRow {
    pub address: i32,
    pub kind: String,
    pub min: f64,
    pub max: f64,
}

impl From<&Peak> for PeakRow {
    fn from(p: &Peak) -> Self {
        PeakRow {
            address: p.address,
            kind: p.kind.code().to_string(),
            min: p.min,
            max: p.max,
        }
    }
}

impl TryFrom<PeakRow> for Peak {
    type Error = StoreError;

    fn try_from(row: PeakRow) -> Result<Self, Self::Error> {
        Ok(Peak {
            address: row.address,
            kind: parse_kind(&row.kind)?,
            min: row.min,
            max: row.max,
        })
    }
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = schema::alert_rules)]
pub struct AlertRuleRow {
    pub id: i64,
    pub address: i32,
    pub kind: String,
    pub active: bool,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub range_minutes: Option<i32>,
    pub delta: Option<f64>,
    pub sub_id: Option<i64>,
    pub logical_op: String,
    pub max_repeat_minutes: i32,
    pub last_alert_at: Option<DateTime<Utc>>,
    pub mail_to: String,
    pub subject: String,
    pub body: String,
}

impl TryFrom<AlertRuleRow> for AlertRule {
    type Error = StoreError;

    fn try_from(row: AlertRuleRow) -> Result<Self, Self::Error> {
        Ok(AlertRule {
            id: row.id,
            address: row.address,
            kind: parse_kind(&row.kind)?,
            active: row.active,
            min: row.min,
            max: row.max,
            range_minutes: row.range_minutes,
            delta: row.delta,
            sub_id: row.sub_id,
            logical_op: LogicalOp::from_code(&row.logical_op)
                .ok_or_else(|| StoreError::Data(format!("rule {}: unknown operator '{}'", row.id, row.logical_op)))?,
            max_repeat_minutes: row.max_repeat_minutes,
            last_alert_at: row.last_alert_at,
            mail_to: row.mail_to,
            subject: row.subject,
            body: row.body,
        })
    }
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = schema::menu_items)]
pub struct MenuItemRow {
    pub address: i32,
    pub parent: i32,
    pub child: i32,
    pub item_type: i32,
    pub title: String,
    pub unit: String,
    pub value: Option<String>,
}

impl From<MenuItemRow> for MenuItem {
    fn from(row: MenuItemRow) -> Self {
        MenuItem {
            address: row.address,
            parent: row.parent,
            child: row.child,
            kind: MenuItemKind::from_code(row.item_type),
            title: row.title,
            unit: row.unit,
            value: row.value,
        }
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = schema::menu_items)]
pub struct NewMenuItemRow {
    pub address: i32,
    pub parent: i32,
    pub child: i32,
    pub item_type: i32,
    pub title: String,
    pub unit: String,
    pub value: Option<String>,
}

impl From<&MenuItem> for NewMenuItemRow {
    fn from(m: &MenuItem) -> Self {
        NewMenuItemRow {
            address: m.address,
            parent: m.parent,
            child: m.child,
            item_type: m.kind.code(),
            title: m.title.clone(),
            unit: m.unit.clone(),
            value: m.value.clone(),
        }
    }
}

#[derive(Debug, Clone, Insertable, AsChangeset)]
#[diesel(table_name = schema::time_ranges)]
#[diesel(treat_none_as_null = true)]
pub struct TimeRangesValues {
    pub address: i32,
    pub from1: Option<String>,
    pub to1: Option<String>,
    pub from2: Option<String>,
    pub to2: Option<String>,
    pub from3: Option<String>,
    pub to3: Option<String>,
    pub from4: Option<String>,
    pub to4: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<&TimeRanges> for TimeRangesValues {
    fn from(t: &TimeRanges) -> Self {
        let slot = |n: usize| t.ranges.get(n).filter(|r| r.is_valid());
        let from = |n: usize| slot(n).map(|r| r.from.clone());
        let to = |n: usize| slot(n).map(|r| r.to.clone());
        TimeRangesValues {
            address: t.address,
            from1: from(0),
            to1: to(0),
            from2: from(1),
            to2: to(1),
            from3: from(2),
            to3: to(2),
            from4: from(3),
            to4: to(3),
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = schema::device_errors)]
pub struct DeviceErrorRow {
    pub id: i64,
    pub number: i32,
    pub info: i32,
    pub text: String,
    pub state: String,
    pub time1: DateTime<Utc>,
    pub time2: Option<DateTime<Utc>>,
    pub time4: Option<DateTime<Utc>>,
    pub mail_count: i32,
}

impl TryFrom<DeviceErrorRow> for DeviceErrorRecord {
    type Error = StoreError;

    fn try_from(row: DeviceErrorRow) -> Result<Self, Self::Error> {
        Ok(DeviceErrorRecord {
            id: Some(row.id),
            number: row.number,
            info: row.info,
            text: row.text,
            state: ErrorState::from_text(&row.state)
                .ok_or_else(|| StoreError::Data(format!("unknown error state '{}'", row.state)))?,
            time1: row.time1,
            time2: row.time2,
            time4: row.time4,
            mail_count: row.mail_count,
        })
    }
}

#[derive(Debug, Clone, Insertable, AsChangeset)]
#[diesel(table_name = schema::device_errors)]
#[diesel(treat_none_as_null = true)]
pub struct DeviceErrorValues {
    pub number: i32,
    pub info: i32,
    pub text: String,
    pub state: String,
    pub time1: DateTime<Utc>,
    pub time2: Option<DateTime<Utc>>,
    pub time4: Option<DateTime<Utc>>,
    pub mail_count: i32,
}

impl From<&DeviceErrorRecord> for DeviceErrorValues {
    fn from(r: &DeviceErrorRecord) -> Self {
        DeviceErrorValues {
            number: r.number,
            info: r.info,
            text: r.text.clone(),
            state: r.state.text().to_string(),
            time1: r.time1,
            time2: r.time2,
            time4: r.time4,
            mail_count: r.mail_count,
        }
    }
}
