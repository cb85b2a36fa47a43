//! Persistent store contract.
//!
//! Single writer: every method takes `&mut self`. `PgStore` is the
//! production implementation; tests run against `MemoryStore`.

#[cfg(test)]
pub mod memory;
pub mod pg;

use crate::models::device::{MenuItem, TimeRanges};
use crate::models::telemetry::*;
use chrono::{DateTime, Utc};

#[derive(Debug)]
pub enum StoreError {
    NotConnected,
    Connection(String),
    Query(String),
    /// A stored value could not be mapped back into the domain.
    Data(String),
}

impl StoreError {
    /// Errors that call for a reconnect rather than a skipped operation.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, StoreError::NotConnected | StoreError::Connection(_))
    }
}

impl core::fmt::Display for StoreError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            StoreError::NotConnected => write!(f, "store is not connected"),
            StoreError::Connection(s) => write!(f, "connection error: {}", s),
            StoreError::Query(s) => write!(f, "query error: {}", s),
            StoreError::Data(s) => write!(f, "data error: {}", s),
        }
    }
}

impl std::error::Error for StoreError {}

pub trait Store {
    fn is_connected(&self) -> bool;
    fn connect(&mut self) -> Result<(), StoreError>;
    fn disconnect(&mut self);

    /// Runs `f` atomically: all of its writes commit, or none do.
    fn transaction<T, F>(&mut self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Self) -> Result<T, StoreError>,
        Self: Sized;

    /// All facts in insertion order.
    fn load_value_facts(&mut self) -> Result<Vec<ValueFact>, StoreError>;
    fn find_value_fact(&mut self, key: FactKey) -> Result<Option<ValueFact>, StoreError>;
    /// Inserts `fact` (its `id` is ignored) and returns it with the assigned id.
    fn insert_value_fact(&mut self, fact: &ValueFact) -> Result<ValueFact, StoreError>;
    /// Writes the device-described fields (name, title, unit, factor, max scale)
    /// of the fact with `fact.id`. Operator-owned fields are left alone.
    fn update_value_fact(&mut self, fact: &ValueFact) -> Result<(), StoreError>;

    /// Inserts a sample, replacing a row with the same `(time, address, kind, aggregate)`.
    fn upsert_sample(&mut self, sample: &Sample) -> Result<(), StoreError>;
    /// Most recent raw sample at or before `at`.
    fn latest_raw_sample(&mut self, key: FactKey, at: DateTime<Utc>) -> Result<Option<Sample>, StoreError>;
    /// Earliest raw sample within `[from, to]`.
    fn first_raw_sample_between(
        &mut self,
        key: FactKey,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Option<Sample>, StoreError>;
    /// Time of the newest raw sample of any sensor.
    fn latest_sample_time(&mut self) -> Result<Option<DateTime<Utc>>, StoreError>;
    /// Raw samples strictly older than `before`, ordered by time.
    fn raw_samples_before(&mut self, before: DateTime<Utc>) -> Result<Vec<Sample>, StoreError>;
    fn delete_raw_samples_before(&mut self, before: DateTime<Utc>) -> Result<usize, StoreError>;

    fn find_peak(&mut self, key: FactKey) -> Result<Option<Peak>, StoreError>;
    fn save_peak(&mut self, peak: &Peak) -> Result<(), StoreError>;

    fn load_alert_rules(&mut self) -> Result<Vec<AlertRule>, StoreError>;
    fn find_alert_rule(&mut self, id: i64) -> Result<Option<AlertRule>, StoreError>;
    fn set_last_alert(&mut self, id: i64, at: DateTime<Utc>) -> Result<(), StoreError>;

    fn replace_menu(&mut self, items: &[MenuItem]) -> Result<(), StoreError>;
    fn load_menu(&mut self) -> Result<Vec<MenuItem>, StoreError>;
    fn set_menu_value(&mut self, address: i32, value: &str, unit: &str) -> Result<(), StoreError>;
    fn save_time_ranges(&mut self, ranges: &TimeRanges) -> Result<(), StoreError>;

    fn find_device_error(
        &mut self,
        number: i32,
        time1: DateTime<Utc>,
    ) -> Result<Option<DeviceErrorRecord>, StoreError>;
    /// Inserts when `record.id` is `None`, updates otherwise.
    fn save_device_error(&mut self, record: &DeviceErrorRecord) -> Result<(), StoreError>;
    fn load_device_errors(&mut self) -> Result<Vec<DeviceErrorRecord>, StoreError>;
}
