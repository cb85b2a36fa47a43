//! In-memory [`Store`] for tests. Transactions snapshot every table and
//! restore the snapshot when the closure fails.

use super::{Store, StoreError};
use crate::models::device::{MenuItem, TimeRanges};
use crate::models::telemetry::*;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

type SampleKey = (DateTime<Utc>, FactKey, &'static str);

#[derive(Debug, Clone, Default)]
struct Tables {
    facts: Vec<ValueFact>,
    samples: BTreeMap<SampleKey, Sample>,
    peaks: BTreeMap<FactKey, Peak>,
    rules: Vec<AlertRule>,
    menu: Vec<MenuItem>,
    time_ranges: BTreeMap<i32, TimeRanges>,
    errors: Vec<DeviceErrorRecord>,
    next_id: i64,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Tables,
    connected: bool,
    /// Number of upcoming `connect` calls that fail.
    pub failing_connects: usize,
    /// Fails the n-th next sample write (0 = the very next one) and drops the connection.
    pub fail_sample_write_in: Option<usize>,
}

impl MemoryStore {
    pub fn connected() -> Self {
        MemoryStore {
            connected: true,
            ..Default::default()
        }
    }

    fn ensure_connected(&self) -> Result<(), StoreError> {
        if self.connected { Ok(()) } else { Err(StoreError::NotConnected) }
    }

    pub fn add_rule(&mut self, rule: AlertRule) {
        self.tables.rules.retain(|r| r.id != rule.id);
        self.tables.rules.push(rule);
    }

    pub fn rule(&self, id: i64) -> Option<&AlertRule> {
        self.tables.rules.iter().find(|r| r.id == id)
    }

    pub fn facts(&self) -> &[ValueFact] {
        &self.tables.facts
    }

    /// Changes a stored fact behind the registry's back, like an operator would.
    pub fn edit_fact(&mut self, key: FactKey, edit: impl FnOnce(&mut ValueFact)) {
        if let Some(fact) = self.tables.facts.iter_mut().find(|f| f.key() == key) {
            edit(fact);
        }
    }

    pub fn samples(&self) -> Vec<Sample> {
        self.tables.samples.values().cloned().collect()
    }

    pub fn samples_of(&self, key: FactKey, aggregate: Aggregate) -> Vec<Sample> {
        self.tables
            .samples
            .values()
            .filter(|s| s.key() == key && s.aggregate == aggregate)
            .cloned()
            .collect()
    }

    pub fn peak(&self, key: FactKey) -> Option<Peak> {
        self.tables.peaks.get(&key).copied()
    }

    pub fn peaks(&self) -> Vec<Peak> {
        self.tables.peaks.values().copied().collect()
    }

    pub fn time_ranges(&self, address: i32) -> Option<&TimeRanges> {
        self.tables.time_ranges.get(&address)
    }
}

impl Store for MemoryStore {
    fn is_connected(&self) -> bool {
        self.connected
    }

    fn connect(&mut self) -> Result<(), StoreError> {
        if self.failing_connects > 0 {
            self.failing_connects -= 1;
            return Err(StoreError::Connection("connection refused".into()));
        }
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }

    fn transaction<T, F>(&mut self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Self) -> Result<T, StoreError>,
    {
        self.ensure_connected()?;
        let snapshot = self.tables.clone();
        let result = f(self);
        if result.is_err() {
            self.tables = snapshot;
        }
        result
    }

    fn load_value_facts(&mut self) -> Result<Vec<ValueFact>, StoreError> {
        self.ensure_connected()?;
        Ok(self.tables.facts.clone())
    }

    fn find_value_fact(&mut self, key: FactKey) -> Result<Option<ValueFact>, StoreError> {
        self.ensure_connected()?;
        Ok(self.tables.facts.iter().find(|f| f.key() == key).cloned())
    }

    fn insert_value_fact(&mut self, fact: &ValueFact) -> Result<ValueFact, StoreError> {
        self.ensure_connected()?;
        if self.tables.facts.iter().any(|f| f.key() == fact.key()) {
            return Err(StoreError::Query(format!("duplicate value fact {}", fact.key())));
        }
        let mut stored = fact.clone();
        stored.id = self.tables.next_id();
        self.tables.facts.push(stored.clone());
        Ok(stored)
    }

    fn update_value_fact(&mut self, fact: &ValueFact) -> Result<(), StoreError> {
        self.ensure_connected()?;
        match self.tables.facts.iter_mut().find(|f| f.id == fact.id) {
            Some(existing) => {
                existing.name = fact.name.clone();
                existing.title = fact.title.clone();
                existing.unit = fact.unit.clone();
                existing.factor = fact.factor;
                existing.max_scale = fact.max_scale;
                Ok(())
            }
            None => Err(StoreError::Query(format!("no value fact with id {}", fact.id))),
        }
    }

    fn upsert_sample(&mut self, sample: &Sample) -> Result<(), StoreError> {
        self.ensure_connected()?;
        if let Some(n) = self.fail_sample_write_in {
            if n == 0 {
                self.fail_sample_write_in = None;
                self.connected = false;
                return Err(StoreError::Connection("server closed the connection".into()));
            }
            self.fail_sample_write_in = Some(n - 1);
        }
        let key = (sample.time, sample.key(), sample.aggregate.code());
        self.tables.samples.insert(key, sample.clone());
        Ok(())
    }

    fn latest_raw_sample(&mut self, key: FactKey, at: DateTime<Utc>) -> Result<Option<Sample>, StoreError> {
        self.ensure_connected()?;
        Ok(self
            .tables
            .samples
            .values()
            .filter(|s| s.key() == key && s.aggregate == Aggregate::Raw && s.time <= at)
            .max_by_key(|s| s.time)
            .cloned())
    }

    fn first_raw_sample_between(
        &mut self,
        key: FactKey,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Option<Sample>, StoreError> {
        self.ensure_connected()?;
        Ok(self
            .tables
            .samples
            .values()
            .filter(|s| s.key() == key && s.aggregate == Aggregate::Raw && s.time >= from && s.time <= to)
            .min_by_key(|s| s.time)
            .cloned())
    }

    fn latest_sample_time(&mut self) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.ensure_connected()?;
        Ok(self
            .tables
            .samples
            .values()
            .filter(|s| s.aggregate == Aggregate::Raw)
            .map(|s| s.time)
            .max())
    }

    fn raw_samples_before(&mut self, before: DateTime<Utc>) -> Result<Vec<Sample>, StoreError> {
        self.ensure_connected()?;
        Ok(self
            .tables
            .samples
            .values()
            .filter(|s| s.aggregate == Aggregate::Raw && s.time < before)
            .cloned()
            .collect())
    }

    fn delete_raw_samples_before(&mut self, before: DateTime<Utc>) -> Result<usize, StoreError> {
        self.ensure_connected()?;
        let count = self.tables.samples.len();
        self.tables
            .samples
            .retain(|_, s| !(s.aggregate == Aggregate::Raw && s.time < before));
        Ok(count - self.tables.samples.len())
    }

    fn find_peak(&mut self, key: FactKey) -> Result<Option<Peak>, StoreError> {
        self.ensure_connected()?;
        Ok(self.tables.peaks.get(&key).copied())
    }

    fn save_peak(&mut self, peak: &Peak) -> Result<(), StoreError> {
        self.ensure_connected()?;
        self.tables.peaks.insert(peak.key(), *peak);
        Ok(())
    }

    fn load_alert_rules(&mut self) -> Result<Vec<AlertRule>, StoreError> {
        self.ensure_connected()?;
        let mut rules = self.tables.rules.clone();
        rules.sort_by_key(|r| r.id);
        Ok(rules)
    }

    fn find_alert_rule(&mut self, id: i64) -> Result<Option<AlertRule>, StoreError> {
        self.ensure_connected()?;
        Ok(self.rule(id).cloned())
    }

    fn set_last_alert(&mut self, id: i64, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.ensure_connected()?;
        if let Some(rule) = self.tables.rules.iter_mut().find(|r| r.id == id) {
            rule.last_alert_at = Some(at);
        }
        Ok(())
    }

    fn replace_menu(&mut self, items: &[MenuItem]) -> Result<(), StoreError> {
        self.ensure_connected()?;
        self.tables.menu = items.to_vec();
        Ok(())
    }

    fn load_menu(&mut self) -> Result<Vec<MenuItem>, StoreError> {
        self.ensure_connected()?;
        Ok(self.tables.menu.clone())
    }

    fn set_menu_value(&mut self, address: i32, value: &str, unit: &str) -> Result<(), StoreError> {
        self.ensure_connected()?;
        for item in self.tables.menu.iter_mut().filter(|m| m.address == address) {
            item.value = Some(value.to_string());
            item.unit = unit.to_string();
        }
        Ok(())
    }

    fn save_time_ranges(&mut self, ranges: &TimeRanges) -> Result<(), StoreError> {
        self.ensure_connected()?;
        let mut stored = ranges.clone();
        stored.ranges.retain(|r| r.is_valid());
        self.tables.time_ranges.insert(ranges.address, stored);
        Ok(())
    }

    fn find_device_error(
        &mut self,
        number: i32,
        time1: DateTime<Utc>,
    ) -> Result<Option<DeviceErrorRecord>, StoreError> {
        self.ensure_connected()?;
        Ok(self
            .tables
            .errors
            .iter()
            .find(|e| e.number == number && e.time1 == time1)
            .cloned())
    }

    fn save_device_error(&mut self, record: &DeviceErrorRecord) -> Result<(), StoreError> {
        self.ensure_connected()?;
        match record.id {
            Some(id) => {
                if let Some(existing) = self.tables.errors.iter_mut().find(|e| e.id == Some(id)) {
                    *existing = record.clone();
                }
            }
            None => {
                let mut stored = record.clone();
                stored.id = Some(self.tables.next_id());
                self.tables.errors.push(stored);
            }
        }
        Ok(())
    }

    fn load_device_errors(&mut self) -> Result<Vec<DeviceErrorRecord>, StoreError> {
        self.ensure_connected()?;
        let mut errors = self.tables.errors.clone();
        errors.sort_by_key(|e| e.time1);
        Ok(errors)
    }
}
