//! Catalog of known sensors and actuators plus the latest reading of each.
//!
//! The registry mirrors the `value_facts` table in insertion order and is the
//! only writer of catalog rows. Facts are never deleted; the operator-owned
//! `active` flag is set on insert only.

use crate::models::device::{MenuItem, MenuItemKind, ValueSpec};
use crate::models::telemetry::{FactKey, FactKind, Reading, ValueFact, user_defined};
use crate::providers::ProvidedValue;
use crate::store::{Store, StoreError};
use crate::utils::{default_max_scale, normalize_unit, sanitize_name};
use log::{debug, info};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileCounts {
    pub added: usize,
    pub modified: usize,
    pub unchanged: usize,
}

impl ReconcileCounts {
    pub fn total(&self) -> usize {
        self.added + self.modified + self.unchanged
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    facts: Vec<ValueFact>,
    readings: HashMap<FactKey, Reading>,
}

fn candidate(key: FactKey, name: &str, title: &str, unit: &str, factor: i32) -> ValueFact {
    let unit = normalize_unit(unit);
    ValueFact {
        id: 0,
        address: key.address,
        kind: key.kind,
        name: name.to_string(),
        title: title.to_string(),
        usr_title: None,
        max_scale: Some(default_max_scale(&unit)),
        unit,
        factor: factor.max(1),
        active: false,
        group_id: None,
    }
}

impl Registry {
    pub fn load<S: Store>(store: &mut S) -> Result<Self, StoreError> {
        let mut registry = Registry::default();
        registry.reload(store)?;
        Ok(registry)
    }

    /// Re-reads the catalog so operator edits (activation, titles) are picked up.
    pub fn reload<S: Store>(&mut self, store: &mut S) -> Result<(), StoreError> {
        self.facts = store.load_value_facts()?;
        let facts = &self.facts;
        self.readings.retain(|key, _| facts.iter().any(|f| f.key() == *key && f.active));
        Ok(())
    }

    pub fn facts(&self) -> &[ValueFact] {
        &self.facts
    }

    pub fn get(&self, key: FactKey) -> Option<&ValueFact> {
        self.facts.iter().find(|f| f.key() == key)
    }

    /// Active facts in registry order, optionally of one kind.
    pub fn list_active(&self, kind: Option<FactKind>) -> Vec<ValueFact> {
        self.facts
            .iter()
            .filter(|f| f.active && kind.is_none_or(|k| f.kind == k))
            .cloned()
            .collect()
    }

    fn apply<S: Store>(
        &mut self,
        store: &mut S,
        candidate: ValueFact,
        counts: &mut ReconcileCounts,
    ) -> Result<(), StoreError> {
        let Some(index) = self.facts.iter().position(|f| f.key() == candidate.key()) else {
            debug!("Registry: adding {} '{}'", candidate.key(), candidate.name);
            let stored = store.insert_value_fact(&candidate)?;
            self.facts.push(stored);
            counts.added += 1;
            return Ok(());
        };

        let existing = &self.facts[index];
        let mut updated = existing.clone();
        updated.name = candidate.name;
        updated.title = candidate.title;
        updated.unit = candidate.unit;
        updated.factor = candidate.factor;
        if updated.max_scale.is_none() {
            updated.max_scale = candidate.max_scale;
        }

        if updated == *existing {
            counts.unchanged += 1;
        } else {
            store.update_value_fact(&updated)?;
            self.facts[index] = updated;
            counts.modified += 1;
        }
        Ok(())
    }

    fn ensure_user_defined<S: Store>(&mut self, store: &mut S, counts: &mut ReconcileCounts) -> Result<(), StoreError> {
        let defaults = [
            (user_defined::STATE, "Status", "Heizungsstatus", "zst"),
            (user_defined::MODE, "Betriebsmodus", "Betriebsmodus", "zst"),
            (user_defined::CLOCK, "Uhrzeit", "Datum Uhrzeit der Heizung", "T"),
        ];
        for (address, name, title, unit) in defaults {
            let key = FactKey::new(address, FactKind::UserDefined);
            if self.get(key).is_some() {
                continue;
            }
            let mut fact = candidate(key, name, title, unit, 1);
            fact.active = true;
            fact.max_scale = None;
            self.facts.push(store.insert_value_fact(&fact)?);
            counts.added += 1;
        }
        Ok(())
    }

    /// Merges the controller's value list into the catalog and makes sure the
    /// state, mode and clock facts exist.
    pub fn reconcile_from_device<S: Store>(
        &mut self,
        store: &mut S,
        specs: &[ValueSpec],
    ) -> Result<ReconcileCounts, StoreError> {
        self.reload(store)?;
        let mut counts = ReconcileCounts::default();
        for spec in specs {
            let key = FactKey::new(spec.address, FactKind::AnalogValue);
            self.apply(store, candidate(key, &spec.name, &spec.description, &spec.unit, spec.factor), &mut counts)?;
        }
        self.ensure_user_defined(store, &mut counts)?;
        info!(
            "Read {} value facts, modified {} and added {}",
            counts.total(),
            counts.modified,
            counts.added
        );
        Ok(counts)
    }

    /// Derives `DO`/`DI`/`AO` facts from the I/O lines of the menu tree.
    pub fn reconcile_digital_lines<S: Store>(
        &mut self,
        store: &mut S,
        menu: &[MenuItem],
    ) -> Result<ReconcileCounts, StoreError> {
        let mut counts = ReconcileCounts::default();
        for item in menu.iter().filter(|m| m.kind.is_io_line()) {
            let kind = match item.kind {
                MenuItemKind::DigitalOut => FactKind::DigitalOut,
                MenuItemKind::DigitalIn => FactKind::DigitalIn,
                _ => FactKind::AnalogOut,
            };
            let unit = if item.unit.is_empty() && kind == FactKind::AnalogOut { "%" } else { item.unit.as_str() };
            let name = format!("{}_0x{:x}", sanitize_name(&item.title), item.address);
            let key = FactKey::new(item.address, kind);
            self.apply(store, candidate(key, &name, &item.title, unit, 1), &mut counts)?;
        }
        info!(
            "Checked {} digital lines, added {}, modified {}",
            counts.total(),
            counts.added,
            counts.modified
        );
        Ok(counts)
    }

    /// Catalogues values from a one-wire or script provider.
    pub fn reconcile_provided<S: Store>(
        &mut self,
        store: &mut S,
        kind: FactKind,
        values: &[ProvidedValue],
    ) -> Result<ReconcileCounts, StoreError> {
        let mut counts = ReconcileCounts::default();
        for value in values {
            let unit = match (kind, value.unit.is_empty()) {
                (FactKind::OneWire, true) => "°C",
                _ => value.unit.as_str(),
            };
            let key = FactKey::new(value.address, kind);
            self.apply(store, candidate(key, &value.name, &value.name, unit, 1), &mut counts)?;
        }
        if counts.total() > 0 {
            info!("Checked {} {} sensors, added {}", counts.total(), kind, counts.added);
        }
        Ok(counts)
    }

    pub fn update_reading(&mut self, reading: Reading) {
        self.readings.insert(reading.key(), reading);
    }

    /// Latest readings of the active facts, in registry order.
    pub fn readings(&self) -> Vec<Reading> {
        self.facts
            .iter()
            .filter(|f| f.active)
            .filter_map(|f| self.readings.get(&f.key()).cloned())
            .collect()
    }
}
