//! On-demand requests that run beside the poll loop: parameter access,
//! menu and time-range refresh, alert tests.
//!
//! Every device exchange goes through the gate; store writes happen after
//! the permit is released.

use crate::device::{DeviceError, DeviceProtocol, collect_all};
use crate::gate::DeviceGate;
use crate::models::device::{ConfigParameter, MenuItemKind};
use crate::notify::Notifier;
use crate::services::alerts::{AlertEngine, Evaluation};
use crate::services::registry::Registry;
use crate::store::{Store, StoreError};
use log::{info, warn};

#[derive(Debug)]
pub enum RequestError {
    Device(DeviceError),
    Store(StoreError),
    /// Mail is disabled or has no transport script.
    MailNotConfigured,
    UnknownRule(i64),
}

impl core::fmt::Display for RequestError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            RequestError::Device(e) => write!(f, "{}", e),
            RequestError::Store(e) => write!(f, "{}", e),
            RequestError::MailNotConfigured => write!(f, "mail is not configured"),
            RequestError::UnknownRule(id) => write!(f, "alert rule {} not found", id),
        }
    }
}

impl std::error::Error for RequestError {}

impl From<DeviceError> for RequestError {
    fn from(value: DeviceError) -> Self {
        RequestError::Device(value)
    }
}

impl From<StoreError> for RequestError {
    fn from(value: StoreError) -> Self {
        RequestError::Store(value)
    }
}

pub fn read_parameter<D: DeviceProtocol>(gate: &DeviceGate<D>, address: i32) -> Result<ConfigParameter, DeviceError> {
    gate.with_exclusive_access(|device| device.get_parameter(address))
}

/// Writes `value` to the parameter at `address` and stores what the
/// controller accepted as the menu item's current value.
pub fn write_parameter<S: Store, D: DeviceProtocol>(
    gate: &DeviceGate<D>,
    store: &mut S,
    address: i32,
    value: &str,
) -> Result<ConfigParameter, RequestError> {
    let stored = gate.with_exclusive_access(|device| {
        let mut parameter = device.get_parameter(address)?;
        parameter.value = value.to_string();
        device.set_parameter(&parameter)
    })?;
    info!("Parameter 0x{:x} set to '{}{}'", address, stored.value, stored.unit);
    store.set_menu_value(address, &stored.value, &stored.unit)?;
    Ok(stored)
}

pub fn refresh_menu_value<S: Store, D: DeviceProtocol>(
    gate: &DeviceGate<D>,
    store: &mut S,
    address: i32,
) -> Result<ConfigParameter, RequestError> {
    let parameter = read_parameter(gate, address)?;
    store.set_menu_value(address, &parameter.value, &parameter.unit)?;
    Ok(parameter)
}

/// Replaces the stored menu tree with the controller's and catalogues its
/// I/O lines. Returns the number of menu items stored.
pub fn init_menu<S, D, E>(gate: &DeviceGate<D>, store: &mut S, registry: &mut Registry) -> Result<usize, E>
where
    S: Store,
    D: DeviceProtocol,
    E: From<DeviceError> + From<StoreError>,
{
    let mut items = gate.with_exclusive_access(|device| {
        collect_all(device, D::first_menu_item, D::next_menu_item)
    })?;
    for item in items.iter_mut() {
        if item.kind == MenuItemKind::AnalogOut && item.unit.is_empty() {
            item.unit = "%".to_string();
        }
    }
    store.replace_menu(&items)?;
    info!("Read {} menu items", items.len());
    registry.reconcile_digital_lines(store, &items)?;
    Ok(items.len())
}

/// Stores the heating time windows of every circuit. Returns the number of
/// circuits read.
pub fn update_time_ranges<S, D, E>(gate: &DeviceGate<D>, store: &mut S) -> Result<usize, E>
where
    S: Store,
    D: DeviceProtocol,
    E: From<DeviceError> + From<StoreError>,
{
    let circuits = gate.with_exclusive_access(|device| {
        collect_all(device, D::first_time_ranges, D::next_time_ranges)
    })?;
    for ranges in &circuits {
        let invalid = ranges.ranges.iter().filter(|r| !r.is_valid()).count();
        if invalid > 0 {
            warn!("Time ranges 0x{:x}: skipping {} malformed entries", ranges.address, invalid);
        }
        store.save_time_ranges(ranges)?;
    }
    info!("Updated {} time range sets", circuits.len());
    Ok(circuits.len())
}

/// Forces rule `rule_id` against the newest samples and mails the result.
pub fn alert_test<S: Store, N: Notifier>(
    store: &mut S,
    registry: &Registry,
    notifier: &mut N,
    engine: &AlertEngine,
    rule_id: i64,
) -> Result<Evaluation, RequestError> {
    if !notifier.mail_ready() {
        return Err(RequestError::MailNotConfigured);
    }
    engine
        .test_rule(store, registry.facts(), notifier, rule_id)?
        .ok_or(RequestError::UnknownRule(rule_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::device::{MenuItem, TimeRange, TimeRanges};
    use crate::models::telemetry::{FactKey, FactKind};
    use crate::store::memory::MemoryStore;
    use crate::testing::{FakeDevice, RecordingNotifier};

    fn parameter(address: i32, value: &str) -> ConfigParameter {
        ConfigParameter {
            address,
            value: value.into(),
            unit: "°C".into(),
            min: Some("40".into()),
            max: Some("90".into()),
            default: None,
        }
    }

    fn menu_item(address: i32, kind: MenuItemKind, title: &str) -> MenuItem {
        MenuItem {
            address,
            parent: 1,
            child: 0,
            kind,
            title: title.into(),
            unit: String::new(),
            value: None,
        }
    }

    #[test]
    fn write_parameter_updates_menu_value() {
        let mut dev = FakeDevice::opened();
        dev.parameters.insert(0x20, parameter(0x20, "70"));
        dev.menu = vec![Ok(menu_item(0x20, MenuItemKind::Parameter, "Kesselsolltemperatur"))];
        let gate = DeviceGate::new(dev);
        let mut store = MemoryStore::connected();
        let mut registry = Registry::default();
        init_menu::<_, _, RequestError>(&gate, &mut store, &mut registry).expect("menu");

        let written = write_parameter(&gate, &mut store, 0x20, "75").expect("write");
        assert_eq!(written.value, "75");
        assert_eq!(read_parameter(&gate, 0x20).expect("read").value, "75");
        let menu = store.load_menu().expect("menu");
        assert_eq!(menu[0].value.as_deref(), Some("75"));
    }

    #[test]
    fn unknown_parameter_is_a_warning_and_keeps_link_open() {
        let gate = DeviceGate::new(FakeDevice::opened());
        let mut store = MemoryStore::connected();
        let err = refresh_menu_value(&gate, &mut store, 0x99).unwrap_err();
        assert!(matches!(err, RequestError::Device(DeviceError::Warning { .. })));
        assert!(gate.is_open());
    }

    #[test]
    fn menu_refresh_catalogues_io_lines() {
        let mut dev = FakeDevice::opened();
        dev.menu = vec![
            Ok(menu_item(0x10, MenuItemKind::AnalogOut, "Saugzug")),
            Err(DeviceError::Warning { code: 1, message: "skip".into() }),
            Ok(menu_item(0x11, MenuItemKind::DigitalOut, "Pumpe")),
            Ok(menu_item(0x12, MenuItemKind::Group, "Kessel")),
        ];
        let gate = DeviceGate::new(dev);
        let mut store = MemoryStore::connected();
        let mut registry = Registry::default();

        let count = init_menu::<_, _, RequestError>(&gate, &mut store, &mut registry).expect("menu");
        assert_eq!(count, 3);
        let menu = store.load_menu().expect("menu");
        assert_eq!(menu[0].unit, "%");
        assert!(registry.get(FactKey::new(0x10, FactKind::AnalogOut)).is_some());
        assert!(registry.get(FactKey::new(0x11, FactKind::DigitalOut)).is_some());
        assert!(registry.get(FactKey::new(0x12, FactKind::DigitalOut)).is_none());
    }

    #[test]
    fn time_ranges_drop_malformed_windows() {
        let mut dev = FakeDevice::opened();
        dev.time_ranges = vec![TimeRanges {
            address: 0x05,
            ranges: vec![
                TimeRange { from: "06:00".into(), to: "08:00".into() },
                TimeRange { from: "nn:nn".into(), to: "nn:nn".into() },
            ],
        }];
        let gate = DeviceGate::new(dev);
        let mut store = MemoryStore::connected();
        assert_eq!(update_time_ranges::<_, _, RequestError>(&gate, &mut store).expect("ranges"), 1);
        assert_eq!(store.time_ranges(0x05).expect("stored").ranges.len(), 1);
    }

    #[test]
    fn alert_test_refuses_without_mail() {
        let mut store = MemoryStore::connected();
        let registry = Registry::default();
        let engine = AlertEngine::new("", std::time::Duration::from_secs(60));
        let mut notifier = RecordingNotifier {
            mail_ready: false,
            ..Default::default()
        };
        let err = alert_test(&mut store, &registry, &mut notifier, &engine, 1).unwrap_err();
        assert!(matches!(err, RequestError::MailNotConfigured));

        notifier.mail_ready = true;
        let err = alert_test(&mut store, &registry, &mut notifier, &engine, 1).unwrap_err();
        assert!(matches!(err, RequestError::UnknownRule(1)));
    }
}
