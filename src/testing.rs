//! Scripted collaborators shared by the unit tests.

use crate::device::{DeviceError, DeviceProtocol};
use crate::models::device::*;
use crate::models::telemetry::{FactKind, Reading};
use crate::notify::{Event, Mail, Notifier};
use crate::providers::{ProvidedValue, ValueProvider};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

pub fn status(state: i32, time: DateTime<Utc>) -> DeviceStatus {
    DeviceStatus {
        state,
        mode: 1,
        time,
        version: "V1.02".into(),
        state_text: format!("state {}", state),
        mode_text: "Automatik".into(),
    }
}

#[derive(Debug, Default)]
pub struct FakeDevice {
    open: bool,
    pub fail_open: bool,
    pub status: Option<DeviceStatus>,
    /// Raw register values by address.
    pub values: HashMap<i32, i32>,
    pub digital_in: HashMap<i32, i32>,
    pub digital_out: HashMap<i32, i32>,
    pub analog_out: HashMap<i32, i32>,
    pub parameters: HashMap<i32, ConfigParameter>,
    pub value_specs: Vec<Result<ValueSpec, DeviceError>>,
    pub menu: Vec<Result<MenuItem, DeviceError>>,
    pub time_ranges: Vec<TimeRanges>,
    pub errors: Vec<DeviceErrorInfo>,
    /// The next read of this address fails with a transport error.
    pub fail_value_once: Option<i32>,
    pub opens: usize,
    pub sync_count: usize,
    pub value_reads: usize,
    spec_pos: usize,
    menu_pos: usize,
    range_pos: usize,
    error_pos: usize,
}

impl FakeDevice {
    pub fn opened() -> Self {
        FakeDevice {
            open: true,
            ..Default::default()
        }
    }

    fn ensure_open(&self) -> Result<(), DeviceError> {
        if self.open { Ok(()) } else { Err(DeviceError::Transport("device not open".into())) }
    }

    fn step<T: Clone>(&self, items: &[Result<T, DeviceError>], pos: usize) -> Result<Option<T>, DeviceError> {
        self.ensure_open()?;
        items.get(pos).cloned().transpose()
    }

    fn io(&self, map: &HashMap<i32, i32>, address: i32) -> Result<IoValue, DeviceError> {
        self.ensure_open()?;
        let state = map.get(&address).copied().ok_or(DeviceError::Warning {
            code: 3,
            message: format!("no I/O line 0x{:x}", address),
        })?;
        Ok(IoValue { address, state, mode: 0 })
    }
}

impl DeviceProtocol for FakeDevice {
    fn open(&mut self) -> Result<(), DeviceError> {
        if self.fail_open {
            return Err(DeviceError::Transport("no such device".into()));
        }
        self.open = true;
        self.opens += 1;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn check(&mut self) -> Result<(), DeviceError> {
        self.ensure_open()
    }

    fn get_status(&mut self) -> Result<DeviceStatus, DeviceError> {
        self.ensure_open()?;
        Ok(self.status.clone().unwrap_or_else(|| status(0, DateTime::<Utc>::default())))
    }

    fn get_value(&mut self, address: i32) -> Result<i32, DeviceError> {
        self.ensure_open()?;
        self.value_reads += 1;
        if self.fail_value_once == Some(address) {
            self.fail_value_once = None;
            return Err(DeviceError::Transport("read timeout".into()));
        }
        self.values.get(&address).copied().ok_or(DeviceError::Warning {
            code: 1,
            message: format!("no value at 0x{:x}", address),
        })
    }

    fn get_digital_in(&mut self, address: i32) -> Result<IoValue, DeviceError> {
        self.io(&self.digital_in, address)
    }

    fn get_digital_out(&mut self, address: i32) -> Result<IoValue, DeviceError> {
        self.io(&self.digital_out, address)
    }

    fn get_analog_out(&mut self, address: i32) -> Result<IoValue, DeviceError> {
        self.io(&self.analog_out, address)
    }

    fn get_parameter(&mut self, address: i32) -> Result<ConfigParameter, DeviceError> {
        self.ensure_open()?;
        self.parameters.get(&address).cloned().ok_or(DeviceError::Warning {
            code: 2,
            message: format!("no parameter at 0x{:x}", address),
        })
    }

    fn set_parameter(&mut self, parameter: &ConfigParameter) -> Result<ConfigParameter, DeviceError> {
        self.ensure_open()?;
        let stored = self.parameters.get_mut(&parameter.address).ok_or(DeviceError::Warning {
            code: 2,
            message: "unknown parameter".into(),
        })?;
        stored.value = parameter.value.clone();
        Ok(stored.clone())
    }

    fn sync_time(&mut self) -> Result<(), DeviceError> {
        self.ensure_open()?;
        self.sync_count += 1;
        Ok(())
    }

    fn first_time_ranges(&mut self) -> Result<Option<TimeRanges>, DeviceError> {
        self.range_pos = 0;
        self.next_time_ranges()
    }

    fn next_time_ranges(&mut self) -> Result<Option<TimeRanges>, DeviceError> {
        self.ensure_open()?;
        let item = self.time_ranges.get(self.range_pos).cloned();
        self.range_pos += 1;
        Ok(item)
    }

    fn first_menu_item(&mut self) -> Result<Option<MenuItem>, DeviceError> {
        self.menu_pos = 0;
        self.next_menu_item()
    }

    fn next_menu_item(&mut self) -> Result<Option<MenuItem>, DeviceError> {
        let item = self.step(&self.menu, self.menu_pos);
        self.menu_pos += 1;
        item
    }

    fn first_value_spec(&mut self) -> Result<Option<ValueSpec>, DeviceError> {
        self.spec_pos = 0;
        self.next_value_spec()
    }

    fn next_value_spec(&mut self) -> Result<Option<ValueSpec>, DeviceError> {
        let item = self.step(&self.value_specs, self.spec_pos);
        self.spec_pos += 1;
        item
    }

    fn first_error(&mut self) -> Result<Option<DeviceErrorInfo>, DeviceError> {
        self.error_pos = 0;
        self.next_error()
    }

    fn next_error(&mut self) -> Result<Option<DeviceErrorInfo>, DeviceError> {
        self.ensure_open()?;
        let item = self.errors.get(self.error_pos).cloned();
        self.error_pos += 1;
        Ok(item)
    }
}

#[derive(Debug)]
pub struct RecordingNotifier {
    pub mail_ready: bool,
    pub mails: Vec<Mail>,
    pub published: Vec<Vec<Reading>>,
    pub events: Vec<&'static str>,
}

impl Default for RecordingNotifier {
    fn default() -> Self {
        RecordingNotifier {
            mail_ready: true,
            mails: Vec::new(),
            published: Vec::new(),
            events: Vec::new(),
        }
    }
}

impl Notifier for RecordingNotifier {
    fn mail_ready(&self) -> bool {
        self.mail_ready
    }

    fn send_mail(&mut self, mail: Mail) -> bool {
        if !self.mail_ready || mail.to.is_empty() {
            return false;
        }
        self.mails.push(mail);
        true
    }

    fn publish(&mut self, readings: &[Reading]) {
        self.published.push(readings.to_vec());
    }

    fn broadcast(&mut self, event: &Event) {
        self.events.push(event.name());
    }
}

pub struct FixedProvider {
    pub kind: FactKind,
    pub values: Vec<ProvidedValue>,
}

impl ValueProvider for FixedProvider {
    fn kind(&self) -> FactKind {
        self.kind
    }

    fn scan(&mut self) -> Result<Vec<ProvidedValue>, String> {
        Ok(self.values.clone())
    }
}
