//! The poll loop: reconnects, watches the controller state, runs full
//! sweeps and drives aggregation, time sync, alerts and notifications.

use crate::config::Config;
use crate::device::{DeviceError, DeviceProtocol, collect_all};
use crate::gate::DeviceGate;
use crate::models::device::DeviceStatus;
use crate::models::telemetry::{FactKind, Reading, ValueFact, user_defined};
use crate::notify::{Event, Mail, Notifier};
use crate::providers::{ProvidedValue, ValueProvider};
use crate::services::aggregate::AggregationSchedule;
use crate::services::alerts::AlertEngine;
use crate::services::errors::{send_error_mail, update_errors};
use crate::services::interactive::{init_menu, update_time_ranges};
use crate::services::registry::Registry;
use crate::services::samples::record;
use crate::services::timesync::{SyncOutcome, TimeSyncGuard};
use crate::store::{Store, StoreError};
use crate::utils::{format_local, format_value};
use chrono::{DateTime, Duration, Local, TimeDelta, TimeZone, Utc};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

const RECONNECT_BACKOFF: std::time::Duration = std::time::Duration::from_secs(10);
const WAIT_SLICE: std::time::Duration = std::time::Duration::from_millis(500);
const TIME_SYNC_SETTLE: std::time::Duration = std::time::Duration::from_secs(2);

#[derive(Debug)]
pub enum PollError {
    Device(DeviceError),
    Store(StoreError),
}

impl core::fmt::Display for PollError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            PollError::Device(e) => write!(f, "device: {}", e),
            PollError::Store(e) => write!(f, "store: {}", e),
        }
    }
}

impl std::error::Error for PollError {}

impl From<DeviceError> for PollError {
    fn from(value: DeviceError) -> Self {
        PollError::Device(value)
    }
}

impl From<StoreError> for PollError {
    fn from(value: StoreError) -> Self {
        PollError::Store(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Disconnected,
    Connecting,
    Idle,
    StateCheck,
    FullSweep,
}

/// Loop bookkeeping. Only the poll loop writes it.
#[derive(Debug, Clone)]
pub struct PollState {
    pub phase: Phase,
    pub current: Option<DeviceStatus>,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub next_poll_at: DateTime<Utc>,
    pub next_state_check_at: DateTime<Utc>,
    pub next_aggregate_at: DateTime<Utc>,
    pub next_time_sync_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PollSettings {
    pub interval: std::time::Duration,
    pub state_check_interval: std::time::Duration,
    pub aggregate_history_days: u32,
    pub aggregate_interval_minutes: u32,
    pub aggregate_hour: u32,
    pub tsync_enabled: bool,
    pub max_time_leak: std::time::Duration,
    pub tsync_hour: u32,
    pub tsync_settle: std::time::Duration,
    /// Pause after a failed iteration before reconnecting.
    pub reconnect_backoff: std::time::Duration,
    pub web_url: String,
    pub state_mail_to: String,
    pub state_mail_states: Vec<i32>,
    pub error_mail_to: String,
    pub version: String,
}

impl PollSettings {
    pub fn from_config(cfg: &Config) -> Self {
        PollSettings {
            interval: cfg.interval,
            state_check_interval: cfg.state_check_interval,
            aggregate_history_days: cfg.aggregate_history_days,
            aggregate_interval_minutes: cfg.aggregate_interval_minutes,
            aggregate_hour: cfg.aggregate_hour,
            tsync_enabled: cfg.tsync_enabled,
            max_time_leak: cfg.max_time_leak,
            tsync_hour: cfg.tsync_hour,
            tsync_settle: TIME_SYNC_SETTLE,
            reconnect_backoff: RECONNECT_BACKOFF,
            web_url: cfg.web_url.clone(),
            state_mail_to: cfg.mail.state_mail_to.clone(),
            state_mail_states: cfg.mail.state_mail_states.clone(),
            error_mail_to: cfg.mail.error_mail_to.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    fn is_mail_state(&self, state: i32) -> bool {
        self.state_mail_states.is_empty() || self.state_mail_states.contains(&state)
    }
}

fn delta(d: std::time::Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::days(1))
}

/// One value read during a sweep, waiting to be written.
struct Observation {
    fact: ValueFact,
    raw: f64,
    factor: i32,
    text: Option<String>,
}

pub struct Poller<S, D, N> {
    store: S,
    gate: Arc<DeviceGate<D>>,
    notifier: N,
    registry: Registry,
    providers: Vec<Box<dyn ValueProvider>>,
    alerts: AlertEngine,
    aggregation: AggregationSchedule,
    timesync: TimeSyncGuard,
    settings: PollSettings,
    state: PollState,
    catalog_ready: bool,
    state_changed: bool,
}

impl<S: Store, D: DeviceProtocol, N: Notifier> Poller<S, D, N> {
    pub fn new<Tz: TimeZone>(
        store: S,
        gate: Arc<DeviceGate<D>>,
        notifier: N,
        settings: PollSettings,
        now: &DateTime<Tz>,
    ) -> Self {
        let now_utc = now.with_timezone(&Utc);
        let aggregation = AggregationSchedule::new(
            now,
            settings.aggregate_history_days,
            settings.aggregate_interval_minutes,
            settings.aggregate_hour,
        );
        let timesync = TimeSyncGuard::new(
            now,
            settings.tsync_enabled,
            settings.max_time_leak,
            settings.tsync_hour,
            settings.tsync_settle,
        );
        let state = PollState {
            phase: Phase::Disconnected,
            current: None,
            last_poll_at: None,
            next_poll_at: now_utc,
            next_state_check_at: now_utc,
            next_aggregate_at: aggregation.next_at(),
            next_time_sync_at: timesync.next_sync_at(),
        };
        Poller {
            store,
            gate,
            notifier,
            registry: Registry::default(),
            providers: Vec::new(),
            alerts: AlertEngine::new(settings.web_url.clone(), settings.interval),
            aggregation,
            timesync,
            settings,
            state,
            catalog_ready: false,
            state_changed: false,
        }
    }

    pub fn add_provider(&mut self, provider: Box<dyn ValueProvider>) {
        self.providers.push(provider);
    }

    pub fn state(&self) -> &PollState {
        &self.state
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Re-reads the value list, menu tree and time ranges from the controller.
    pub fn refresh_catalog(&mut self) -> Result<(), PollError> {
        let specs = self
            .gate
            .with_exclusive_access(|device| collect_all(device, D::first_value_spec, D::next_value_spec))?;
        self.registry.reconcile_from_device(&mut self.store, &specs)?;
        init_menu::<_, _, PollError>(&*self.gate, &mut self.store, &mut self.registry)?;
        update_time_ranges::<_, _, PollError>(&*self.gate, &mut self.store)?;
        Ok(())
    }

    fn connect(&mut self) -> Result<(), PollError> {
        if !self.store.is_connected() {
            self.state.phase = Phase::Connecting;
            self.store.connect()?;
            info!("Store connected");
        }
        if !self.gate.is_open() {
            self.state.phase = Phase::Connecting;
            self.gate.reopen()?;
            info!("Serial link opened");
        }
        if !self.catalog_ready {
            self.refresh_catalog()?;
            self.catalog_ready = true;
        }
        self.state.phase = Phase::Idle;
        Ok(())
    }

    /// Reads the operating state and schedules an immediate sweep when it changed.
    fn check_state<Tz: TimeZone>(&mut self, now: &DateTime<Tz>) -> Result<(), PollError> {
        self.state.phase = Phase::StateCheck;
        let mut status = self.gate.with_exclusive_access(|device| device.get_status())?;
        if let SyncOutcome::Corrected { status: refreshed } = self.timesync.check(&*self.gate, &status, now)? {
            status = refreshed;
        }
        self.state.next_time_sync_at = self.timesync.next_sync_at();

        let now_utc = now.with_timezone(&Utc);
        let changed = self.state.current.as_ref().is_none_or(|c| c.state != status.state);
        if changed {
            info!("State changed to '{}'", status.state_text);
            self.state.next_poll_at = now_utc;
            self.state_changed = true;
            self.notifier.broadcast(&Event::DeviceState(status.clone()));
        }
        self.state.current = Some(status);
        self.state.next_state_check_at = if self.settings.state_check_interval.is_zero() {
            self.state.next_poll_at
        } else {
            now_utc + delta(self.settings.state_check_interval)
        };
        Ok(())
    }

    /// One loop iteration.
    pub fn tick<Tz: TimeZone>(&mut self, now: &DateTime<Tz>) -> Result<(), PollError> {
        self.connect()?;
        let now_utc = now.with_timezone(&Utc);

        if let Some(Err(e)) = self.aggregation.run_if_due(&mut self.store, now)
            && e.is_connectivity()
        {
            return Err(e.into());
        }
        self.state.next_aggregate_at = self.aggregation.next_at();

        if now_utc >= self.state.next_state_check_at || now_utc >= self.state.next_poll_at {
            self.check_state(now)?;
        }

        if now_utc < self.state.next_poll_at {
            self.state.phase = Phase::Idle;
            return Ok(());
        }

        self.gate.with_exclusive_access(|device| device.check())?;
        self.state.next_poll_at = now_utc + delta(self.settings.interval);
        if !self.settings.state_check_interval.is_zero() {
            self.state.next_state_check_at = now_utc + delta(self.settings.state_check_interval);
        } else {
            self.state.next_state_check_at = self.state.next_poll_at;
        }
        self.sweep(now_utc)?;
        self.state.last_poll_at = Some(now_utc);
        self.state.phase = Phase::Idle;
        Ok(())
    }

    /// Polls every provider. A failing provider is skipped for this sweep.
    fn scan_providers(&mut self) -> Vec<(FactKind, Vec<ProvidedValue>)> {
        let mut scans = Vec::new();
        for provider in self.providers.iter_mut() {
            let kind = provider.kind();
            match provider.scan() {
                Ok(values) => scans.push((kind, values)),
                Err(e) => warn!("{} provider scan failed: {}", kind, e),
            }
        }
        scans
    }

    fn observe(
        &self,
        fact: &ValueFact,
        status: Option<&DeviceStatus>,
        provided: &HashMap<(FactKind, i32), ProvidedValue>,
    ) -> Result<Option<Observation>, DeviceError> {
        let address = fact.address;
        let io = |state: i32| -> (f64, i32, Option<String>) { (f64::from(state), 1, None) };
        let (raw, factor, text) = match fact.kind {
            FactKind::AnalogValue => {
                let raw = self.gate.with_exclusive_access(|device| device.get_value(address))?;
                (f64::from(raw), fact.factor, None)
            }
            FactKind::DigitalOut => io(self.gate.with_exclusive_access(|d| d.get_digital_out(address))?.state),
            FactKind::DigitalIn => io(self.gate.with_exclusive_access(|d| d.get_digital_in(address))?.state),
            FactKind::AnalogOut => io(self.gate.with_exclusive_access(|d| d.get_analog_out(address))?.state),
            FactKind::UserDefined => {
                let Some(status) = status else {
                    return Ok(None);
                };
                match address {
                    user_defined::STATE => (f64::from(status.state), 1, Some(status.state_text.clone())),
                    user_defined::MODE => (f64::from(status.mode), 1, Some(status.mode_text.clone())),
                    user_defined::CLOCK => (status.time.timestamp() as f64, 1, Some(format_local(status.time))),
                    _ => return Ok(None),
                }
            }
            FactKind::OneWire | FactKind::Script => match provided.get(&(fact.kind, address)) {
                Some(v) => (v.value, 1, v.text.clone()),
                None => return Ok(None),
            },
        };
        Ok(Some(Observation {
            fact: fact.clone(),
            raw,
            factor,
            text,
        }))
    }

    fn sweep(&mut self, now: DateTime<Utc>) -> Result<(), PollError> {
        self.state.phase = Phase::FullSweep;
        self.registry.reload(&mut self.store)?;
        let scans = self.scan_providers();
        let provided: HashMap<(FactKind, i32), ProvidedValue> = scans
            .iter()
            .flat_map(|(kind, values)| values.iter().map(move |v| ((*kind, v.address), v.clone())))
            .collect();
        let status = self.state.current.clone();

        let mut observations = Vec::new();
        for fact in self.registry.list_active(None) {
            match self.observe(&fact, status.as_ref(), &provided) {
                Ok(Some(obs)) => observations.push(obs),
                Ok(None) => debug!("No value for {}", fact.key()),
                Err(e) if !e.is_fatal() => warn!("Reading {} failed: {}", fact.key(), e),
                Err(e) => return Err(e.into()),
            }
        }

        // New provider sensors and the samples land together or not at all;
        // the registry is reloaded from the store at the next sweep.
        let registry = &mut self.registry;
        let samples = self.store.transaction(|store| {
            for (kind, values) in &scans {
                registry.reconcile_provided(store, *kind, values)?;
            }
            observations
                .iter()
                .map(|o| record(store, now, o.fact.key(), o.raw, o.factor, o.text.clone()))
                .collect::<Result<Vec<_>, _>>()
        })?;

        for (obs, sample) in observations.iter().zip(&samples) {
            self.registry.update_reading(Reading {
                address: obs.fact.address,
                kind: obs.fact.kind,
                name: obs.fact.name.clone(),
                title: obs.fact.display_title().to_string(),
                unit: obs.fact.unit.clone(),
                value: sample.value,
                text: sample.text.clone(),
                group_id: obs.fact.group_id,
                time: now,
            });
        }
        info!("Sweep stored {} samples", samples.len());

        match self.alerts.check_all(&mut self.store, self.registry.facts(), &mut self.notifier, now) {
            Ok(0) => {}
            Ok(n) => info!("{} alert(s) sent", n),
            Err(e) if e.is_connectivity() => return Err(e.into()),
            Err(e) => warn!("Alert check failed: {}", e),
        }

        let readings = self.registry.readings();
        self.notifier.publish(&readings);
        self.notifier.broadcast(&Event::Values(readings.clone()));
        self.notifier.broadcast(&Event::DaemonState {
            version: self.settings.version.clone(),
            last_sweep: Some(now),
            next_sweep: self.state.next_poll_at,
        });

        if std::mem::take(&mut self.state_changed) {
            self.send_state_mail(&readings);
        }
        self.sync_errors()
    }

    fn send_state_mail(&mut self, readings: &[Reading]) {
        let Some(status) = self.state.current.as_ref() else {
            return;
        };
        if self.settings.state_mail_to.is_empty() || !self.settings.is_mail_state(status.state) {
            return;
        }
        let mut html = String::from("<html>\n <body>\n  <table>\n");
        for r in readings {
            let value = match &r.text {
                Some(text) if !text.is_empty() => text.clone(),
                _ => format!("{} {}", format_value(r.value), r.unit),
            };
            html.push_str(&format!("   <tr><td>{}</td><td>{}</td></tr>\n", r.title, value));
        }
        html.push_str("  </table>\n </body>\n</html>\n");
        let subject = format!("Heizung - Status: {}", status.state_text);
        let mail = Mail::html(&self.settings.state_mail_to, subject, html);
        if self.notifier.send_mail(mail) {
            info!("State mail sent to '{}'", self.settings.state_mail_to);
        }
    }

    fn sync_errors(&mut self) -> Result<(), PollError> {
        let log = self
            .gate
            .with_exclusive_access(|device| collect_all(device, D::first_error, D::next_error))?;
        let sync = update_errors(&mut self.store, &log)?;
        if sync.pending > 0 {
            send_error_mail(&mut self.store, &mut self.notifier, &self.settings.error_mail_to)?;
        }
        if sync.inserted + sync.updated > 0 {
            let errors = self.store.load_device_errors()?;
            self.notifier.broadcast(&Event::Errors(errors));
        }
        Ok(())
    }

    fn recover(&mut self, error: &PollError) {
        match error {
            PollError::Device(e) if e.is_fatal() => {
                warn!("Serial link failed ({}), reopening", e);
                self.gate.close();
                self.state.phase = Phase::Disconnected;
            }
            PollError::Store(e) if e.is_connectivity() => {
                warn!("Store connection lost ({}), reconnecting", e);
                self.store.disconnect();
                self.state.phase = Phase::Disconnected;
            }
            other => warn!("Poll iteration failed: {}", other),
        }
    }

    fn wait_until(&self, until: DateTime<Utc>, shutdown: &AtomicBool) {
        while !shutdown.load(Ordering::SeqCst) {
            let left = until - Utc::now();
            if left <= Duration::zero() {
                return;
            }
            thread::sleep(left.to_std().unwrap_or(WAIT_SLICE).min(WAIT_SLICE));
        }
    }

    /// Runs until `shutdown` is set. Failures back off and retry forever.
    pub fn run_loop(&mut self, shutdown: &AtomicBool) {
        info!(
            "Starting poll loop: interval={}s, state check every {}s",
            self.settings.interval.as_secs(),
            self.settings.state_check_interval.as_secs()
        );
        while !shutdown.load(Ordering::SeqCst) {
            let now = Local::now();
            match self.tick(&now) {
                Ok(()) => {
                    let until = self.state.next_state_check_at.min(self.state.next_poll_at);
                    self.wait_until(until, shutdown);
                }
                Err(e) => {
                    self.recover(&e);
                    info!("Retrying in {} seconds", self.settings.reconnect_backoff.as_secs());
                    self.wait_until(Utc::now() + delta(self.settings.reconnect_backoff), shutdown);
                }
            }
        }
        self.gate.close();
        info!("Poll loop stopped");
    }
}
