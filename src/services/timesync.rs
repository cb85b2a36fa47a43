//! Clock drift detection and the once-a-day correction slot.

use crate::device::{DeviceError, DeviceProtocol};
use crate::gate::DeviceGate;
use crate::models::device::DeviceStatus;
use crate::utils::daily_slot;
use chrono::{DateTime, Days, Duration, TimeDelta, TimeZone, Utc};
use log::{info, warn};
use std::thread;

const REPORT_EVERY_MINUTES: i64 = 2;

#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    InSync,
    /// Drift above the threshold; no correction attempted this time.
    Drift { seconds: i64 },
    /// A correction was attempted; carries the status read afterwards.
    Corrected { status: DeviceStatus },
}

#[derive(Debug, Clone)]
pub struct TimeSyncGuard {
    enabled: bool,
    threshold_secs: i64,
    hour: u32,
    settle: std::time::Duration,
    next_sync_at: DateTime<Utc>,
    next_report_at: Option<DateTime<Utc>>,
}

impl TimeSyncGuard {
    /// The first slot is today's correction hour, even if it already passed.
    pub fn new<Tz: TimeZone>(
        now: &DateTime<Tz>,
        enabled: bool,
        threshold: std::time::Duration,
        hour: u32,
        settle: std::time::Duration,
    ) -> Self {
        TimeSyncGuard {
            enabled,
            threshold_secs: i64::try_from(threshold.as_secs()).unwrap_or(i64::MAX),
            hour,
            settle,
            next_sync_at: daily_slot(now, hour),
            next_report_at: None,
        }
    }

    pub fn next_sync_at(&self) -> DateTime<Utc> {
        self.next_sync_at
    }

    /// At most one drift report per `REPORT_EVERY_MINUTES`.
    fn report_due(&mut self, now: DateTime<Utc>) -> bool {
        if self.next_report_at.is_some_and(|at| now <= at) {
            return false;
        }
        self.next_report_at = Some(now + Duration::minutes(REPORT_EVERY_MINUTES));
        true
    }

    /// Compares the controller clock in `status` with `now` and corrects it
    /// when the daily slot has come.
    pub fn check<D: DeviceProtocol, Tz: TimeZone>(
        &mut self,
        gate: &DeviceGate<D>,
        status: &DeviceStatus,
        now: &DateTime<Tz>,
    ) -> Result<SyncOutcome, DeviceError> {
        let now_utc = now.with_timezone(&Utc);
        let drift = (status.time - now_utc).num_seconds();
        if !self.enabled || self.threshold_secs == 0 || drift.abs() <= self.threshold_secs {
            return Ok(SyncOutcome::InSync);
        }

        if self.report_due(now_utc) {
            info!("Time drift is {} seconds", drift);
        }

        if now_utc <= self.next_sync_at {
            return Ok(SyncOutcome::Drift { seconds: drift });
        }

        let tomorrow = now.clone().checked_add_days(Days::new(1)).unwrap_or_else(|| now.clone());
        self.next_sync_at = daily_slot(&tomorrow, self.hour);
        info!("Time drift is {} seconds, syncing now", drift);

        let settle = self.settle;
        let refreshed = gate.with_exclusive_access(|device| {
            match device.sync_time() {
                Ok(()) => info!("Time sync succeeded"),
                Err(e) if !e.is_fatal() => warn!("Time sync failed: {}", e),
                Err(e) => return Err(e),
            }
            // The controller needs a moment to persist the new time.
            thread::sleep(settle);
            device.get_status()
        })?;

        let settled_at = now_utc + TimeDelta::from_std(settle).unwrap_or_default();
        info!("Time drift now {} seconds", (refreshed.time - settled_at).num_seconds());
        Ok(SyncOutcome::Corrected { status: refreshed })
    }
}
