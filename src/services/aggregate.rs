//! Daily downsampling of old raw samples into fixed-width buckets.
//!
//! Each bucket row carries the rounded mean and the number of raw rows it
//! replaces and is stamped with the bucket start. The horizon is aligned
//! down to a bucket boundary so no bucket is ever split between two runs.

use crate::models::telemetry::{Aggregate, FactKey, Sample};
use crate::store::{Store, StoreError};
use crate::utils::next_daily_at;
use chrono::{DateTime, Duration, TimeZone, Utc};
use log::{info, warn};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationState {
    Idle,
    Due,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregateReport {
    pub horizon: DateTime<Utc>,
    pub buckets: usize,
    pub raw_removed: usize,
}

#[derive(Debug, Default)]
struct Bucket {
    sum: f64,
    count: i32,
    /// Newest text in the bucket with its sample time.
    last_text: Option<(DateTime<Utc>, String)>,
}

impl Bucket {
    fn add(&mut self, sample: &Sample) {
        self.sum += sample.value;
        self.count += 1;
        if let Some(text) = &sample.text
            && self.last_text.as_ref().is_none_or(|(at, _)| sample.time >= *at)
        {
            self.last_text = Some((sample.time, text.clone()));
        }
    }
}

fn bucket_start(time: DateTime<Utc>, bucket_secs: i64) -> DateTime<Utc> {
    let ts = time.timestamp();
    DateTime::from_timestamp(ts - ts.rem_euclid(bucket_secs), 0).unwrap_or(time)
}

/// Replaces raw samples older than `history_days` with per-bucket means.
pub fn aggregate<S: Store>(
    store: &mut S,
    now: DateTime<Utc>,
    history_days: u32,
    bucket_minutes: u32,
) -> Result<AggregateReport, StoreError> {
    let bucket_secs = i64::from(bucket_minutes.max(1)) * 60;
    let horizon = bucket_start(now - Duration::days(i64::from(history_days)), bucket_secs);

    store.transaction(|store| {
        let mut buckets: BTreeMap<(FactKey, DateTime<Utc>), Bucket> = BTreeMap::new();
        for sample in store.raw_samples_before(horizon)? {
            buckets
                .entry((sample.key(), bucket_start(sample.time, bucket_secs)))
                .or_default()
                .add(&sample);
        }

        for ((key, start), bucket) in &buckets {
            let mean = (bucket.sum / f64::from(bucket.count) * 100.0).round() / 100.0;
            store.upsert_sample(&Sample {
                time: *start,
                address: key.address,
                kind: key.kind,
                aggregate: Aggregate::Aggregated,
                value: mean,
                text: bucket.last_text.as_ref().map(|(_, text)| text.clone()),
                samples: bucket.count,
            })?;
        }

        let raw_removed = store.delete_raw_samples_before(horizon)?;
        Ok(AggregateReport {
            horizon,
            buckets: buckets.len(),
            raw_removed,
        })
    })
}

/// `Idle -> Due -> Running -> Idle`, once a day at a fixed local hour.
#[derive(Debug, Clone)]
pub struct AggregationSchedule {
    history_days: u32,
    bucket_minutes: u32,
    hour: u32,
    next_at: DateTime<Utc>,
    state: AggregationState,
}

impl AggregationSchedule {
    pub fn new<Tz: TimeZone>(now: &DateTime<Tz>, history_days: u32, bucket_minutes: u32, hour: u32) -> Self {
        let schedule = AggregationSchedule {
            history_days,
            bucket_minutes,
            hour,
            next_at: next_daily_at(now, hour),
            state: AggregationState::Idle,
        };
        if schedule.enabled() {
            info!(
                "Aggregation scheduled for {} (keep {} days raw, {} minute buckets)",
                schedule.next_at, history_days, bucket_minutes
            );
        }
        schedule
    }

    pub fn enabled(&self) -> bool {
        self.history_days > 0
    }

    pub fn state(&self) -> AggregationState {
        self.state
    }

    pub fn next_at(&self) -> DateTime<Utc> {
        self.next_at
    }

    fn poll(&mut self, now: DateTime<Utc>) -> bool {
        if self.state == AggregationState::Idle && self.enabled() && now >= self.next_at {
            self.state = AggregationState::Due;
        }
        self.state == AggregationState::Due
    }

    /// Runs the job when due. A failed run is rescheduled like a successful one.
    pub fn run_if_due<S: Store, Tz: TimeZone>(
        &mut self,
        store: &mut S,
        now: &DateTime<Tz>,
    ) -> Option<Result<AggregateReport, StoreError>> {
        let now_utc = now.with_timezone(&Utc);
        if !self.poll(now_utc) {
            return None;
        }

        self.state = AggregationState::Running;
        let result = aggregate(store, now_utc, self.history_days, self.bucket_minutes);
        match &result {
            Ok(report) => info!(
                "Aggregation: {} buckets written, {} raw samples before {} removed",
                report.buckets, report.raw_removed, report.horizon
            ),
            Err(e) => warn!("Aggregation failed: {}", e),
        }

        self.next_at = next_daily_at(now, self.hour);
        self.state = AggregationState::Idle;
        info!("Next aggregation at {}", self.next_at);
        Some(result)
    }
}
