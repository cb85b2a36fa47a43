use crate::models::telemetry::{Aggregate, FactKey, Peak, Sample};
use crate::store::{Store, StoreError};
use chrono::{DateTime, Utc};

/// Stores one raw observation and widens the all-time peak of its sensor.
///
/// Not atomic on its own; the sweep calls it inside its store transaction.
pub fn record<S: Store>(
    store: &mut S,
    time: DateTime<Utc>,
    key: FactKey,
    raw: f64,
    factor: i32,
    text: Option<String>,
) -> Result<Sample, StoreError> {
    let factor = if factor == 0 { 1 } else { factor };
    let value = raw / f64::from(factor);
    let sample = Sample {
        time,
        address: key.address,
        kind: key.kind,
        aggregate: Aggregate::Raw,
        value,
        text,
        samples: 1,
    };
    store.upsert_sample(&sample)?;

    let peak = match store.find_peak(key)? {
        Some(p) if p.min <= value && value <= p.max => return Ok(sample),
        Some(p) => Peak {
            min: p.min.min(value),
            max: p.max.max(value),
            ..p
        },
        None => Peak {
            address: key.address,
            kind: key.kind,
            min: value,
            max: value,
        },
    };
    store.save_peak(&peak)?;
    Ok(sample)
}
