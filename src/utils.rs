use chrono::{DateTime, Days, NaiveTime, TimeZone, Utc};

/// Today's `hour:00` in the zone of `now`. DST gaps resolve to the earliest
/// valid instant; a non-existent hour falls back to `now`.
pub fn daily_slot<Tz: TimeZone>(now: &DateTime<Tz>, hour: u32) -> DateTime<Utc> {
    let time = NaiveTime::from_hms_opt(hour.min(23), 0, 0).unwrap_or(NaiveTime::MIN);
    now.timezone()
        .from_local_datetime(&now.date_naive().and_time(time))
        .earliest()
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|| now.with_timezone(&Utc))
}

/// Next occurrence of `hour:00` strictly after `now`.
pub fn next_daily_at<Tz: TimeZone>(now: &DateTime<Tz>, hour: u32) -> DateTime<Utc> {
    let today = daily_slot(now, hour);
    if today > now.with_timezone(&Utc) {
        return today;
    }
    match now.clone().checked_add_days(Days::new(1)) {
        Some(tomorrow) => daily_slot(&tomorrow, hour),
        None => today,
    }
}

/// The controller reports Celsius as a bare degree sign.
pub fn normalize_unit(unit: &str) -> String {
    if unit == "°" { "°C".to_string() } else { unit.to_string() }
}

/// Initial chart bound for a fact without an operator-set one.
pub fn default_max_scale(unit: &str) -> i32 {
    if unit.starts_with('%') { 100 } else { 300 }
}

/// Keeps ASCII letters, digits, `_` and `-`.
pub fn sanitize_name(title: &str) -> String {
    title
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

pub fn format_local(time: DateTime<Utc>) -> String {
    time.with_timezone(&chrono::Local).format("%d.%m.%Y %H:%M:%S").to_string()
}

/// Formats with at most two decimals, dropping trailing zeros.
pub fn format_value(value: f64) -> String {
    let s = format!("{:.2}", value);
    let s = s.trim_end_matches('0').trim_end_matches('.');
    if s == "-0" { "0".to_string() } else { s.to_string() }
}
