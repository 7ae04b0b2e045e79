// ABOUTME: Timestamp normalization shared by sources, sinks and watermark state
// ABOUTME: Every watermark is stored as an ISO-8601 string produced here

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

const ISO_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// Render a naive timestamp the way watermarks are persisted.
///
/// Fractional seconds are omitted when zero, so midnight renders as
/// `2024-01-01T00:00:00`.
pub fn format_naive(ts: &NaiveDateTime) -> String {
    ts.format(ISO_FORMAT).to_string()
}

/// Render a UTC timestamp with an explicit offset.
pub fn format_utc(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.f+00:00").to_string()
}

/// Parse the timestamp shapes emitted by PostgreSQL, ClickHouse and this crate.
///
/// Values with an offset are converted to UTC and compared as naive UTC.
pub fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.naive_utc());
    }
    for format in [
        "%Y-%m-%dT%H:%M:%S%.f%:z",
        "%Y-%m-%d %H:%M:%S%.f%:z",
        "%Y-%m-%d %H:%M:%S%.f%#z",
    ] {
        if let Ok(ts) = DateTime::parse_from_str(value, format) {
            return Some(ts.naive_utc());
        }
    }
    for format in [ISO_FORMAT, "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(value, format) {
            return Some(ts);
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// Canonical watermark form of `value`, or the input unchanged if unparseable.
pub fn normalize(value: &str) -> String {
    parse_timestamp(value)
        .map(|ts| format_naive(&ts))
        .unwrap_or_else(|| value.trim().to_string())
}

/// True when `candidate` sorts strictly after `current`.
///
/// Falls back to string comparison when either side does not parse.
pub fn is_after(candidate: &str, current: &str) -> bool {
    match (parse_timestamp(candidate), parse_timestamp(current)) {
        (Some(a), Some(b)) => a > b,
        _ => candidate > current,
    }
}
