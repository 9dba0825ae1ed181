//! Wall-clock helpers and exchange timestamp parsing.
//!
//! Exchanges stamp events with RFC-3339 strings carrying up to nanosecond
//! precision (`2023-02-09T20:33:57.609931463Z`). Downstream consumers work in
//! epoch seconds as `f64`, the same unit `now_secs` returns.

use std::time::{SystemTime, UNIX_EPOCH};

use chrono::DateTime;

#[inline]
fn since_epoch() -> std::time::Duration {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default()
}

/// Current time as **microseconds** since Unix epoch.
#[inline]
pub fn now_us() -> u64 {
    since_epoch().as_micros() as u64
}

/// Current time as **milliseconds** since Unix epoch.
#[inline]
pub fn now_ms() -> u64 {
    since_epoch().as_millis() as u64
}

/// Current time as fractional **seconds** since Unix epoch.
#[inline]
pub fn now_secs() -> f64 {
    since_epoch().as_secs_f64()
}

/// Parse an RFC-3339 timestamp into fractional epoch seconds.
pub fn rfc3339_to_secs(s: &str) -> Option<f64> {
    let dt = DateTime::parse_from_rfc3339(s).ok()?;
    Some(dt.timestamp() as f64 + f64::from(dt.timestamp_subsec_nanos()) / 1e9)
}

/// Best-effort conversion of a JSON timestamp field to epoch seconds.
///
/// Accepts RFC-3339 strings, numeric strings and plain numbers. Numbers larger
/// than `1e11` are taken as milliseconds.
pub fn value_to_secs(v: &serde_json::Value) -> Option<f64> {
    let raw = match v {
        serde_json::Value::String(s) => match rfc3339_to_secs(s) {
            Some(secs) => return Some(secs),
            None => s.parse::<f64>().ok()?,
        },
        serde_json::Value::Number(n) => n.as_f64()?,
        _ => return None,
    };
    Some(if raw > 1e11 { raw / 1000.0 } else { raw })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn clocks_agree() {
        let us = now_us();
        let ms = now_ms();
        assert!(us / 1000 >= ms.saturating_sub(1));
        assert!(now_secs() > 1_600_000_000.0);
    }

    #[test]
    fn parses_nanosecond_rfc3339() {
        let secs = rfc3339_to_secs("2023-02-09T20:33:57.609931463Z").unwrap();
        assert!((secs - 1_675_974_837.609_931_5).abs() < 1e-6);
    }

    #[test]
    fn rejects_garbage() {
        assert!(rfc3339_to_secs("yesterday").is_none());
        assert!(value_to_secs(&json!(null)).is_none());
        assert!(value_to_secs(&json!("not a time")).is_none());
    }

    #[test]
    fn numeric_inputs() {
        assert_eq!(value_to_secs(&json!(1_499_405_658.5)), Some(1_499_405_658.5));
        assert_eq!(value_to_secs(&json!(1_499_405_658_500u64)), Some(1_499_405_658.5));
        assert_eq!(value_to_secs(&json!("1499405658")), Some(1_499_405_658.0));
    }
}
