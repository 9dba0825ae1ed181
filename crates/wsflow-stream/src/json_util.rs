//! Shared JSON parsing helpers used by the decoders and preprocessors.
//!
//! Exchanges encode numeric values either as JSON strings (`"30000.5"`) or as
//! native numbers (`30000.5`); these helpers accept both.

use serde_json::Value;

/// Parse a JSON value (string or number) as `f64`.
#[inline]
pub fn parse_str_f64(v: Option<&Value>) -> Option<f64> {
    let v = v?;
    if let Some(s) = v.as_str() {
        fast_float2::parse(s).ok()
    } else {
        v.as_f64()
    }
}

/// Parse a JSON value (string or number) as `u64`.
#[inline]
pub fn parse_str_u64(v: Option<&Value>) -> Option<u64> {
    let v = v?;
    if let Some(s) = v.as_str() {
        s.parse().ok()
    } else {
        v.as_u64()
    }
}

/// Parse a named field on a JSON object as `f64` (string or number).
#[inline]
pub fn parse_f64_field(v: &Value, key: &str) -> Option<f64> {
    parse_str_f64(v.get(key))
}

/// Named string field, empty when absent.
#[inline]
pub fn str_field<'a>(v: &'a Value, key: &str) -> &'a str {
    v.get(key).and_then(Value::as_str).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numbers_as_strings_or_numbers() {
        let v = json!({"a": "1.25", "b": 2.5, "c": "x", "n": "42", "m": 7});
        assert_eq!(parse_f64_field(&v, "a"), Some(1.25));
        assert_eq!(parse_f64_field(&v, "b"), Some(2.5));
        assert_eq!(parse_f64_field(&v, "c"), None);
        assert_eq!(parse_f64_field(&v, "missing"), None);
        assert_eq!(parse_str_u64(v.get("n")), Some(42));
        assert_eq!(parse_str_u64(v.get("m")), Some(7));
        assert_eq!(str_field(&v, "c"), "x");
        assert_eq!(str_field(&v, "missing"), "");
    }
}
