//! Timestamp normalization preprocessor.
//!
//! Rewrites the top-level `timestamp` field of a message from its exchange
//! representation (RFC-3339 string, numeric string, milliseconds) to epoch
//! seconds as a JSON number. Messages whose timestamp cannot be read pass
//! through unchanged.

use serde_json::Value;
use tracing::debug;
use wsflow_core::time_util;

use crate::handler::Handler;

pub const TIMESTAMP_FIELD: &str = "timestamp";

pub fn normalize_timestamp(mut message: Value) -> Value {
    if let Some(field) = message.get_mut(TIMESTAMP_FIELD) {
        match time_util::value_to_secs(field) {
            Some(secs) => *field = Value::from(secs),
            None => debug!("unreadable timestamp {field}, left as is"),
        }
    }
    message
}

pub fn timestamp_normalizer() -> Handler<Value, Value> {
    Handler::transform(|message| Ok(normalize_timestamp(message)))
}
