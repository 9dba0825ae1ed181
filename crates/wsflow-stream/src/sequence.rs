//! Sequence-number auditing.
//!
//! Exchange channels stamp every message with a `sequence_num` that grows by
//! one per message on the connection. A gap means messages were lost, a
//! repeat or a step backwards means a replay. Both are logged; the message is
//! always passed on.

use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::warn;
use wsflow_core::types::StreamKey;

use crate::handler::Handler;
use crate::json_util::parse_str_u64;

/// Outcome of checking one sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCheck {
    /// First number seen for the key.
    First,
    /// Exactly one past the previous number.
    InOrder,
    /// Numbers between the previous and this one were skipped.
    Gap { expected: u64, received: u64 },
    /// Not greater than the previous number.
    Stale { last: u64, received: u64 },
}

/// Last sequence number per stream.
///
/// Not thread-safe. Share it behind a lock (see [`SequenceAuditor::handler`]).
#[derive(Debug, Default)]
pub struct SequenceAuditor {
    last_seq: AHashMap<StreamKey, u64>,
}

impl SequenceAuditor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `seq` for `key` and classify it. Only a higher number moves the
    /// stored position forward.
    #[inline]
    pub fn check(&mut self, key: &StreamKey, seq: u64) -> SequenceCheck {
        let Some(last) = self.last_seq.get_mut(key) else {
            self.last_seq.insert(key.clone(), seq);
            return SequenceCheck::First;
        };
        let previous = *last;
        if seq <= previous {
            return SequenceCheck::Stale { last: previous, received: seq };
        }
        *last = seq;
        if seq == previous + 1 {
            SequenceCheck::InOrder
        } else {
            SequenceCheck::Gap { expected: previous + 1, received: seq }
        }
    }

    pub fn last_seq(&self, key: &StreamKey) -> Option<u64> {
        self.last_seq.get(key).copied()
    }

    /// Forget `key`, e.g. after a resubscription restarted its numbering.
    pub fn reset(&mut self, key: &StreamKey) {
        self.last_seq.remove(key);
    }

    pub fn clear(&mut self) {
        self.last_seq.clear();
    }

    /// Passthrough handler auditing the `sequence_num` field of every message
    /// of `key`. Messages without the field are not audited.
    pub fn handler(auditor: Arc<Mutex<SequenceAuditor>>, key: StreamKey) -> Handler<Value, Value> {
        Handler::transform(move |message: Value| {
            if let Some(seq) = parse_str_u64(message.get("sequence_num")) {
                match auditor.lock().check(&key, seq) {
                    SequenceCheck::Gap { expected, received } => {
                        warn!("[{key}] sequence gap: expected {expected}, received {received}");
                    }
                    SequenceCheck::Stale { last, received } => {
                        warn!("[{key}] stale sequence number {received} (last {last})");
                    }
                    SequenceCheck::First | SequenceCheck::InOrder => {}
                }
            }
            Ok(message)
        })
    }
}
