//! Enumerations shared by stream connections and aggregators.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Stream / task state
// ---------------------------------------------------------------------------

/// Subscription state of one stream connection.
///
/// ```text
/// Closed ──open──► Opened ──subscribe──► Subscribed ──unsubscribe──► Unsubscribed
///   ▲                                        │                            │
///   └──────────────── close ─────────────────┴────────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    #[default]
    Closed,
    Opened,
    Subscribed,
    Unsubscribed,
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Opened => write!(f, "opened"),
            Self::Subscribed => write!(f, "subscribed"),
            Self::Unsubscribed => write!(f, "unsubscribed"),
        }
    }
}

/// Whether the task pumping received messages into the stream pipe is alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    #[default]
    Stopped,
    Started,
}

// ---------------------------------------------------------------------------
// Subscription actions
// ---------------------------------------------------------------------------

/// Passed to the subscription builder to pick the wire payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamAction {
    Subscribe,
    Unsubscribe,
}

impl StreamAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
        }
    }
}

impl std::fmt::Display for StreamAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_closed_and_stopped() {
        assert_eq!(StreamState::default(), StreamState::Closed);
        assert_eq!(TaskState::default(), TaskState::Stopped);
    }

    #[test]
    fn action_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&StreamAction::Unsubscribe).unwrap(), "\"unsubscribe\"");
        assert_eq!(StreamAction::Subscribe.to_string(), "subscribe");
    }
}
