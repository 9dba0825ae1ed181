//! Configuration parsing for wsflow feeds.
//!
//! A single JSON file describes logging and a `feeds` array. Each feed is one
//! WebSocket endpoint whose channels × pairs are merged into one output pipe.
//!
//! # Example config
//!
//! ```json
//! {
//!   "logging": { "level": "info", "dir": "/tmp/log", "file_prefix": "wsflow" },
//!   "feeds": [{
//!     "name": "coinbase_user",
//!     "ws_url": "wss://advanced-trade-ws.coinbase.com",
//!     "channels": ["user", "market_trades"],
//!     "pairs": ["BTC-USD", "ETH-USD"],
//!     "heartbeat_channel": "heartbeats",
//!     "reconnect_interval_sec": 5
//!   }]
//! }
//! ```

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::error::FlowError;

/// Top-level application config, deserialized from a JSON file.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    pub feeds: Vec<FeedConfig>,
}

/// Logging block. `RUST_LOG` takes precedence over `level`.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,

    /// Directory for daily-rotating log files. Console only when absent.
    pub dir: Option<String>,

    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,

    /// Write the file layer as JSON lines.
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_file_prefix() -> String {
    "wsflow".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            dir: None,
            file_prefix: default_file_prefix(),
            json: false,
        }
    }
}

/// One WebSocket endpoint and the channel × pair grid subscribed on it.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    /// Label used in logs (e.g. `"coinbase_user"`).
    pub name: String,

    /// Full WebSocket URL.
    pub ws_url: String,

    /// Channels subscribed for every pair.
    pub channels: Vec<String>,

    /// Trading pairs in `BASE-QUOTE` form.
    pub pairs: Vec<String>,

    /// Channel subscribed right after connecting, outside the state machine.
    pub heartbeat_channel: Option<String>,

    /// Transport ping timeout in seconds (default: 30).
    pub ping_timeout_sec: Option<f64>,

    /// Delay between reconnect attempts in seconds (default: 5).
    pub reconnect_interval_sec: Option<f64>,

    /// Capacity of every pipe in the feed; `0` is unbounded (default: 1000).
    pub pipe_capacity: Option<usize>,

    /// Separator of exchange symbols (default: `"-"`).
    pub symbol_separator: Option<String>,

    /// Extra HTTP headers for the WebSocket handshake.
    pub extra_headers: Option<HashMap<String, String>>,
}

impl FeedConfig {
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.ping_timeout_sec.unwrap_or(30.0).max(0.0))
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs_f64(self.reconnect_interval_sec.unwrap_or(5.0).max(0.0))
    }

    pub fn effective_pipe_capacity(&self) -> usize {
        self.pipe_capacity.unwrap_or(1000)
    }

    pub fn effective_separator(&self) -> &str {
        self.symbol_separator.as_deref().unwrap_or("-")
    }

    pub fn headers(&self) -> HashMap<String, String> {
        self.extra_headers.clone().unwrap_or_default()
    }

    /// Reject configs that could never produce a subscription.
    pub fn validate(&self) -> Result<(), FlowError> {
        let url = url::Url::parse(&self.ws_url)
            .map_err(|e| FlowError::Config(format!("[{}] invalid ws_url: {e}", self.name)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(FlowError::Config(format!(
                "[{}] ws_url scheme must be ws or wss, got {}",
                self.name,
                url.scheme()
            )));
        }
        if self.channels.is_empty() {
            return Err(FlowError::Config(format!("[{}] no channels", self.name)));
        }
        if self.pairs.is_empty() {
            return Err(FlowError::Config(format!("[{}] no pairs", self.name)));
        }
        for (field, value) in [
            ("ping_timeout_sec", self.ping_timeout_sec),
            ("reconnect_interval_sec", self.reconnect_interval_sec),
        ] {
            if let Some(v) = value {
                if !v.is_finite() || v < 0.0 {
                    return Err(FlowError::Config(format!("[{}] {field} must be >= 0", self.name)));
                }
            }
        }
        Ok(())
    }
}

/// Parse and validate a JSON config document.
pub fn parse_config(content: &str) -> anyhow::Result<AppConfig> {
    let config: AppConfig = serde_json::from_str(content)?;
    for feed in &config.feeds {
        feed.validate()?;
    }
    Ok(config)
}

/// Load, parse and validate a JSON config file.
pub fn load_config(path: &std::path::Path) -> anyhow::Result<AppConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_config(&content)
}
