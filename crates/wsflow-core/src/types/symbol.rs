//! Stream identity and trading-pair / exchange-symbol helpers.
//!
//! Internally every market is a trading pair written `BASE-QUOTE`. Exchanges
//! use their own symbol spelling; the connector supplies async resolvers in
//! both directions, and [`pair_to_symbol`] / [`symbol_to_pair`] cover the
//! common case of a plain separator swap.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Separator used in internal trading-pair names.
pub const PAIR_SEPARATOR: char = '-';

/// Identity of one subscription: a channel on one trading pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamKey {
    pub channel: String,
    pub pair: String,
}

impl StreamKey {
    pub fn new(channel: impl Into<String>, pair: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            pair: pair.into(),
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.channel, self.pair)
    }
}

/// Rewrite `BASE-QUOTE` with the exchange separator (empty string joins).
#[inline]
pub fn pair_to_symbol(pair: &str, separator: &str) -> String {
    pair.replace(PAIR_SEPARATOR, separator)
}

/// Inverse of [`pair_to_symbol`]. An empty separator cannot be inverted and
/// returns the symbol unchanged.
#[inline]
pub fn symbol_to_pair(symbol: &str, separator: &str) -> String {
    if separator.is_empty() {
        symbol.to_string()
    } else {
        symbol.replace(separator, &PAIR_SEPARATOR.to_string())
    }
}
