//! Coinbase Advanced Trade WebSocket message decoder.
//!
//! Routes by the top-level `channel` field:
//!
//! - `user` → one [`CumulativeOrderUpdate`] per order in every event
//! - `market_trades` → one [`MarketTrade`] per trade in every event
//!
//! Everything else (`heartbeats`, `subscriptions` acks, unknown channels) is
//! dropped. Malformed messages are logged and dropped so a single bad frame
//! never stops a stream.

use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use wsflow_core::time_util;

use crate::connection::SymbolToPair;
use crate::handler::Handler;
use crate::json_util::{parse_f64_field, parse_str_f64};

/// Cumulative state of one order as reported by the `user` channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CumulativeOrderUpdate {
    pub client_order_id: String,
    pub exchange_order_id: String,
    /// Exchange status string (`OPEN`, `FILLED`, `CANCELLED`, ...).
    pub status: String,
    pub trading_pair: String,
    /// Epoch seconds of the message carrying the update.
    pub fill_timestamp: f64,
    pub average_price: f64,
    pub cumulative_base_amount: f64,
    pub remainder_base_amount: f64,
    pub cumulative_fee: f64,
    pub is_taker: bool,
}

/// One public trade from the `market_trades` channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketTrade {
    pub trade_id: String,
    pub trading_pair: String,
    pub price: f64,
    pub size: f64,
    pub is_buy: bool,
    /// Epoch seconds of the trade.
    pub timestamp: f64,
}

/// Decoded output of a stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum StreamRecord {
    OrderUpdate(CumulativeOrderUpdate),
    Trade(MarketTrade),
}

impl std::fmt::Display for StreamRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OrderUpdate(u) => write!(
                f,
                "order {} {} {} filled={} left={} avg={}",
                u.trading_pair,
                u.client_order_id,
                u.status,
                u.cumulative_base_amount,
                u.remainder_base_amount,
                u.average_price
            ),
            Self::Trade(t) => write!(
                f,
                "trade {} {} {}@{} {}",
                t.trading_pair,
                t.trade_id,
                t.size,
                t.price,
                if t.is_buy { "buy" } else { "sell" }
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct WireEnvelope {
    channel: String,
    #[serde(default)]
    timestamp: Value,
    #[serde(default)]
    events: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct WireUserEvent {
    #[serde(default)]
    orders: Vec<WireOrder>,
}

#[derive(Debug, Deserialize)]
struct WireOrder {
    order_id: String,
    #[serde(default)]
    client_order_id: String,
    status: String,
    product_id: String,
    #[serde(default)]
    order_type: String,
    #[serde(flatten)]
    amounts: Value,
}

#[derive(Debug, Deserialize)]
struct WireTradesEvent {
    #[serde(default)]
    trades: Vec<WireTrade>,
}

#[derive(Debug, Deserialize)]
struct WireTrade {
    trade_id: String,
    product_id: String,
    price: Value,
    size: Value,
    side: String,
    #[serde(default)]
    time: Value,
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode one message into zero or more records.
pub async fn decode_message(message: &Value, symbol_to_pair: &SymbolToPair) -> Vec<StreamRecord> {
    let envelope = match WireEnvelope::deserialize(message) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!("dropping message without channel: {e}");
            return Vec::new();
        }
    };

    match envelope.channel.as_str() {
        "user" => decode_user(&envelope, symbol_to_pair).await,
        "market_trades" => decode_trades(&envelope, symbol_to_pair).await,
        _ => Vec::new(),
    }
}

async fn decode_user(envelope: &WireEnvelope, symbol_to_pair: &SymbolToPair) -> Vec<StreamRecord> {
    let fill_timestamp = time_util::value_to_secs(&envelope.timestamp).unwrap_or_else(time_util::now_secs);
    let mut records = Vec::new();

    for event in &envelope.events {
        let event = match WireUserEvent::deserialize(event) {
            Ok(event) => event,
            Err(e) => {
                warn!("malformed user event dropped: {e}");
                continue;
            }
        };
        for order in event.orders {
            let trading_pair = match symbol_to_pair(order.product_id.clone()).await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("unknown product {} in order {}: {e}", order.product_id, order.order_id);
                    continue;
                }
            };
            let amount = |key: &str| parse_f64_field(&order.amounts, key).unwrap_or(0.0);
            records.push(StreamRecord::OrderUpdate(CumulativeOrderUpdate {
                client_order_id: order.client_order_id.clone(),
                exchange_order_id: order.order_id.clone(),
                status: order.status.clone(),
                trading_pair,
                fill_timestamp,
                average_price: amount("avg_price"),
                cumulative_base_amount: amount("cumulative_quantity"),
                remainder_base_amount: amount("leaves_quantity"),
                cumulative_fee: amount("total_fees"),
                is_taker: order.order_type.eq_ignore_ascii_case("market"),
            }));
        }
    }
    records
}

async fn decode_trades(envelope: &WireEnvelope, symbol_to_pair: &SymbolToPair) -> Vec<StreamRecord> {
    let mut records = Vec::new();

    for event in &envelope.events {
        let event = match WireTradesEvent::deserialize(event) {
            Ok(event) => event,
            Err(e) => {
                warn!("malformed market_trades event dropped: {e}");
                continue;
            }
        };
        for trade in event.trades {
            let (Some(price), Some(size)) = (parse_str_f64(Some(&trade.price)), parse_str_f64(Some(&trade.size)))
            else {
                warn!("trade {} without price or size dropped", trade.trade_id);
                continue;
            };
            let trading_pair = match symbol_to_pair(trade.product_id.clone()).await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("unknown product {} in trade {}: {e}", trade.product_id, trade.trade_id);
                    continue;
                }
            };
            let timestamp = time_util::value_to_secs(&trade.time)
                .or_else(|| time_util::value_to_secs(&envelope.timestamp))
                .unwrap_or_else(time_util::now_secs);
            records.push(StreamRecord::Trade(MarketTrade {
                trade_id: trade.trade_id,
                trading_pair,
                price,
                size,
                is_buy: trade.side.eq_ignore_ascii_case("buy"),
                timestamp,
            }));
        }
    }
    records
}

/// Decoder stage handler resolving products through `symbol_to_pair`.
pub fn record_decoder(symbol_to_pair: SymbolToPair) -> Handler<Value, StreamRecord> {
    Handler::async_producer(move |message: Value| {
        let symbol_to_pair = Arc::clone(&symbol_to_pair);
        stream::once(async move { decode_message(&message, &symbol_to_pair).await })
            .flat_map(|records| stream::iter(records.into_iter().map(Ok::<_, anyhow::Error>)))
    })
}
