//! Subscription payloads and symbol resolvers.
//!
//! Payloads follow the Coinbase Advanced Trade shape, one product and one
//! channel per message:
//!
//! ```json
//! {"type": "subscribe", "product_ids": ["BTC-USD"], "channel": "user"}
//! ```

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::Serialize;
use wsflow_core::error::{FlowError, FlowResult};
use wsflow_core::types::{StreamAction, pair_to_symbol, symbol_to_pair};

use crate::connection::{PairToSymbol, SubscriptionBuilder, SymbolToPair};

#[derive(Debug, Serialize)]
struct SubscriptionMessage<'a> {
    #[serde(rename = "type")]
    action: StreamAction,
    product_ids: [&'a str; 1],
    channel: &'a str,
}

/// Build one subscribe/unsubscribe payload for `channel` on `symbol`.
pub fn subscription_payload(action: StreamAction, channel: &str, symbol: &str) -> FlowResult<serde_json::Value> {
    let message = SubscriptionMessage { action, product_ids: [symbol], channel };
    serde_json::to_value(message).map_err(|e| FlowError::Parse(e.to_string()))
}

/// [`SubscriptionBuilder`] producing Coinbase-style payloads.
pub fn coinbase_builder() -> SubscriptionBuilder {
    Arc::new(
        |action: StreamAction, channel: String, pair: String, to_symbol: PairToSymbol| -> BoxFuture<'static, FlowResult<serde_json::Value>> {
            Box::pin(async move {
                let symbol = to_symbol(pair).await?;
                subscription_payload(action, &channel, &symbol)
            })
        },
    )
}

/// Pair → exchange symbol by swapping the `-` separator for `separator`.
pub fn separator_pair_to_symbol(separator: &str) -> PairToSymbol {
    let separator = separator.to_string();
    Arc::new(move |pair: String| -> BoxFuture<'static, FlowResult<String>> {
        let symbol = pair_to_symbol(&pair, &separator);
        Box::pin(async move { Ok(symbol) })
    })
}

/// Exchange symbol → pair, inverse of [`separator_pair_to_symbol`].
pub fn separator_symbol_to_pair(separator: &str) -> SymbolToPair {
    let separator = separator.to_string();
    Arc::new(move |symbol: String| -> BoxFuture<'static, FlowResult<String>> {
        let pair = symbol_to_pair(&symbol, &separator);
        Box::pin(async move { Ok(pair) })
    })
}
