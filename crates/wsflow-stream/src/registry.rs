//! Feed registry: builds aggregators from config.

use anyhow::Result;
use wsflow_core::config::FeedConfig;
use wsflow_core::ws::tungstenite_factory;

use crate::aggregator::MultiStreamAggregator;
use crate::connection::{StreamCollaborators, StreamSettings};
use crate::decode::{StreamRecord, record_decoder};
use crate::subscription::{coinbase_builder, separator_pair_to_symbol, separator_symbol_to_pair};

/// Collaborators for a feed: tungstenite transport, separator-based symbol
/// mapping and Coinbase-style subscriptions.
pub fn feed_collaborators(feed: &FeedConfig) -> StreamCollaborators {
    let separator = feed.effective_separator();
    StreamCollaborators {
        ws_factory: tungstenite_factory(),
        pair_to_symbol: separator_pair_to_symbol(separator),
        symbol_to_pair: separator_symbol_to_pair(separator),
        subscription_builder: coinbase_builder(),
    }
}

/// Build the aggregator for one configured feed, decoding into
/// [`StreamRecord`]s.
pub fn create_feed(feed: &FeedConfig) -> Result<MultiStreamAggregator<StreamRecord>> {
    feed.validate()?;
    let collaborators = feed_collaborators(feed);
    let decoder = record_decoder(collaborators.symbol_to_pair.clone());
    Ok(MultiStreamAggregator::new(
        feed.name.clone(),
        StreamSettings::from_feed(feed),
        &feed.channels,
        &feed.pairs,
        collaborators,
        decoder,
    ))
}
