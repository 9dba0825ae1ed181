//! # wsflow-stream
//!
//! Streaming stages and WebSocket subscriptions built on `wsflow-core`.
//!
//! ## Architecture
//!
//! A [`MultiStreamAggregator`](aggregator::MultiStreamAggregator) owns one
//! [`StreamConnection`](connection::StreamConnection) per channel × pair. Each
//! connection's pipe runs through a chain of
//! [`PipelineStage`](stage::PipelineStage)s (timestamp normalization, sequence
//! audit, decoding) and a collector merges every chain into one output pipe.
//!
//! ## Modules
//!
//! - [`handler`]: `Handler` shapes applied by stages
//! - [`stage`]: pipe/stream connectors and the supervised `PipelineStage`
//! - [`connection`]: subscription state machine with auto-reconnect
//! - [`aggregator`]: fan-in of many streams
//! - [`sequence`]: per-stream sequence-number audit
//! - [`normalize`]: timestamp normalization
//! - [`decode`]: Coinbase Advanced Trade message decoding
//! - [`subscription`]: subscription payloads and symbol resolvers
//! - [`registry`]: aggregators from feed config
//! - [`json_util`]: JSON parsing helpers

pub mod aggregator;
pub mod connection;
pub mod decode;
pub mod handler;
pub mod json_util;
pub mod normalize;
pub mod registry;
pub mod sequence;
pub mod stage;
pub mod subscription;

#[cfg(test)]
pub(crate) mod test_support;

pub use aggregator::MultiStreamAggregator;
pub use connection::{StreamCollaborators, StreamConnection, StreamSettings};
pub use decode::StreamRecord;
pub use handler::Handler;
pub use stage::{PipelineStage, ReconnectableSource};
