//! Transport seam between the stream state machine and a WebSocket library.
//!
//! A [`WsTransport`] is created per connection attempt by a [`WsFactory`],
//! connected, used for sends from the subscription path and receives from the
//! pumping task concurrently, then disconnected and dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::stream::{self, BoxStream, StreamExt};

use crate::error::FlowResult;

/// One decoded inbound frame.
pub type WsMessage = serde_json::Value;

/// Everything needed to open one connection.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub url: String,
    /// Silence longer than this triggers a ping; twice this drops the link.
    pub ping_timeout: Duration,
    pub headers: HashMap<String, String>,
}

#[async_trait]
pub trait WsTransport: Send + Sync + 'static {
    async fn connect(&self, request: &ConnectRequest) -> FlowResult<()>;

    async fn disconnect(&self) -> FlowResult<()>;

    async fn send(&self, payload: serde_json::Value) -> FlowResult<()>;

    /// Next decoded message. `Ok(None)` once the peer has closed.
    async fn receive(&self) -> FlowResult<Option<WsMessage>>;

    /// All remaining messages as a stream; ends when the peer closes.
    fn iter_messages(self: Arc<Self>) -> BoxStream<'static, FlowResult<WsMessage>> {
        stream::unfold(self, |transport| async move {
            match transport.receive().await {
                Ok(Some(msg)) => Some((Ok(msg), transport)),
                Ok(None) => None,
                Err(e) => Some((Err(e), transport)),
            }
        })
        .boxed()
    }
}

/// Produces a fresh, unconnected transport.
pub type WsFactory = Arc<dyn Fn() -> BoxFuture<'static, FlowResult<Arc<dyn WsTransport>>> + Send + Sync>;
