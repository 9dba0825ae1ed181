//! WebSocket transport abstraction and its tokio-tungstenite implementation.

pub mod client;
pub mod transport;

pub use client::TungsteniteTransport;
pub use transport::{ConnectRequest, WsFactory, WsMessage, WsTransport};

use std::sync::Arc;

/// Factory producing [`TungsteniteTransport`]s.
pub fn tungstenite_factory() -> WsFactory {
    Arc::new(|| {
        Box::pin(async {
            let transport: Arc<dyn WsTransport> = Arc::new(TungsteniteTransport::new());
            Ok(transport)
        })
    })
}
