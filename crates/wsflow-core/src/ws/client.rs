//! [`WsTransport`] over `tokio-tungstenite`.
//!
//! The socket is split once connected: the write half serves subscription
//! sends and pong replies, the read half is owned by whoever calls
//! [`receive`](WsTransport::receive) (the pumping task). Text and binary
//! frames are decoded as JSON; frames that are not JSON are logged and
//! skipped.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex as SyncMutex;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::transport::{ConnectRequest, WsMessage, WsTransport};
use crate::error::{FlowError, FlowResult};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A single TLS WebSocket connection.
pub struct TungsteniteTransport {
    writer: Mutex<Option<SplitSink<WsStream, Message>>>,
    reader: Mutex<Option<SplitStream<WsStream>>>,
    ping_timeout: SyncMutex<Duration>,
    /// Fired by `disconnect` so a pending `receive` releases the read half.
    shutdown: SyncMutex<CancellationToken>,
}

impl Default for TungsteniteTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl TungsteniteTransport {
    pub fn new() -> Self {
        Self {
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            ping_timeout: SyncMutex::new(Duration::from_secs(30)),
            shutdown: SyncMutex::new(CancellationToken::new()),
        }
    }

    async fn send_frame(&self, frame: Message) -> FlowResult<()> {
        let mut writer = self.writer.lock().await;
        let sink = writer
            .as_mut()
            .ok_or_else(|| FlowError::Connection("websocket not connected".into()))?;
        sink.send(frame)
            .await
            .map_err(|e| FlowError::Connection(e.to_string()))
    }
}

fn decode_frame(bytes: &[u8]) -> Option<WsMessage> {
    match serde_json::from_slice(bytes) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!("dropping non-JSON frame ({} bytes): {e}", bytes.len());
            None
        }
    }
}

#[async_trait]
impl WsTransport for TungsteniteTransport {
    async fn connect(&self, request: &ConnectRequest) -> FlowResult<()> {
        info!("connecting to {}", request.url);
        let stream = tokio::time::timeout(request.ping_timeout, connect_ws(request))
            .await
            .map_err(|_| FlowError::Connection(format!("connect to {} timed out", request.url)))??;

        let (write, read) = stream.split();
        *self.writer.lock().await = Some(write);
        *self.reader.lock().await = Some(read);
        *self.ping_timeout.lock() = request.ping_timeout;
        *self.shutdown.lock() = CancellationToken::new();
        info!("connected to {}", request.url);
        Ok(())
    }

    async fn disconnect(&self) -> FlowResult<()> {
        self.shutdown.lock().cancel();
        let writer = self.writer.lock().await.take();
        let closed = match writer {
            Some(mut sink) => sink
                .close()
                .await
                .map_err(|e| FlowError::Connection(e.to_string())),
            None => Ok(()),
        };
        self.reader.lock().await.take();
        closed
    }

    async fn send(&self, payload: serde_json::Value) -> FlowResult<()> {
        debug!("sending {payload}");
        self.send_frame(Message::Text(payload.to_string().into())).await
    }

    async fn receive(&self) -> FlowResult<Option<WsMessage>> {
        let mut reader = self.reader.lock().await;
        let stream = reader
            .as_mut()
            .ok_or_else(|| FlowError::Connection("websocket not connected".into()))?;
        let ping_timeout = *self.ping_timeout.lock();
        let shutdown = self.shutdown.lock().clone();
        let mut pinged = false;

        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => return Ok(None),
                next = tokio::time::timeout(ping_timeout, stream.next()) => next,
            };
            let next = match next {
                Ok(next) => next,
                Err(_) if !pinged => {
                    self.send_frame(Message::Ping(Vec::new().into())).await?;
                    pinged = true;
                    continue;
                }
                Err(_) => {
                    return Err(FlowError::Connection(format!(
                        "no frame within {ping_timeout:?} after ping"
                    )));
                }
            };
            pinged = false;

            match next {
                Some(Ok(Message::Text(text))) => {
                    if let Some(msg) = decode_frame(text.as_bytes()) {
                        return Ok(Some(msg));
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    if let Some(msg) = decode_frame(&data) {
                        return Ok(Some(msg));
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    self.send_frame(Message::Pong(data)).await?;
                }
                Some(Ok(Message::Close(frame))) => {
                    warn!("received close frame: {frame:?}");
                    return Ok(None);
                }
                Some(Ok(_)) => {} // Pong, raw Frame
                Some(Err(e)) => return Err(FlowError::Connection(e.to_string())),
                None => return Ok(None),
            }
        }
    }
}

/// Establish a (TLS) WebSocket connection with the extra handshake headers.
async fn connect_ws(request: &ConnectRequest) -> FlowResult<WsStream> {
    let mut http_request = request
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| FlowError::WebSocket(e.to_string()))?;

    for (key, value) in &request.headers {
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|e| FlowError::WebSocket(format!("bad header name {key}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| FlowError::WebSocket(format!("bad header value for {key}: {e}")))?;
        http_request.headers_mut().insert(name, value);
    }

    let (stream, _response) = tokio_tungstenite::connect_async(http_request)
        .await
        .map_err(|e| FlowError::Connection(e.to_string()))?;
    Ok(stream)
}
