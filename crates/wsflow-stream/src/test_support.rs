//! In-memory transports and sources for unit tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wsflow_core::error::{FlowError, FlowResult};
use wsflow_core::types::StreamAction;
use wsflow_core::ws::{ConnectRequest, WsFactory, WsMessage, WsTransport};

use crate::connection::{PairToSymbol, StreamCollaborators, SubscriptionBuilder, SymbolToPair};
use crate::stage::ReconnectableSource;

/// Reconnectable source whose `connect` results follow a script.
///
/// `messages` is yielded by the first successful connection only; every
/// connection then stays open (pending) until cancelled, unless the source
/// was built with [`ScriptedSource::dropping`].
pub struct ScriptedSource {
    script: Mutex<VecDeque<FlowResult<()>>>,
    messages: Mutex<Option<Vec<i32>>>,
    drops_connections: bool,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
}

impl ScriptedSource {
    pub fn new(script: Vec<FlowResult<()>>, messages: Vec<i32>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            messages: Mutex::new(Some(messages)),
            drops_connections: false,
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
        }
    }

    /// Every connection succeeds and is closed by the peer right away.
    pub fn dropping() -> Self {
        Self {
            drops_connections: true,
            ..Self::new(Vec::new(), Vec::new())
        }
    }

    pub fn connect_calls(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReconnectableSource for ScriptedSource {
    type Message = i32;

    async fn connect(&self) -> FlowResult<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.script.lock().pop_front().unwrap_or(Ok(()))
    }

    async fn disconnect(&self) -> FlowResult<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn messages(&self) -> FlowResult<BoxStream<'static, FlowResult<i32>>> {
        if self.drops_connections {
            return Ok(stream::once(async { Err(FlowError::Connection("closed by peer".into())) }).boxed());
        }
        let batch = self.messages.lock().take().unwrap_or_default();
        Ok(stream::iter(batch.into_iter().map(Ok))
            .chain(stream::pending())
            .boxed())
    }
}

/// Scriptable [`WsTransport`]: records sends, replays pushed messages.
pub struct MockTransport {
    sent: Mutex<Vec<Value>>,
    connected: AtomicBool,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    failing_connects: AtomicUsize,
    fail_sends: AtomicBool,
    cancel_sends: AtomicBool,
    shutdown: Mutex<CancellationToken>,
    inbound_tx: mpsc::UnboundedSender<FlowResult<WsMessage>>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<FlowResult<WsMessage>>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            connected: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            failing_connects: AtomicUsize::new(0),
            fail_sends: AtomicBool::new(false),
            cancel_sends: AtomicBool::new(false),
            shutdown: Mutex::new(CancellationToken::new()),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
        })
    }

    /// Factory handing out this same transport on every call.
    pub fn factory(self: &Arc<Self>) -> WsFactory {
        let mock = Arc::clone(self);
        Arc::new(move || {
            let transport: Arc<dyn WsTransport> = mock.clone();
            Box::pin(async move { Ok(transport) })
        })
    }

    pub fn push(&self, message: WsMessage) {
        let _ = self.inbound_tx.send(Ok(message));
    }

    pub fn push_error(&self, err: FlowError) {
        let _ = self.inbound_tx.send(Err(err));
    }

    pub fn fail_next_connects(&self, n: usize) {
        self.failing_connects.store(n, Ordering::SeqCst);
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn cancel_sends(&self, cancel: bool) {
        self.cancel_sends.store(cancel, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Value> {
        self.sent.lock().clone()
    }

    /// Sent payloads whose `type` field equals `action`.
    pub fn sent_actions(&self, action: StreamAction) -> Vec<Value> {
        self.sent()
            .into_iter()
            .filter(|v| v.get("type").and_then(Value::as_str) == Some(action.as_str()))
            .collect()
    }

    pub fn connect_calls(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WsTransport for MockTransport {
    async fn connect(&self, _request: &ConnectRequest) -> FlowResult<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_connects.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_connects.store(failing - 1, Ordering::SeqCst);
            return Err(FlowError::Connection("connection refused".into()));
        }
        *self.shutdown.lock() = CancellationToken::new();
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> FlowResult<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        self.shutdown.lock().cancel();
        Ok(())
    }

    async fn send(&self, payload: Value) -> FlowResult<()> {
        if self.cancel_sends.load(Ordering::SeqCst) {
            return Err(FlowError::Cancelled);
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(FlowError::WebSocket("send failed".into()));
        }
        self.sent.lock().push(payload);
        Ok(())
    }

    async fn receive(&self) -> FlowResult<Option<WsMessage>> {
        if !self.is_connected() {
            return Err(FlowError::Connection("not connected".into()));
        }
        let shutdown = self.shutdown.lock().clone();
        let mut inbound = self.inbound_rx.lock().await;
        tokio::select! {
            _ = shutdown.cancelled() => Ok(None),
            next = inbound.recv() => next.transpose(),
        }
    }
}

fn identity_resolver() -> Arc<dyn Fn(String) -> BoxFuture<'static, FlowResult<String>> + Send + Sync> {
    Arc::new(|s: String| -> BoxFuture<'static, FlowResult<String>> { Box::pin(async move { Ok(s) }) })
}

/// Collaborators over `mock` with identity symbol mapping and the
/// Coinbase-style subscription builder.
pub fn collaborators(mock: &Arc<MockTransport>) -> StreamCollaborators {
    let pair_to_symbol: PairToSymbol = identity_resolver();
    let symbol_to_pair: SymbolToPair = identity_resolver();
    let subscription_builder: SubscriptionBuilder = crate::subscription::coinbase_builder();
    StreamCollaborators {
        ws_factory: mock.factory(),
        pair_to_symbol,
        symbol_to_pair,
        subscription_builder,
    }
}
