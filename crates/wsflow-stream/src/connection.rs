//! One channel × pair subscription over a WebSocket.
//!
//! A [`StreamConnection`] walks the subscription state machine
//! (`Closed → Opened → Subscribed → Unsubscribed → Closed`) and, once its
//! receiving task is started, keeps the link alive through a reconnecting
//! stage that writes every received message into the connection's own pipe.
//!
//! Subscribe and unsubscribe sends are serialized on one lock. Send failures
//! are logged and leave the state unchanged, except a cancelled send, which
//! closes the connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use wsflow_core::config::FeedConfig;
use wsflow_core::error::{FlowError, FlowResult, PipeError};
use wsflow_core::pipe::Pipe;
use wsflow_core::time_util;
use wsflow_core::types::{StreamAction, StreamKey, StreamState, TaskState};
use wsflow_core::ws::{ConnectRequest, WsFactory, WsMessage, WsTransport};

use crate::handler::Handler;
use crate::stage::{PipelineStage, ReconnectableSource};

/// Async pair → exchange symbol resolver.
pub type PairToSymbol = Arc<dyn Fn(String) -> BoxFuture<'static, FlowResult<String>> + Send + Sync>;

/// Async exchange symbol → pair resolver.
pub type SymbolToPair = Arc<dyn Fn(String) -> BoxFuture<'static, FlowResult<String>> + Send + Sync>;

/// Builds the payload for `(action, channel, pair)`, resolving the symbol
/// through the given [`PairToSymbol`].
pub type SubscriptionBuilder = Arc<
    dyn Fn(StreamAction, String, String, PairToSymbol) -> BoxFuture<'static, FlowResult<serde_json::Value>>
        + Send
        + Sync,
>;

/// Called every time the stream's own channel is (re)subscribed.
pub type SubscribedHook = Arc<dyn Fn(&StreamKey) + Send + Sync>;

/// Connection parameters shared by every stream of a feed.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub ws_url: String,
    pub ping_timeout: Duration,
    pub reconnect_interval: Duration,
    /// Capacity of each stream pipe; `0` is unbounded.
    pub pipe_capacity: usize,
    /// Subscribed on every (re)connect, outside the state machine.
    pub heartbeat_channel: Option<String>,
    pub headers: HashMap<String, String>,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            ws_url: String::new(),
            ping_timeout: Duration::from_secs(30),
            reconnect_interval: Duration::from_secs(5),
            pipe_capacity: 1000,
            heartbeat_channel: None,
            headers: HashMap::new(),
        }
    }
}

impl StreamSettings {
    pub fn from_feed(feed: &FeedConfig) -> Self {
        Self {
            ws_url: feed.ws_url.clone(),
            ping_timeout: feed.ping_timeout(),
            reconnect_interval: feed.reconnect_interval(),
            pipe_capacity: feed.effective_pipe_capacity(),
            heartbeat_channel: feed.heartbeat_channel.clone(),
            headers: feed.headers(),
        }
    }
}

/// Injected behavior a stream needs from its exchange.
#[derive(Clone)]
pub struct StreamCollaborators {
    pub ws_factory: WsFactory,
    pub pair_to_symbol: PairToSymbol,
    pub symbol_to_pair: SymbolToPair,
    pub subscription_builder: SubscriptionBuilder,
}

impl std::fmt::Debug for StreamCollaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamCollaborators").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Link: the state shared with the receiving task
// ---------------------------------------------------------------------------

struct Link {
    key: StreamKey,
    label: String,
    settings: StreamSettings,
    collaborators: StreamCollaborators,
    transport: Mutex<Option<Arc<dyn WsTransport>>>,
    state: Mutex<StreamState>,
    open_lock: tokio::sync::Mutex<()>,
    subscription_lock: tokio::sync::Mutex<()>,
    on_subscribed: Mutex<Vec<SubscribedHook>>,
    pipe: Pipe<WsMessage>,
}

impl Link {
    fn state(&self) -> StreamState {
        *self.state.lock()
    }

    fn set_state(&self, state: StreamState) {
        let previous = std::mem::replace(&mut *self.state.lock(), state);
        if previous != state {
            debug!("[{}] {previous} -> {state}", self.label);
        }
    }

    fn transport(&self) -> Option<Arc<dyn WsTransport>> {
        self.transport.lock().clone()
    }

    fn is_primary(&self, channel: &str) -> bool {
        channel == self.key.channel
    }

    async fn payload(&self, action: StreamAction, channel: &str) -> FlowResult<serde_json::Value> {
        (self.collaborators.subscription_builder)(
            action,
            channel.to_string(),
            self.key.pair.clone(),
            Arc::clone(&self.collaborators.pair_to_symbol),
        )
        .await
    }

    async fn open_connection(&self) -> FlowResult<()> {
        let _guard = self.open_lock.lock().await;
        let state = self.state();
        if state != StreamState::Closed {
            warn!("[{}] open requested while {state}, ignoring", self.label);
            return Ok(());
        }

        match self.connect_transport().await {
            Ok(transport) => {
                *self.transport.lock() = Some(transport);
                self.set_state(StreamState::Opened);
                info!("[{}] connection opened", self.label);
                Ok(())
            }
            Err(e) => {
                error!("[{}] failed to open connection: {e}", self.label);
                Err(e)
            }
        }
    }

    async fn connect_transport(&self) -> FlowResult<Arc<dyn WsTransport>> {
        let transport = (self.collaborators.ws_factory)().await?;
        let request = ConnectRequest {
            url: self.settings.ws_url.clone(),
            ping_timeout: self.settings.ping_timeout,
            headers: self.settings.headers.clone(),
        };
        transport.connect(&request).await?;

        if let Some(heartbeat) = &self.settings.heartbeat_channel {
            let sent = match self.payload(StreamAction::Subscribe, heartbeat).await {
                Ok(payload) => transport.send(payload).await,
                Err(e) => Err(e),
            };
            if let Err(e) = sent {
                if let Err(cleanup) = transport.disconnect().await {
                    warn!("[{}] disconnect after failed heartbeat subscription failed: {cleanup}", self.label);
                }
                return Err(e);
            }
            debug!("[{}] subscribed to heartbeat channel {heartbeat}", self.label);
        }
        Ok(transport)
    }

    async fn send_action(&self, action: StreamAction, channel: &str) -> FlowResult<()> {
        let _guard = self.subscription_lock.lock().await;
        let transport = self
            .transport()
            .ok_or_else(|| FlowError::Connection("websocket not connected".into()))?;
        let payload = self.payload(action, channel).await?;
        transport.send(payload).await
    }

    /// Log and swallow a failed send; a cancelled send closes the connection.
    async fn send_failed(&self, action: StreamAction, channel: &str, err: FlowError) -> FlowResult<()> {
        if err.is_cancelled() {
            warn!("[{}] {action} to {channel} cancelled, closing connection", self.label);
            self.close_connection().await;
            return Err(FlowError::Cancelled);
        }
        error!("[{}] failed to {action} {channel} for {}: {err}", self.label, self.key.pair);
        Ok(())
    }

    async fn subscribe(&self, channel: Option<&str>) -> FlowResult<()> {
        let channel = channel.unwrap_or(&self.key.channel);
        if !self.is_primary(channel) {
            return match self.send_action(StreamAction::Subscribe, channel).await {
                Ok(()) => {
                    info!("[{}] subscribed to auxiliary channel {channel}", self.label);
                    Ok(())
                }
                Err(e) => self.send_failed(StreamAction::Subscribe, channel, e).await,
            };
        }

        match self.state() {
            StreamState::Subscribed => {
                warn!("[{}] already subscribed", self.label);
                return Ok(());
            }
            StreamState::Closed => self.open_connection().await?,
            StreamState::Opened | StreamState::Unsubscribed => {}
        }

        match self.send_action(StreamAction::Subscribe, channel).await {
            Ok(()) => {
                self.set_state(StreamState::Subscribed);
                info!("[{}] Subscribed to {channel} for {}.", self.label, self.key.pair);
                let hooks = self.on_subscribed.lock().clone();
                for hook in hooks {
                    hook(&self.key);
                }
                Ok(())
            }
            Err(e) => self.send_failed(StreamAction::Subscribe, channel, e).await,
        }
    }

    async fn unsubscribe(&self, channel: Option<&str>) -> FlowResult<()> {
        let channel = channel.unwrap_or(&self.key.channel);
        let primary = self.is_primary(channel);
        if primary {
            let state = self.state();
            if state != StreamState::Subscribed {
                warn!("[{}] unsubscribe requested while {state}, ignoring", self.label);
                return Ok(());
            }
        }

        match self.send_action(StreamAction::Unsubscribe, channel).await {
            Ok(()) => {
                if primary {
                    self.set_state(StreamState::Unsubscribed);
                }
                info!("Unsubscribed from {channel} for {}.", self.key.pair);
                Ok(())
            }
            Err(e) => self.send_failed(StreamAction::Unsubscribe, channel, e).await,
        }
    }

    async fn disconnect(&self) {
        let transport = self.transport.lock().take();
        if let Some(transport) = transport {
            if let Err(e) = transport.disconnect().await {
                warn!("[{}] disconnect failed: {e}", self.label);
            }
        }
        self.set_state(StreamState::Closed);
    }

    async fn close_connection(&self) {
        if self.state() == StreamState::Subscribed {
            match self.send_action(StreamAction::Unsubscribe, &self.key.channel).await {
                Ok(()) => {
                    self.set_state(StreamState::Unsubscribed);
                    info!("Unsubscribed from {} for {}.", self.key.channel, self.key.pair);
                }
                Err(e) => error!("[{}] Failed to unsubscribe from channels: {e}", self.label),
            }
        }
        // Stopped before the disconnect so the receiving task cannot reconnect.
        self.pipe.stop();
        self.disconnect().await;
        info!("[{}] connection closed", self.label);
    }
}

#[async_trait]
impl ReconnectableSource for Link {
    type Message = WsMessage;

    async fn connect(&self) -> FlowResult<()> {
        if self.pipe.is_stopped() {
            return Err(PipeError::Closed.into());
        }
        if self.state() == StreamState::Closed {
            self.open_connection().await?;
        }
        if self.state() != StreamState::Subscribed {
            self.subscribe(None).await?;
        }
        match self.state() {
            StreamState::Subscribed => Ok(()),
            state => Err(FlowError::StreamConnection(format!(
                "{} did not subscribe (state {state})",
                self.key
            ))),
        }
    }

    async fn disconnect(&self) -> FlowResult<()> {
        Link::disconnect(self).await;
        Ok(())
    }

    async fn messages(&self) -> FlowResult<BoxStream<'static, FlowResult<WsMessage>>> {
        let transport = self
            .transport()
            .ok_or_else(|| FlowError::Connection("websocket not connected".into()))?;
        Ok(transport.iter_messages())
    }
}

// ---------------------------------------------------------------------------
// StreamConnection
// ---------------------------------------------------------------------------

/// State machine and receiving task of one subscription.
pub struct StreamConnection {
    link: Arc<Link>,
    last_recv_us: Arc<AtomicU64>,
    task: PipelineStage,
}

impl std::fmt::Debug for StreamConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConnection")
            .field("key", &self.link.key)
            .field("state", &self.state())
            .field("task_state", &self.task_state())
            .finish()
    }
}

impl StreamConnection {
    pub fn new(
        channel: impl Into<String>,
        pair: impl Into<String>,
        settings: StreamSettings,
        collaborators: StreamCollaborators,
    ) -> Self {
        let key = StreamKey::new(channel, pair);
        let label = key.to_string();
        let pipe = Pipe::new(settings.pipe_capacity);
        let reconnect_interval = settings.reconnect_interval;
        let link = Arc::new(Link {
            key,
            label: label.clone(),
            settings,
            collaborators,
            transport: Mutex::new(None),
            state: Mutex::new(StreamState::Closed),
            open_lock: tokio::sync::Mutex::new(()),
            subscription_lock: tokio::sync::Mutex::new(()),
            on_subscribed: Mutex::new(Vec::new()),
            pipe: pipe.clone(),
        });

        let last_recv_us = Arc::new(AtomicU64::new(0));
        let clock = Arc::clone(&last_recv_us);
        let stamp = Handler::transform(move |message: WsMessage| {
            clock.store(time_util::now_us(), Ordering::Relaxed);
            Ok(message)
        });
        let task = PipelineStage::reconnecting(
            format!("{label}:recv"),
            Arc::clone(&link),
            stamp,
            pipe,
            reconnect_interval,
        );

        Self { link, last_recv_us, task }
    }

    pub fn key(&self) -> &StreamKey {
        &self.link.key
    }

    pub fn channel(&self) -> &str {
        &self.link.key.channel
    }

    pub fn pair(&self) -> &str {
        &self.link.key.pair
    }

    pub fn state(&self) -> StreamState {
        self.link.state()
    }

    pub fn task_state(&self) -> TaskState {
        if self.task.is_running() {
            TaskState::Started
        } else {
            TaskState::Stopped
        }
    }

    /// Epoch microseconds of the last received message, `0` before any.
    pub fn last_recv_time_us(&self) -> u64 {
        self.last_recv_us.load(Ordering::Relaxed)
    }

    /// The pipe every received message is written to.
    pub fn pipe(&self) -> Pipe<WsMessage> {
        self.link.pipe.clone()
    }

    /// Run `hook` after every successful subscription of the stream's own
    /// channel, including the resubscriptions of the receiving task.
    pub fn on_subscribed(&self, hook: SubscribedHook) {
        self.link.on_subscribed.lock().push(hook);
    }

    /// Connect the transport. Only valid from `Closed`; failures are logged
    /// and returned, leaving the stream `Closed`.
    pub async fn open_connection(&self) -> FlowResult<()> {
        self.link.open_connection().await
    }

    /// Subscribe the stream's own channel (`None`) or an auxiliary one.
    pub async fn subscribe(&self, channel: Option<&str>) -> FlowResult<()> {
        self.link.subscribe(channel).await
    }

    pub async fn unsubscribe(&self, channel: Option<&str>) -> FlowResult<()> {
        self.link.unsubscribe(channel).await
    }

    /// Best-effort unsubscribe, disconnect, and stop the output pipe.
    pub async fn close_connection(&self) {
        self.link.close_connection().await;
    }

    /// Release the transport without stopping the output pipe.
    pub async fn disconnect(&self) {
        self.link.disconnect().await;
    }

    pub fn task_label(&self) -> &str {
        self.task.label()
    }

    /// Start the receiving task. `false` if it is already running.
    pub fn start_task(&self) -> bool {
        self.task.start()
    }

    /// Stop the receiving task. Refused unless the stream is `Closed`.
    pub async fn stop_task(&self) -> bool {
        if !self.can_stop_task() {
            return false;
        }
        self.task.stop().await;
        true
    }

    pub fn stop_task_nowait(&self) -> bool {
        if !self.can_stop_task() {
            return false;
        }
        self.task.stop_nowait();
        true
    }

    fn can_stop_task(&self) -> bool {
        let state = self.state();
        if state != StreamState::Closed {
            error!(
                "[{}] cannot stop the receiving task while {state}, close the connection first",
                self.link.label
            );
            return false;
        }
        true
    }
}
