//! Pipeline stages: supervised tasks that move messages between pipes.
//!
//! # Connector shapes
//!
//! ```text
//! pipe_to_pipe         Pipe ──handler──► Pipe
//! stream_to_pipe       Stream ──handler──► Pipe
//! reconnecting         connect ► Stream ──handler──► Pipe ► disconnect (loop)
//! distributor          Pipe ──h1──► Pipe, ──h2──► Pipe, ... (fan-out)
//! collector            Pipe, Pipe, ... ──handler──► Pipe   (fan-in)
//! ```
//!
//! Every connector stops its destination(s) when its source ends, so the
//! end-of-stream marker travels down the whole chain. On cancellation the
//! pipe-sourced connectors first flush what is buffered upstream.

use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::{BoxFuture, join_all};
use futures_util::stream::{BoxStream, Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use wsflow_core::error::{FlowError, FlowResult, PipeError};
use wsflow_core::pipe::{Item, Pipe};
use wsflow_core::supervisor::{ErrorCallback, TaskSupervisor};

use crate::handler::{Handler, handle_and_deliver};

// ---------------------------------------------------------------------------
// pipe_to_pipe
// ---------------------------------------------------------------------------

/// Move every value of `source` through `handler` into `destination` until
/// the source ends.
///
/// Cancellation flushes what is still buffered in `source`, stops
/// `destination` and returns [`FlowError::Cancelled`].
pub async fn pipe_to_pipe<In, Out>(
    label: &str,
    source: &Pipe<In>,
    handler: &Handler<In, Out>,
    destination: &Pipe<Out>,
    cancel: &CancellationToken,
) -> FlowResult<()>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    run_pipe_to_pipe(label, source, handler, destination, cancel, true).await
}

async fn run_pipe_to_pipe<In, Out>(
    label: &str,
    source: &Pipe<In>,
    handler: &Handler<In, Out>,
    destination: &Pipe<Out>,
    cancel: &CancellationToken,
    stop_destination: bool,
) -> FlowResult<()>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                flush_on_cancel(label, source, handler, destination).await;
                if stop_destination {
                    destination.stop();
                }
                return Err(FlowError::Cancelled);
            }
            item = source.get() => item,
        };

        match item {
            Item::Value(value) => {
                let delivered = handle_and_deliver(label, handler, destination, value).await;
                source.task_done();
                delivered?;
            }
            Item::EndOfStream => {
                debug!("[{label}] source ended");
                if stop_destination {
                    destination.stop();
                }
                source.task_done();
                return Ok(());
            }
        }
    }
}

async fn flush_on_cancel<In, Out>(
    label: &str,
    source: &Pipe<In>,
    handler: &Handler<In, Out>,
    destination: &Pipe<Out>,
) where
    In: Send + 'static,
    Out: Send + 'static,
{
    let pending = Item::sentinelize(source.snapshot());
    if pending.len() > 1 {
        warn!("[{label}] cancelled, flushing {} buffered message(s)", pending.len() - 1);
    }
    for item in pending {
        let Item::Value(value) = item else { break };
        match handle_and_deliver(label, handler, destination, value).await {
            Ok(()) => source.task_done(),
            Err(FlowError::Pipe(PipeError::Full)) => {
                error!("[{label}] downstream pipe full while flushing on cancellation, loss of data");
                break;
            }
            Err(e) => {
                error!("[{label}] flush on cancellation aborted: {e}");
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// stream_to_pipe
// ---------------------------------------------------------------------------

/// Move every message of an external stream through `handler` into
/// `destination` until the stream ends.
///
/// With `raise_on_exception = false` a failing stream or handler ends the
/// call with `Ok` so that a reconnecting caller can try again; a closed
/// destination is always reported.
pub async fn stream_to_pipe<S, In, Out>(
    label: &str,
    source: S,
    handler: &Handler<In, Out>,
    destination: &Pipe<Out>,
    raise_on_exception: bool,
    cancel: &CancellationToken,
) -> FlowResult<()>
where
    S: Stream<Item = FlowResult<In>> + Send,
    In: Send + 'static,
    Out: Send + 'static,
{
    run_stream_to_pipe(label, source, handler, destination, raise_on_exception, cancel)
        .await
        .map(|_| ())
}

/// How a non-raising stream run finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamEnd {
    /// The source stream was exhausted.
    Exhausted,
    /// The source or the handler failed and the error was swallowed.
    Lost,
}

async fn run_stream_to_pipe<S, In, Out>(
    label: &str,
    source: S,
    handler: &Handler<In, Out>,
    destination: &Pipe<Out>,
    raise_on_exception: bool,
    cancel: &CancellationToken,
) -> FlowResult<StreamEnd>
where
    S: Stream<Item = FlowResult<In>> + Send,
    In: Send + 'static,
    Out: Send + 'static,
{
    let mut source = pin!(source);
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!("[{label}] cancelled, closing downstream pipe");
                destination.stop();
                return Err(FlowError::Cancelled);
            }
            next = source.next() => next,
        };

        let outcome = match next {
            None => return Ok(StreamEnd::Exhausted),
            Some(Ok(message)) => handle_and_deliver(label, handler, destination, message).await,
            Some(Err(e)) => Err(e),
        };

        if let Err(e) = outcome {
            return stream_failure(label, e, destination, raise_on_exception);
        }
    }
}

fn stream_failure<Out>(
    label: &str,
    err: FlowError,
    destination: &Pipe<Out>,
    raise_on_exception: bool,
) -> FlowResult<StreamEnd> {
    match err {
        FlowError::Pipe(PipeError::Closed) => Err(err),
        FlowError::Cancelled => {
            destination.stop();
            Err(err)
        }
        e if e.is_connection() => {
            warn!("[{label}] websocket connection closed: {e}");
            if raise_on_exception { Err(e) } else { Ok(StreamEnd::Lost) }
        }
        e => {
            error!("[{label}] unexpected error while listening to stream: {e}");
            if raise_on_exception {
                destination.stop();
                Err(e)
            } else {
                Ok(StreamEnd::Lost)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// reconnecting_stream_to_pipe
// ---------------------------------------------------------------------------

/// A message source that can be (re)connected on demand.
#[async_trait]
pub trait ReconnectableSource: Send + Sync + 'static {
    type Message: Send + 'static;

    async fn connect(&self) -> FlowResult<()>;

    async fn disconnect(&self) -> FlowResult<()>;

    /// Messages of the current connection.
    async fn messages(&self) -> FlowResult<BoxStream<'static, FlowResult<Self::Message>>>;
}

/// Keep `source` connected and streaming into `destination`.
///
/// Each attempt connects, streams until the connection ends, then
/// disconnects. The next attempt starts `reconnect_interval` later, whatever
/// ended the previous one. Failed attempts never stop `destination`. The loop
/// ends once `destination` is stopped.
pub async fn reconnecting_stream_to_pipe<Src, Out>(
    label: &str,
    source: &Src,
    handler: &Handler<Src::Message, Out>,
    destination: &Pipe<Out>,
    reconnect_interval: Duration,
    cancel: &CancellationToken,
) -> FlowResult<()>
where
    Src: ReconnectableSource + ?Sized,
    Out: Send + 'static,
{
    loop {
        if destination.is_stopped() {
            info!("[{label}] destination closed, not reconnecting");
            return Ok(());
        }

        let attempt = async {
            source.connect().await?;
            let messages = source.messages().await?;
            run_stream_to_pipe(label, messages, handler, destination, false, cancel).await
        };
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FlowError::Cancelled),
            outcome = attempt => outcome,
        };

        match outcome {
            Ok(StreamEnd::Exhausted) => {
                debug!("[{label}] stream ended, reconnecting in {reconnect_interval:?}");
            }
            Ok(StreamEnd::Lost) => {
                warn!("[{label}] stream lost, reconnecting in {reconnect_interval:?}");
            }
            Err(FlowError::Cancelled) => {
                warn!("[{label}] cancelled, closing downstream pipe");
                disconnect_source(label, source).await;
                destination.stop();
                return Err(FlowError::Cancelled);
            }
            Err(FlowError::Pipe(PipeError::Closed)) => {
                disconnect_source(label, source).await;
                info!("[{label}] destination closed, not reconnecting");
                return Ok(());
            }
            Err(e) if e.is_connection() => {
                warn!("[{label}] websocket connection closed ({e}), reconnecting in {reconnect_interval:?}");
            }
            Err(e) => {
                error!("[{label}] unexpected error while listening ({e}), reconnecting in {reconnect_interval:?}");
            }
        }

        disconnect_source(label, source).await;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!("[{label}] cancelled, closing downstream pipe");
                disconnect_source(label, source).await;
                destination.stop();
                return Err(FlowError::Cancelled);
            }
            _ = tokio::time::sleep(reconnect_interval) => {}
        }
    }
}

async fn disconnect_source<Src: ReconnectableSource + ?Sized>(label: &str, source: &Src) {
    if let Err(e) = source.disconnect().await {
        warn!("[{label}] disconnect failed: {e}");
    }
}

// ---------------------------------------------------------------------------
// distributor / collector
// ---------------------------------------------------------------------------

/// Fan-out: every value of `source` goes through each `(handler, destination)`
/// route concurrently. The end of `source` stops every destination.
pub async fn distributor<In, Out>(
    label: &str,
    source: &Pipe<In>,
    routes: &[(Handler<In, Out>, Pipe<Out>)],
    cancel: &CancellationToken,
) -> FlowResult<()>
where
    In: Clone + Send + 'static,
    Out: Send + 'static,
{
    let stop_all = || routes.iter().for_each(|(_, dest)| dest.stop());

    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                for item in Item::sentinelize(source.snapshot()) {
                    let Item::Value(value) = item else { break };
                    if let Err(e) = distribute(label, routes, value).await {
                        error!("[{label}] flush on cancellation aborted, loss of data: {e}");
                        break;
                    }
                    source.task_done();
                }
                stop_all();
                return Err(FlowError::Cancelled);
            }
            item = source.get() => item,
        };

        match item {
            Item::Value(value) => {
                let distributed = distribute(label, routes, value).await;
                source.task_done();
                distributed?;
            }
            Item::EndOfStream => {
                stop_all();
                source.task_done();
                return Ok(());
            }
        }
    }
}

async fn distribute<In, Out>(
    label: &str,
    routes: &[(Handler<In, Out>, Pipe<Out>)],
    value: In,
) -> FlowResult<()>
where
    In: Clone + Send + 'static,
    Out: Send + 'static,
{
    let deliveries = routes
        .iter()
        .map(|(handler, dest)| handle_and_deliver(label, handler, dest, value.clone()));
    join_all(deliveries).await.into_iter().collect()
}

/// Fan-in: every source runs its own pipe_to_pipe into the shared
/// `destination`, which is stopped once all sources have ended.
pub async fn collector<In, Out>(
    label: &str,
    sources: &[Pipe<In>],
    handler: &Handler<In, Out>,
    destination: &Pipe<Out>,
    cancel: &CancellationToken,
) -> FlowResult<()>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    let runs = sources
        .iter()
        .map(|source| run_pipe_to_pipe(label, source, handler, destination, cancel, false));
    let results = join_all(runs).await;
    destination.stop();

    if cancel.is_cancelled() {
        return Err(FlowError::Cancelled);
    }
    results.into_iter().collect()
}

// ---------------------------------------------------------------------------
// PipelineStage
// ---------------------------------------------------------------------------

type StageRunner = Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, FlowResult<()>> + Send + Sync>;

/// One connector running as a supervised background task.
///
/// The stage owns clones of its pipes and handler, so it can be started again
/// after a stop. Dropping a running stage cancels its task.
pub struct PipelineStage {
    runner: StageRunner,
    supervisor: TaskSupervisor,
}

impl std::fmt::Debug for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineStage")
            .field("label", &self.label())
            .field("running", &self.is_running())
            .finish()
    }
}

impl PipelineStage {
    fn from_runner(label: String, runner: StageRunner) -> Self {
        Self { runner, supervisor: TaskSupervisor::new(label) }
    }

    pub fn pipe_to_pipe<In, Out>(
        label: impl Into<String>,
        source: Pipe<In>,
        handler: Handler<In, Out>,
        destination: Pipe<Out>,
    ) -> Self
    where
        In: Send + 'static,
        Out: Send + 'static,
    {
        let label = label.into();
        let name = label.clone();
        Self::from_runner(
            label,
            Arc::new(move |cancel: CancellationToken| -> BoxFuture<'static, FlowResult<()>> {
                let (name, source, handler, destination) =
                    (name.clone(), source.clone(), handler.clone(), destination.clone());
                Box::pin(async move { pipe_to_pipe(&name, &source, &handler, &destination, &cancel).await })
            }),
        )
    }

    /// `open` is called on every start to obtain a fresh stream.
    pub fn stream_to_pipe<F, S, In, Out>(
        label: impl Into<String>,
        open: F,
        handler: Handler<In, Out>,
        destination: Pipe<Out>,
        raise_on_exception: bool,
    ) -> Self
    where
        F: Fn() -> S + Send + Sync + 'static,
        S: Stream<Item = FlowResult<In>> + Send + 'static,
        In: Send + 'static,
        Out: Send + 'static,
    {
        let label = label.into();
        let name = label.clone();
        Self::from_runner(
            label,
            Arc::new(move |cancel: CancellationToken| -> BoxFuture<'static, FlowResult<()>> {
                let source = open();
                let (name, handler, destination) = (name.clone(), handler.clone(), destination.clone());
                Box::pin(async move {
                    stream_to_pipe(&name, source, &handler, &destination, raise_on_exception, &cancel).await
                })
            }),
        )
    }

    pub fn reconnecting<Src, Out>(
        label: impl Into<String>,
        source: Arc<Src>,
        handler: Handler<Src::Message, Out>,
        destination: Pipe<Out>,
        reconnect_interval: Duration,
    ) -> Self
    where
        Src: ReconnectableSource + ?Sized,
        Out: Send + 'static,
    {
        let label = label.into();
        let name = label.clone();
        Self::from_runner(
            label,
            Arc::new(move |cancel: CancellationToken| -> BoxFuture<'static, FlowResult<()>> {
                let (name, source, handler, destination) =
                    (name.clone(), Arc::clone(&source), handler.clone(), destination.clone());
                Box::pin(async move {
                    reconnecting_stream_to_pipe(
                        &name,
                        source.as_ref(),
                        &handler,
                        &destination,
                        reconnect_interval,
                        &cancel,
                    )
                    .await
                })
            }),
        )
    }

    pub fn distributor<In, Out>(
        label: impl Into<String>,
        source: Pipe<In>,
        routes: Vec<(Handler<In, Out>, Pipe<Out>)>,
    ) -> Self
    where
        In: Clone + Send + 'static,
        Out: Send + 'static,
    {
        let label = label.into();
        let name = label.clone();
        let routes = Arc::new(routes);
        Self::from_runner(
            label,
            Arc::new(move |cancel: CancellationToken| -> BoxFuture<'static, FlowResult<()>> {
                let (name, source, routes) = (name.clone(), source.clone(), Arc::clone(&routes));
                Box::pin(async move { distributor(&name, &source, &routes, &cancel).await })
            }),
        )
    }

    pub fn collector<In, Out>(
        label: impl Into<String>,
        sources: Vec<Pipe<In>>,
        handler: Handler<In, Out>,
        destination: Pipe<Out>,
    ) -> Self
    where
        In: Send + 'static,
        Out: Send + 'static,
    {
        let label = label.into();
        let name = label.clone();
        let sources = Arc::new(sources);
        Self::from_runner(
            label,
            Arc::new(move |cancel: CancellationToken| -> BoxFuture<'static, FlowResult<()>> {
                let (name, sources, handler, destination) =
                    (name.clone(), Arc::clone(&sources), handler.clone(), destination.clone());
                Box::pin(async move { collector(&name, &sources, &handler, &destination, &cancel).await })
            }),
        )
    }

    /// Report task failures to `on_error` instead of the default ERROR log.
    pub fn with_error_callback(mut self, on_error: ErrorCallback) -> Self {
        self.supervisor = TaskSupervisor::with_error_callback(self.label().to_string(), on_error);
        self
    }

    pub fn label(&self) -> &str {
        self.supervisor.name()
    }

    /// Spawn the connector. `false` if it is already running.
    pub fn start(&self) -> bool {
        let runner = Arc::clone(&self.runner);
        self.supervisor.start(move |cancel| runner(cancel))
    }

    /// Cancel the connector and wait for its shutdown path to finish.
    pub async fn stop(&self) {
        self.supervisor.stop().await;
    }

    pub fn stop_nowait(&self) {
        self.supervisor.stop_nowait();
    }

    pub fn is_running(&self) -> bool {
        self.supervisor.is_running()
    }
}
