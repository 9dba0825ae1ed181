//! Message handlers applied by pipeline stages.
//!
//! A [`Handler`] is chosen once, when the stage is built. The stage then
//! dispatches on the variant for every message instead of inspecting what the
//! handler returned.

use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::stream::{BoxStream, Stream, StreamExt};
use wsflow_core::error::{FlowError, FlowResult, PipeError};
use wsflow_core::pipe::{Pipe, PutOptions};
use tracing::warn;

type TransformFn<In, Out> = dyn Fn(In) -> anyhow::Result<Out> + Send + Sync;
type AsyncTransformFn<In, Out> = dyn Fn(In) -> BoxFuture<'static, anyhow::Result<Out>> + Send + Sync;
type ProducerFn<In, Out> = dyn Fn(In) -> anyhow::Result<Vec<Out>> + Send + Sync;
type AsyncProducerFn<In, Out> = dyn Fn(In) -> BoxStream<'static, anyhow::Result<Out>> + Send + Sync;

/// How one input message becomes zero or more output messages.
pub enum Handler<In, Out> {
    /// Synchronous 1 → 1.
    Transform(Arc<TransformFn<In, Out>>),
    /// Asynchronous 1 → 1.
    AsyncTransform(Arc<AsyncTransformFn<In, Out>>),
    /// Synchronous 1 → many, in order.
    Producer(Arc<ProducerFn<In, Out>>),
    /// Asynchronous 1 → stream of outputs.
    AsyncProducer(Arc<AsyncProducerFn<In, Out>>),
}

impl<In, Out> Clone for Handler<In, Out> {
    fn clone(&self) -> Self {
        match self {
            Self::Transform(f) => Self::Transform(Arc::clone(f)),
            Self::AsyncTransform(f) => Self::AsyncTransform(Arc::clone(f)),
            Self::Producer(f) => Self::Producer(Arc::clone(f)),
            Self::AsyncProducer(f) => Self::AsyncProducer(Arc::clone(f)),
        }
    }
}

impl<In, Out> std::fmt::Debug for Handler<In, Out> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::Transform(_) => "Transform",
            Self::AsyncTransform(_) => "AsyncTransform",
            Self::Producer(_) => "Producer",
            Self::AsyncProducer(_) => "AsyncProducer",
        };
        f.write_str(kind)
    }
}

impl<In: Send + 'static, Out: Send + 'static> Handler<In, Out> {
    pub fn transform<F>(f: F) -> Self
    where
        F: Fn(In) -> anyhow::Result<Out> + Send + Sync + 'static,
    {
        Self::Transform(Arc::new(f))
    }

    pub fn async_transform<F, Fut>(f: F) -> Self
    where
        F: Fn(In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Out>> + Send + 'static,
    {
        Self::AsyncTransform(Arc::new(move |input| Box::pin(f(input))))
    }

    pub fn producer<F>(f: F) -> Self
    where
        F: Fn(In) -> anyhow::Result<Vec<Out>> + Send + Sync + 'static,
    {
        Self::Producer(Arc::new(f))
    }

    pub fn async_producer<F, S>(f: F) -> Self
    where
        F: Fn(In) -> S + Send + Sync + 'static,
        S: Stream<Item = anyhow::Result<Out>> + Send + 'static,
    {
        Self::AsyncProducer(Arc::new(move |input| f(input).boxed()))
    }

    /// Every output produced for `input`, computed before any of them is put.
    pub async fn outputs(&self, input: In) -> FlowResult<Vec<Out>> {
        match self {
            Self::Transform(f) => f(input).map(|out| vec![out]).map_err(FlowError::Handler),
            Self::AsyncTransform(f) => f(input).await.map(|out| vec![out]).map_err(FlowError::Handler),
            Self::Producer(f) => f(input).map_err(FlowError::Handler),
            Self::AsyncProducer(f) => {
                let mut stream = f(input);
                let mut outputs = Vec::new();
                while let Some(out) = stream.next().await {
                    outputs.push(out.map_err(FlowError::Handler)?);
                }
                Ok(outputs)
            }
        }
    }
}

impl<T: Send + 'static> Handler<T, T> {
    /// Passthrough.
    pub fn identity() -> Self {
        Self::transform(Ok)
    }
}

/// Put `value` into `dest`; a full pipe gets one widened retry budget.
pub(crate) async fn deliver<T>(label: &str, dest: &Pipe<T>, value: T) -> FlowResult<()> {
    match dest.offer(value) {
        Ok(()) => Ok(()),
        Err((PipeError::Closed, _)) => Err(PipeError::Closed.into()),
        Err((PipeError::Full, value)) => {
            warn!("[{label}] destination pipe full, retrying");
            dest.put_with(value, PutOptions::retrying())
                .await
                .map_err(FlowError::from)
        }
    }
}

/// Run `handler` on `input` and deliver each output in order.
pub(crate) async fn handle_and_deliver<In, Out>(
    label: &str,
    handler: &Handler<In, Out>,
    dest: &Pipe<Out>,
    input: In,
) -> FlowResult<()>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    for out in handler.outputs(input).await? {
        deliver(label, dest, out).await?;
    }
    Ok(())
}
