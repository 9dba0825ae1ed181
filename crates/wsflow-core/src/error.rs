//! Typed error definitions for the wsflow dataflow core.
//!
//! [`PipeError`] is the narrow error of the queue layer; [`FlowError`] covers
//! everything a stage, stream connection or transport can report. Both are
//! `thiserror` enums so they compose with `anyhow::Result` at the binary edge.

use thiserror::Error;

/// The only two failures a [`Pipe`](crate::pipe::Pipe) operation can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PipeError {
    /// The pipe was stopped; no further values are accepted.
    #[error("pipe is closed")]
    Closed,

    /// The pipe stayed full for the whole retry budget.
    #[error("pipe is full after maximum retries")]
    Full,
}

/// Domain errors for stages, stream connections and transports.
#[derive(Debug, Error)]
pub enum FlowError {
    /// Backpressure or terminal-state failure on a pipe.
    #[error(transparent)]
    Pipe(#[from] PipeError),

    /// A subscription did not reach the `Subscribed` state.
    #[error("stream connection error: {0}")]
    StreamConnection(String),

    /// Transport-level connection loss. Triggers a reconnect, never a stop.
    #[error("connection error: {0}")]
    Connection(String),

    /// WebSocket handshake or framing error.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// A user handler failed while transforming a message.
    #[error("handler error: {0:#}")]
    Handler(anyhow::Error),

    /// Configuration parsing or validation error.
    #[error("config error: {0}")]
    Config(String),

    /// Malformed payload.
    #[error("parse error: {0}")]
    Parse(String),

    /// The owning task was cancelled. Normal shutdown, not a failure.
    #[error("task cancelled")]
    Cancelled,
}

impl FlowError {
    /// `true` for errors the reconnect loop treats as a lost connection.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::WebSocket(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

pub type FlowResult<T> = Result<T, FlowError>;
