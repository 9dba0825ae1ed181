//! # wsflow-core
//!
//! Core crate for the wsflow streaming system, providing:
//!
//! - **Pipe** (`pipe`): bounded async FIFO with an in-band end-of-stream sentinel
//! - **Task supervisor** (`supervisor`): start/stop/observe one background task
//! - **Types** (`types`): stream/task states, stream keys, symbol helpers
//! - **Configuration** (`config`): JSON config deserialization
//! - **Error types** (`error`): `PipeError` and `FlowError` via thiserror
//! - **WebSocket** (`ws`): transport trait and tokio-tungstenite client
//! - **Time utilities** (`time_util`): wall-clock and timestamp conversion
//! - **Logging** (`logging`): tracing-based structured logging

pub mod config;
pub mod error;
pub mod logging;
pub mod pipe;
pub mod supervisor;
pub mod time_util;
pub mod types;
pub mod ws;

pub use error::{FlowError, FlowResult, PipeError};
pub use pipe::{Item, Pipe, PutOptions};
pub use supervisor::TaskSupervisor;
pub use types::*;
