//! Lifecycle owner for exactly one background task.
//!
//! A [`TaskSupervisor`] spawns a future on the tokio runtime, hands it a
//! [`CancellationToken`], and reports how it ended. Cancellation is
//! cooperative: `stop()` fires the token and waits for the task to run its own
//! shutdown path (flushing pipes, disconnecting transports) instead of
//! aborting it mid-await.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{FlowError, FlowResult};

/// Invoked with `(task_name, error)` when a supervised task fails.
///
/// Not called for [`FlowError::Cancelled`].
pub type ErrorCallback = Arc<dyn Fn(&str, &FlowError) + Send + Sync>;

struct RunningTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct TaskSupervisor {
    name: String,
    on_error: ErrorCallback,
    running: Mutex<Option<RunningTask>>,
}

impl std::fmt::Debug for TaskSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSupervisor")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}

fn log_error(name: &str, err: &FlowError) {
    error!("[{name}] task failed: {err}");
}

impl TaskSupervisor {
    /// Supervisor whose failures are logged at ERROR level.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_error_callback(name, Arc::new(log_error))
    }

    pub fn with_error_callback(name: impl Into<String>, on_error: ErrorCallback) -> Self {
        Self {
            name: name.into(),
            on_error,
            running: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    /// Spawn `task`. Returns `false` (and spawns nothing) if a previous task
    /// is still alive.
    pub fn start<F, Fut>(&self, task: F) -> bool
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = FlowResult<()>> + Send + 'static,
    {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            warn!("[{}] start requested while already running", self.name);
            return false;
        }

        let cancel = CancellationToken::new();
        let fut = task(cancel.clone());
        let name = self.name.clone();
        let on_error = Arc::clone(&self.on_error);

        let handle = tokio::spawn(async move {
            match fut.await {
                Ok(()) => debug!("[{name}] task finished"),
                Err(FlowError::Cancelled) => debug!("[{name}] task cancelled"),
                Err(e) => on_error(&name, &e),
            }
        });

        *running = Some(RunningTask { cancel, handle });
        true
    }

    /// Cancel the task and wait until it has fully wound down.
    pub async fn stop(&self) {
        let task = self.running.lock().take();
        if let Some(task) = task {
            task.cancel.cancel();
            if let Err(e) = task.handle.await {
                if e.is_panic() {
                    error!("[{}] task panicked", self.name);
                }
            }
        }
    }

    /// Cancel the task without waiting for it.
    pub fn stop_nowait(&self) {
        if let Some(task) = self.running.lock().take() {
            task.cancel.cancel();
        }
    }
}

impl Drop for TaskSupervisor {
    fn drop(&mut self) {
        if let Some(task) = self.running.get_mut().take() {
            if !task.handle.is_finished() {
                warn!("[{}] dropped while running, cancelling", self.name);
            }
            task.cancel.cancel();
        }
    }
}
