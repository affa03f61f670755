//! Graceful shutdown coordination via `CancellationToken`.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{QueError, Result};

/// Owns a component's cancellation token and the tasks that watch it.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Get a clone of the cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Initiate shutdown.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether a shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Track a task so [`graceful_shutdown`](Self::graceful_shutdown) waits for it.
    pub fn track(&self, handle: JoinHandle<()>) {
        self.tasks.lock().push(handle);
    }

    /// Number of tracked tasks not yet handed to a drain.
    pub fn tracked(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Cancel the token and wait up to `timeout` for every tracked task.
    pub async fn graceful_shutdown(&self, component: &'static str, timeout: Duration) -> Result<()> {
        self.graceful_shutdown_then(component, timeout, async {}).await
    }

    /// Like [`graceful_shutdown`](Self::graceful_shutdown), running `finalize`
    /// once every task has exited.
    ///
    /// The drain runs on its own task. When `timeout` elapses first the caller
    /// gets [`QueError::Timeout`] but the drain keeps going, so `finalize`
    /// still runs once the stragglers finish.
    pub async fn graceful_shutdown_then<F>(
        &self,
        component: &'static str,
        timeout: Duration,
        finalize: F,
    ) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.shutdown();
        let handles = std::mem::take(&mut *self.tasks.lock());
        info!(
            component,
            task_count = handles.len(),
            timeout_ms = timeout.as_millis(),
            "waiting for tasks to complete"
        );

        let (done_tx, done_rx) = oneshot::channel();
        drop(tokio::spawn(async move {
            for result in futures::future::join_all(handles).await {
                if let Err(e) = result {
                    warn!(component, error = %e, "task ended abnormally during shutdown");
                }
            }
            finalize.await;
            let _ = done_tx.send(());
        }));

        if tokio::time::timeout(timeout, done_rx).await.is_ok() {
            info!(component, "shutdown complete");
            Ok(())
        } else {
            warn!(component, "shutdown timed out after {timeout:?}, drain continues in background");
            Err(QueError::timeout(component, timeout))
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
