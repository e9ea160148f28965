//! Task management for the stitch node.
//!
//! [`TaskManager`] owns the spawning side of the node: it hands out
//! [`TaskExecutor`]s and resolves as a future when a critical task panics,
//! so the binary can exit with a cause instead of limping along without one
//! of its core loops. There is no graceful-shutdown handshake; the process
//! ends abruptly and tasks die with it.

use std::{
    fmt,
    future::Future,
    panic::AssertUnwindSafe,
    pin::Pin,
    task::{Context, Poll, ready},
};

use futures_util::FutureExt;
use tokio::{
    runtime::Handle,
    sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
    task::JoinHandle,
};
use tracing::error;

/// Error emitted when a critical task ended unexpectedly.
#[derive(Debug, thiserror::Error)]
#[error("critical task `{task_name}` ended unexpectedly{}", .reason.as_ref().map(|s| format!(": {s}")).unwrap_or_default())]
pub struct CriticalTaskError {
    /// Name the task was spawned under.
    pub task_name: &'static str,
    /// Panic payload, if one could be extracted.
    pub reason: Option<String>,
}

/// Manages the lifecycle of spawned tasks.
///
/// Resolves as a [`Future`] when a task spawned via
/// [`TaskExecutor::spawn_critical`] panics.
#[derive(Debug)]
pub struct TaskManager {
    handle: Handle,
    panicked_tasks_tx: UnboundedSender<CriticalTaskError>,
    panicked_tasks_rx: UnboundedReceiver<CriticalTaskError>,
}

impl TaskManager {
    /// Create a new manager on the given runtime handle.
    pub fn new(handle: Handle) -> Self {
        let (panicked_tasks_tx, panicked_tasks_rx) = unbounded_channel();
        Self {
            handle,
            panicked_tasks_tx,
            panicked_tasks_rx,
        }
    }

    /// Create a new manager on the current runtime.
    ///
    /// Panics outside a tokio runtime context.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    /// Get an executor that spawns onto this manager's runtime.
    pub fn executor(&self) -> TaskExecutor {
        TaskExecutor {
            handle: self.handle.clone(),
            panicked_tasks_tx: self.panicked_tasks_tx.clone(),
        }
    }
}

impl Future for TaskManager {
    type Output = CriticalTaskError;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match ready!(self.panicked_tasks_rx.poll_recv(cx)) {
            Some(err) => Poll::Ready(err),
            // The manager holds a sender, so this is unreachable in practice.
            None => Poll::Pending,
        }
    }
}

/// Spawns tasks on a tokio runtime and reports critical failures back to the
/// owning [`TaskManager`].
#[derive(Clone)]
pub struct TaskExecutor {
    handle: Handle,
    panicked_tasks_tx: UnboundedSender<CriticalTaskError>,
}

impl fmt::Debug for TaskExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskExecutor").finish_non_exhaustive()
    }
}

impl TaskExecutor {
    /// The underlying runtime handle.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Spawn a regular task.
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(fut)
    }

    /// Spawn a critical task.
    ///
    /// A panic inside the task is caught and reported to the [`TaskManager`],
    /// which resolves with a [`CriticalTaskError`].
    pub fn spawn_critical<F>(&self, name: &'static str, fut: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let panicked_tx = self.panicked_tasks_tx.clone();
        let task = AssertUnwindSafe(fut).catch_unwind().map(move |result| {
            if let Err(panic) = result {
                let reason = panic
                    .downcast_ref::<String>()
                    .cloned()
                    .or_else(|| panic.downcast_ref::<&str>().map(|s| (*s).to_string()));
                error!(task = name, reason = ?reason, "critical task panicked");
                let _ = panicked_tx.send(CriticalTaskError {
                    task_name: name,
                    reason,
                });
            }
        });
        self.handle.spawn(task)
    }
}
