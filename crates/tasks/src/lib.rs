//! Daemon task management.
//!
//! All long-lived daemon tasks are spawned through a [`TaskManager`] so that
//! shutdown is a single cancel-and-drain operation. A task marked *critical*
//! takes the whole daemon down when it exits unexpectedly.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, trace};

/// Owns every task spawned by the daemon and coordinates graceful shutdown.
#[derive(Debug)]
pub struct TaskManager {
    handle: Handle,
    tracker: TaskTracker,
    on_cancel: CancellationToken,
}

impl TaskManager {
    /// Creates a manager bound to the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime, same as
    /// [`Handle::current`].
    pub fn current() -> Self {
        Self {
            handle: Handle::current(),
            tracker: TaskTracker::new(),
            on_cancel: CancellationToken::new(),
        }
    }

    pub fn task_spawner(&self) -> TaskSpawner {
        TaskSpawner {
            handle: self.handle.clone(),
            tracker: self.tracker.clone(),
            on_cancel: self.on_cancel.clone(),
        }
    }

    /// Token cancelled when shutdown begins (or a critical task dies).
    pub fn cancellation_token(&self) -> CancellationToken {
        self.on_cancel.clone()
    }

    /// Resolves once shutdown has been initiated by anyone.
    pub async fn cancelled(&self) {
        self.on_cancel.cancelled().await
    }

    /// Cancels all tasks and waits for them to finish.
    pub async fn shutdown(self) {
        self.on_cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

/// Cheap handle for spawning tasks onto the manager.
#[derive(Debug, Clone)]
pub struct TaskSpawner {
    handle: Handle,
    tracker: TaskTracker,
    on_cancel: CancellationToken,
}

impl TaskSpawner {
    pub fn build_task(&self) -> TaskBuilder<'_> {
        TaskBuilder { spawner: self, name: None, critical: false }
    }

    /// Token cancelled when the daemon is shutting down. Long-lived tasks
    /// should select on it.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.on_cancel.clone()
    }
}

/// Configures a task before spawning it.
#[derive(Debug)]
pub struct TaskBuilder<'a> {
    spawner: &'a TaskSpawner,
    name: Option<&'static str>,
    critical: bool,
}

impl<'a> TaskBuilder<'a> {
    pub fn name(mut self, name: &'static str) -> Self {
        self.name = Some(name);
        self
    }

    /// An unexpected exit of a critical task initiates daemon shutdown.
    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn spawn<F>(self, fut: F) -> tokio::task::JoinHandle<Option<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let TaskBuilder { spawner, name, critical } = self;
        let name = name.unwrap_or("unnamed");
        let on_cancel = spawner.on_cancel.clone();

        let task = async move {
            trace!(target: "tasks", task = name, "Task started.");

            let result = tokio::select! {
                _ = on_cancel.cancelled() => None,
                res = AssertUnwindSafe(fut).catch_unwind() => match res {
                    Ok(output) => Some(output),
                    Err(_) => {
                        error!(target: "tasks", task = name, "Task panicked.");
                        if critical {
                            on_cancel.cancel();
                        }
                        None
                    }
                },
            };

            if result.is_some() && critical {
                // A critical task is expected to run for the daemon's
                // lifetime; returning at all means something is wrong.
                error!(target: "tasks", task = name, "Critical task exited.");
                on_cancel.cancel();
            }

            trace!(target: "tasks", task = name, "Task finished.");
            result
        };

        spawner.tracker.spawn_on(task, &spawner.handle)
    }
}
