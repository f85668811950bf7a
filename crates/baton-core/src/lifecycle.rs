//! Starts, stops, and restarts the scheduler loop.
//!
//! `stop` is cooperative: it flips the shared stop flag the executors
//! observe, cancels the scheduler's poll loop, snapshot-terminates
//! every tracked worker process, and joins the scheduler task with a
//! bounded wait so a wedged loop can never hang a shutdown forever.
//! Worktree teardown is skipped while stopping (see `crate::executor`)
//! so an interrupted task's workspace survives for inspection.
//!
//! The host process is expected to translate a SIGTERM into a call to
//! [`LifecycleController::stop`] followed by process exit; this type
//! itself has no signal handling of its own.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use baton_store::TaskStore;

use crate::executor::TaskExecutor;
use crate::scheduler::Scheduler;
use crate::worker::ProcessRegistry;

const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Whether the scheduler loop is currently running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatcherStatus {
    Running,
    Stopped,
}

struct RunningHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

pub struct LifecycleController {
    store: Arc<dyn TaskStore>,
    executor: Arc<TaskExecutor>,
    registry: Arc<ProcessRegistry>,
    max_parallel_workers: usize,
    poll_interval: Duration,
    stopping: Arc<AtomicBool>,
    running: AsyncMutex<Option<RunningHandle>>,
}

impl LifecycleController {
    pub fn new(
        store: Arc<dyn TaskStore>,
        executor: Arc<TaskExecutor>,
        registry: Arc<ProcessRegistry>,
        max_parallel_workers: usize,
        poll_interval: Duration,
        stopping: Arc<AtomicBool>,
    ) -> Self {
        Self {
            store,
            executor,
            registry,
            max_parallel_workers,
            poll_interval,
            stopping,
            running: AsyncMutex::new(None),
        }
    }

    /// Start the scheduler loop. Idempotent: a second call while
    /// already running is a no-op.
    pub async fn start(&self) -> DispatcherStatus {
        let mut guard = self.running.lock().await;
        if guard.is_some() {
            return DispatcherStatus::Running;
        }

        self.stopping.store(false, Ordering::SeqCst);
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&self.store),
            Arc::clone(&self.executor),
            self.max_parallel_workers,
            self.poll_interval,
        ));
        let cancel = CancellationToken::new();
        let join = scheduler.spawn(cancel.clone());
        *guard = Some(RunningHandle { cancel, join });
        tracing::info!("dispatcher started");
        DispatcherStatus::Running
    }

    /// Stop the scheduler loop and terminate every tracked worker
    /// process. Idempotent: calling `stop` while nothing is running
    /// returns immediately.
    pub async fn stop(&self) -> DispatcherStatus {
        let mut guard = self.running.lock().await;
        let Some(handle) = guard.take() else {
            return DispatcherStatus::Stopped;
        };

        self.stopping.store(true, Ordering::SeqCst);
        handle.cancel.cancel();

        let processes = self.registry.snapshot_all();
        futures::future::join_all(processes.iter().map(|p| p.cancel())).await;

        if tokio::time::timeout(STOP_JOIN_TIMEOUT, handle.join).await.is_err() {
            tracing::warn!("scheduler loop did not stop within timeout");
        }

        tracing::info!("dispatcher stopped");
        DispatcherStatus::Stopped
    }

    /// Stop then start. Returns `Running` once the new loop is spawned.
    pub async fn restart(&self) -> DispatcherStatus {
        self.stop().await;
        self.start().await
    }

    pub async fn status(&self) -> DispatcherStatus {
        if self.running.lock().await.is_some() {
            DispatcherStatus::Running
        } else {
            DispatcherStatus::Stopped
        }
    }
}
