//! The scheduler loop: picks up pending tasks and runs them concurrently
//! up to a configured limit.
//!
//! Concurrency is bounded with a counting semaphore rather than a fixed
//! thread pool -- the idiomatic async equivalent of the bounded worker
//! pool this loop is modeled on. An in-memory set of currently-active
//! task ids prevents the same task from being picked up twice across
//! overlapping ticks.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use baton_store::TaskStore;

use crate::executor::TaskExecutor;

pub struct Scheduler {
    store: Arc<dyn TaskStore>,
    executor: Arc<TaskExecutor>,
    max_parallel_workers: usize,
    poll_interval: Duration,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn TaskStore>,
        executor: Arc<TaskExecutor>,
        max_parallel_workers: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            executor,
            max_parallel_workers,
            poll_interval,
        }
    }

    /// Start the loop on its own task. Runs until `cancel` fires.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let semaphore = Arc::new(Semaphore::new(self.max_parallel_workers.max(1)));
            let active: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));

            loop {
                self.tick(&semaphore, &active).await;

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
            tracing::info!("scheduler loop stopped");
        })
    }

    /// One pass: claim as many free slots as there are eligible pending
    /// tasks, oldest first, and hand each off to its own executor run.
    async fn tick(&self, semaphore: &Arc<Semaphore>, active: &Arc<Mutex<HashSet<String>>>) {
        let pending = match self.store.list_pending().await {
            Ok(ids) => ids,
            Err(err) => {
                tracing::warn!(error = %err, "failed to list pending tasks");
                return;
            }
        };

        for task_id in pending {
            {
                let mut guard = active.lock().expect("scheduler active-set mutex poisoned");
                if guard.contains(&task_id) {
                    continue;
                }
                guard.insert(task_id.clone());
            }

            let Ok(permit) = Arc::clone(semaphore).try_acquire_owned() else {
                active.lock().expect("scheduler active-set mutex poisoned").remove(&task_id);
                break;
            };

            let executor = Arc::clone(&self.executor);
            let active = Arc::clone(active);
            let id = task_id.clone();
            tokio::spawn(async move {
                executor.run(&id).await;
                active.lock().expect("scheduler active-set mutex poisoned").remove(&id);
                drop(permit);
            });
        }
    }
}
