//! Core dispatcher logic: configuration, git serialization, worker
//! supervision, worktree isolation, merge integration, task execution,
//! scheduling, and lifecycle control.
//!
//! [`Dispatcher`] bundles the shared handles every one of those pieces
//! needs (the task store, port allocator, process registry, worktree
//! manager, and the process-wide git lock) so a host -- the CLI's
//! `serve` command, or a test -- can build it once and hand it to both
//! the scheduler loop and an HTTP façade.

pub mod config;
pub mod executor;
pub mod git_lock;
pub mod integration;
pub mod lifecycle;
pub mod scheduler;
pub mod session_log;
pub mod worker;
pub mod worktree;

pub use config::{AgentConfig, ConfigError, WorkerOptions};
pub use executor::TaskExecutor;
pub use git_lock::{new_git_lock, GitLock};
pub use integration::{IntegrationError, IntegrationPipeline};
pub use lifecycle::{DispatcherStatus, LifecycleController};
pub use scheduler::Scheduler;
pub use session_log::{LogDocument, LogSummary};
pub use worker::{ProcessRegistry, RunArgs, RunOutcome, SupervisorError, WorkerSupervisor};
pub use worktree::{CommitInfo, WorktreeError, WorktreeInfo, WorktreeManager};

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Context;
use baton_store::{JsonTaskStore, PortAllocator, TaskStore};

/// Generate a new 8-char lowercase hex task id.
pub fn new_task_id() -> String {
    format!("{:08x}", rand::random::<u32>())
}

/// Every shared component a running dispatcher needs, built once at
/// startup from a project root and its resolved configuration.
pub struct Dispatcher {
    pub config: AgentConfig,
    pub store: Arc<dyn TaskStore>,
    pub ports: Arc<PortAllocator>,
    pub registry: Arc<ProcessRegistry>,
    pub worktrees: Arc<WorktreeManager>,
    pub git_lock: GitLock,
    pub project_root: PathBuf,
    pub data_dir: PathBuf,
    pub stopping: Arc<AtomicBool>,
}

impl Dispatcher {
    /// Open (or lazily create) a dispatcher rooted at `project_root`.
    ///
    /// `project_root` must already be a git repository; `data/` is
    /// created under it if missing.
    pub fn new(project_root: PathBuf, config: AgentConfig) -> anyhow::Result<Self> {
        let data_dir = project_root.join("data");
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create data directory at {}", data_dir.display()))?;

        let git_lock = new_git_lock();
        let worktrees = WorktreeManager::new(&project_root, git_lock.clone())
            .context("failed to open worktree manager")?;

        Ok(Self {
            store: Arc::new(JsonTaskStore::new(&data_dir)),
            ports: Arc::new(PortAllocator::new(config.port_range_start, config.port_range_end)),
            registry: Arc::new(ProcessRegistry::new()),
            worktrees: Arc::new(worktrees),
            git_lock,
            project_root,
            data_dir,
            stopping: Arc::new(AtomicBool::new(false)),
            config,
        })
    }

    /// Build the task executor shared by the scheduler loop.
    pub fn executor(&self) -> Arc<TaskExecutor> {
        Arc::new(TaskExecutor::new(
            self.config.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.ports),
            Arc::clone(&self.registry),
            Arc::clone(&self.worktrees),
            self.git_lock.clone(),
            self.data_dir.clone(),
            Arc::clone(&self.stopping),
        ))
    }

    /// Build the lifecycle controller that starts/stops the scheduler
    /// loop built around [`Dispatcher::executor`].
    pub fn lifecycle(&self) -> LifecycleController {
        LifecycleController::new(
            Arc::clone(&self.store),
            self.executor(),
            Arc::clone(&self.registry),
            self.config.max_parallel_workers,
            std::time::Duration::from_secs(self.config.poll_interval_seconds),
            Arc::clone(&self.stopping),
        )
    }
}
