//! Drives a single task from claim through completion or failure.
//!
//! A task goes through one of two paths depending on its snapshot at
//! pickup time: a **plan phase**, which asks the worker to analyze the
//! task and produce a plan without touching any files, or a **full
//! execution**, which runs the worker in an isolated worktree and, on
//! success, lands the result through the integration pipeline.
//!
//! Every raised error -- resource exhaustion, subprocess failure,
//! integration failure, or a mid-run stop request -- is caught at the
//! top of [`TaskExecutor::run`] and recorded on the task itself via
//! [`TaskStore::fail`]; this function never panics and never leaves a
//! task in `in_progress` once it returns.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use tracing::Instrument;

use baton_store::{PortAllocator, Task, TaskStore};

use crate::config::AgentConfig;
use crate::git_lock::GitLock;
use crate::integration::IntegrationPipeline;
use crate::session_log::{LogDocument, LogSummary};
use crate::worker::{collect_plan_text, ProcessRegistry, RunArgs, RunOutcome, WorkerSupervisor};
use crate::worktree::WorktreeManager;

/// Runs tasks to completion against a fixed set of shared components.
pub struct TaskExecutor {
    config: AgentConfig,
    store: Arc<dyn TaskStore>,
    ports: Arc<PortAllocator>,
    worktrees: Arc<WorktreeManager>,
    supervisor: WorkerSupervisor,
    git_lock: GitLock,
    data_dir: PathBuf,
    /// Observed cooperatively: set by the lifecycle controller on stop.
    stopping: Arc<AtomicBool>,
}

impl TaskExecutor {
    pub fn new(
        config: AgentConfig,
        store: Arc<dyn TaskStore>,
        ports: Arc<PortAllocator>,
        registry: Arc<ProcessRegistry>,
        worktrees: Arc<WorktreeManager>,
        git_lock: GitLock,
        data_dir: PathBuf,
        stopping: Arc<AtomicBool>,
    ) -> Self {
        let supervisor = WorkerSupervisor::new(registry);
        Self {
            config,
            store,
            ports,
            worktrees,
            supervisor,
            git_lock,
            data_dir,
            stopping,
        }
    }

    /// Run `task_id` to completion. Failures are folded into a
    /// `fail(id, str(err))` call rather than propagated to the caller,
    /// since the scheduler has nothing further to do with them.
    pub async fn run(&self, task_id: &str) {
        let span = tracing::info_span!("task_execution", task_id = %task_id);
        async {
            if let Err(err) = self.run_claimed(task_id).await {
                tracing::warn!(error = %err, "task failed");
                if let Err(store_err) = self.store.fail(task_id, &err.to_string()).await {
                    tracing::error!(error = %store_err, "failed to record task failure");
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run_claimed(&self, task_id: &str) -> anyhow::Result<()> {
        if self.stopping.load(Ordering::SeqCst) {
            bail!("aborted");
        }

        let task = self
            .store
            .load(task_id)
            .await
            .context("failed to load task")?;

        if task.needs_plan_phase() {
            self.run_plan_phase(&task).await
        } else {
            self.run_full_execution(&task).await
        }
    }

    async fn run_plan_phase(&self, task: &Task) -> anyhow::Result<()> {
        let Some(task) = self
            .store
            .claim(&task.id, None)
            .await
            .context("failed to claim task for plan phase")?
        else {
            return Ok(());
        };

        let prompt = format!(
            "{}\n\nAnalyze the above and produce a plan only. Do not write, edit, or delete any files.",
            task.content
        );

        let outcome = self
            .invoke_worker(&task.id, self.worktrees.repo_path().to_path_buf(), prompt, Vec::new())
            .await?;

        if !outcome.succeeded() {
            bail!(
                "worker failed during plan phase (exit {:?}): {}",
                outcome.exit_code,
                outcome.stderr_snippet.clone().unwrap_or_default()
            );
        }

        let plan_text = collect_plan_text(&outcome.events);
        self.store
            .to_plan_review(&task.id, &plan_text)
            .await
            .context("failed to transition task to plan_review")?;
        Ok(())
    }

    async fn run_full_execution(&self, task: &Task) -> anyhow::Result<()> {
        let port = self
            .ports
            .allocate()
            .context("no free worker ports")?;

        let result = self.run_full_execution_claimed(task, port).await;

        if !self.stopping.load(Ordering::SeqCst) {
            let worktrees = Arc::clone(&self.worktrees);
            let task_id = task.id.clone();
            let push_to_remote = self.config.push_to_remote;
            let path = worktrees.worktree_base().join(&task.id);
            match tokio::task::spawn_blocking(move || worktrees.teardown(&path, &task_id, push_to_remote)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::warn!(task_id = %task.id, error = %err, "failed to tear down worktree"),
                Err(err) => tracing::warn!(task_id = %task.id, error = %err, "worktree teardown task panicked"),
            }
        }

        self.ports.release(port);
        result
    }

    async fn run_full_execution_claimed(&self, task: &Task, port: u16) -> anyhow::Result<()> {
        let Some(task) = self
            .store
            .claim(&task.id, Some(port))
            .await
            .context("failed to claim task")?
        else {
            return Ok(());
        };

        let worktrees = Arc::clone(&self.worktrees);
        let task_id = task.id.clone();
        let info = tokio::task::spawn_blocking(move || worktrees.create_worktree(&task_id))
            .await
            .context("worktree creation task panicked")?
            .context("failed to create worktree")?;

        let worktrees = Arc::clone(&self.worktrees);
        let symlink_files = self.config.symlink_files.clone();
        let copy_files = self.config.copy_files.clone();
        let worktree_path = info.path.clone();
        {
            let worktree_path = worktree_path.clone();
            tokio::task::spawn_blocking(move || worktrees.materialize(&worktree_path, &symlink_files, &copy_files))
                .await
                .context("worktree materialize task panicked")?
                .context("failed to materialize worktree")?;
        }

        let mut prompt = String::new();
        if let Some(plan) = &task.plan_content {
            prompt.push_str("Approved plan:\n");
            prompt.push_str(plan);
            prompt.push_str("\n\n");
        }
        prompt.push_str(&task.content);
        prompt.push_str(
            "\n\nWhen finished: commit your changes, run the project's tests, and update PROGRESS.md.",
        );

        let env = vec![("TASK_PORT".to_string(), port.to_string())];
        let outcome = self
            .invoke_worker(&task.id, worktree_path.clone(), prompt, env)
            .await?;

        if !outcome.succeeded() {
            bail!(
                "worker failed (exit {:?}, timed_out={}): {}",
                outcome.exit_code,
                outcome.timed_out,
                outcome.stderr_snippet.clone().unwrap_or_default()
            );
        }

        let pipeline = IntegrationPipeline::new(
            Arc::clone(&self.git_lock),
            self.worktrees.repo_path().to_path_buf(),
            self.config.test_command.clone(),
            self.config.push_to_remote,
            self.config.max_merge_retries,
        );
        let task_id = task.id.clone();
        let wt_path = worktree_path.clone();
        tokio::task::spawn_blocking(move || pipeline.run(&task_id, &wt_path))
            .await
            .context("integration pipeline task panicked")?
            .context("integration failed")?;

        self.store
            .complete(&task.id)
            .await
            .context("failed to mark task completed")?;
        Ok(())
    }

    /// Invoke the worker and persist the resulting session log,
    /// regardless of outcome. Returns an "aborted" error if the stop
    /// event fired while the worker was running.
    async fn invoke_worker(
        &self,
        task_id: &str,
        working_dir: PathBuf,
        prompt: String,
        env: Vec<(String, String)>,
    ) -> anyhow::Result<RunOutcome> {
        let timeout = Duration::from_secs(self.config.claude_code.timeout);
        let mut outcome = self
            .supervisor
            .run(
                task_id,
                &self.config.claude_code,
                RunArgs {
                    working_dir,
                    prompt,
                    env,
                    timeout,
                },
            )
            .await
            .context("failed to run worker")?;

        if self.stopping.load(Ordering::SeqCst) {
            outcome.aborted = true;
        }

        let log = LogDocument {
            summary: LogSummary {
                exit_code: outcome.exit_code,
                timed_out: outcome.timed_out,
                aborted: outcome.aborted,
                stderr_snippet: outcome.stderr_snippet.clone(),
            },
            events: outcome.events.clone(),
        };
        if let Err(err) = log.write(&self.data_dir, task_id) {
            tracing::warn!(task_id, error = %err, "failed to persist session log");
        }

        if outcome.aborted {
            bail!("aborted");
        }
        Ok(outcome)
    }
}
