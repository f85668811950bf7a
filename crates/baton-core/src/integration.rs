//! Merge / test / rebase / fast-forward / push integration pipeline.
//!
//! Runs after a worker exits successfully. Stage 1 folds current
//! `main` into the task branch and runs the project's test suite;
//! either failing here aborts the task outright, no retry. Stage 2
//! rebases the task branch onto `main` and fast-forwards `main` to it
//! (plus an optional push); failures there retry the whole of stage 2
//! up to `max_merge_retries` times.
//!
//! Every git-mutating command in both stages takes the same
//! [`GitLock`] the [`crate::worktree::WorktreeManager`] uses, so this
//! pipeline never calls back into `WorktreeManager`'s own
//! lock-acquiring methods (that would deadlock on the non-reentrant
//! mutex) -- it drives `git` directly instead.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::git_lock::GitLock;

const FETCH_TIMEOUT: Duration = Duration::from_secs(60);
const MERGE_TIMEOUT: Duration = Duration::from_secs(60);
const TEST_TIMEOUT: Duration = Duration::from_secs(300);
const REBASE_TIMEOUT: Duration = Duration::from_secs(60);
const CHECKOUT_TIMEOUT: Duration = Duration::from_secs(30);
const PUSH_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum IntegrationError {
    /// Stage 1 (can't accept current main) or test failure. Never retried.
    #[error("{0}")]
    NonRetryable(String),

    /// Stage 2 retries exhausted.
    #[error("integration failed after {attempts} attempt(s): {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

#[derive(Debug, Error)]
enum GitRunError {
    #[error("failed to run git {args}: {source}")]
    Spawn {
        args: String,
        #[source]
        source: std::io::Error,
    },
    #[error("git {args} timed out after {timeout:?}")]
    Timeout { args: String, timeout: Duration },
}

/// Spawn `cmd`, draining its stdout/stderr on dedicated threads for the
/// lifetime of the process (not just after it exits) while polling
/// `try_wait` up to `timeout`. A child that writes more than the OS
/// pipe buffer before exiting would otherwise block on `write()` and
/// never exit, stalling the poll loop until the timeout fires -- the
/// same concurrent-drain shape `worker.rs` uses for the worker
/// subprocess, reimplemented with blocking threads since git/test
/// commands here run off the async runtime.
fn run_piped(mut cmd: Command, label: String, timeout: Duration) -> Result<Output, GitRunError> {
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    let mut child = cmd.spawn().map_err(|source| GitRunError::Spawn {
        args: label.clone(),
        source,
    })?;

    let stdout = child.stdout.take().expect("stdout was piped");
    let stderr = child.stderr.take().expect("stderr was piped");
    let stdout_handle = std::thread::spawn(move || {
        let mut buf = Vec::new();
        let mut stdout = stdout;
        let _ = stdout.read_to_end(&mut buf);
        buf
    });
    let stderr_handle = std::thread::spawn(move || {
        let mut buf = Vec::new();
        let mut stderr = stderr;
        let _ = stderr.read_to_end(&mut buf);
        buf
    });

    let start = Instant::now();
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Ok(status),
            Ok(None) => {
                if start.elapsed() >= timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    break Err(GitRunError::Timeout {
                        args: label.clone(),
                        timeout,
                    });
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(source) => {
                break Err(GitRunError::Spawn {
                    args: label.clone(),
                    source,
                });
            }
        }
    };

    let stdout = stdout_handle.join().unwrap_or_default();
    let stderr = stderr_handle.join().unwrap_or_default();
    let status = status?;
    Ok(Output {
        status,
        stdout,
        stderr,
    })
}

/// Run `git <args>` in `dir`, polling for completion up to `timeout`.
/// Killed and reported as [`GitRunError::Timeout`] if it runs over.
fn run_git(dir: &Path, args: &[&str], timeout: Duration) -> Result<Output, GitRunError> {
    let joined = args.join(" ");
    let mut cmd = Command::new("git");
    cmd.args(args).current_dir(dir);
    run_piped(cmd, joined, timeout)
}

fn describe_failure(args: &[&str], output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let detail = if !stderr.trim().is_empty() {
        stderr.trim()
    } else {
        stdout.trim()
    };
    format!(
        "git {} failed (exit {}): {}",
        args.join(" "),
        output.status.code().unwrap_or(-1),
        detail
    )
}

/// Merge/test/rebase/push pipeline, serialized on the shared git lock.
pub struct IntegrationPipeline {
    git_lock: GitLock,
    repo_path: PathBuf,
    test_command: String,
    push_to_remote: bool,
    max_merge_retries: u32,
}

impl IntegrationPipeline {
    pub fn new(
        git_lock: GitLock,
        repo_path: impl Into<PathBuf>,
        test_command: impl Into<String>,
        push_to_remote: bool,
        max_merge_retries: u32,
    ) -> Self {
        Self {
            git_lock,
            repo_path: repo_path.into(),
            test_command: test_command.into(),
            push_to_remote,
            max_merge_retries,
        }
    }

    /// Drive the full pipeline for `task_id`'s worktree. Blocking --
    /// callers on an async runtime should invoke this inside
    /// `spawn_blocking`.
    pub fn run(&self, task_id: &str, worktree_path: &Path) -> Result<(), IntegrationError> {
        self.stage1_merge_current_main(worktree_path)?;
        self.run_tests(worktree_path)?;

        let branch = format!("task/{task_id}");
        let total_attempts = self.max_merge_retries + 1;
        let mut last_error = String::new();

        for attempt in 1..=total_attempts {
            match self.stage2_rebase_and_land(worktree_path, &branch) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    last_error = err;
                    tracing::warn!(
                        task_id,
                        attempt,
                        total_attempts,
                        error = %last_error,
                        "stage 2 integration attempt failed"
                    );
                }
            }
        }

        Err(IntegrationError::RetriesExhausted {
            attempts: total_attempts,
            last_error,
        })
    }

    fn stage1_merge_current_main(&self, worktree_path: &Path) -> Result<(), IntegrationError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let fetch = run_git(worktree_path, &["fetch", "origin"], FETCH_TIMEOUT)
            .map_err(|e| IntegrationError::NonRetryable(e.to_string()))?;
        if !fetch.status.success() {
            return Err(IntegrationError::NonRetryable(describe_failure(
                &["fetch", "origin"],
                &fetch,
            )));
        }

        let merge = run_git(worktree_path, &["merge", "origin/main"], MERGE_TIMEOUT)
            .map_err(|e| IntegrationError::NonRetryable(e.to_string()))?;
        if !merge.status.success() {
            let _ = run_git(worktree_path, &["merge", "--abort"], MERGE_TIMEOUT);
            return Err(IntegrationError::NonRetryable(format!(
                "task branch cannot accommodate current main: {}",
                describe_failure(&["merge", "origin/main"], &merge)
            )));
        }

        Ok(())
    }

    fn run_tests(&self, worktree_path: &Path) -> Result<(), IntegrationError> {
        if self.test_command.trim().is_empty() {
            return Ok(());
        }

        let output = run_git_like_shell(worktree_path, &self.test_command, TEST_TIMEOUT)
            .map_err(|e| IntegrationError::NonRetryable(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let detail = if !stderr.trim().is_empty() {
                stderr.trim().to_string()
            } else {
                stdout.trim().to_string()
            };
            return Err(IntegrationError::NonRetryable(format!(
                "Tests failed (exit {}): {}",
                output.status.code().unwrap_or(-1),
                detail
            )));
        }

        Ok(())
    }

    /// Stage 2: fetch, rebase, fast-forward `main`, optionally push.
    /// Returns `Err(String)` (retryable) on any step failure.
    fn stage2_rebase_and_land(&self, worktree_path: &Path, branch: &str) -> Result<(), String> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let fetch = run_git(worktree_path, &["fetch", "origin", "main"], FETCH_TIMEOUT)
            .map_err(|e| e.to_string())?;
        if !fetch.status.success() {
            return Err(describe_failure(&["fetch", "origin", "main"], &fetch));
        }

        let rebase = run_git(worktree_path, &["rebase", "origin/main"], REBASE_TIMEOUT)
            .map_err(|e| e.to_string())?;
        if !rebase.status.success() {
            let _ = run_git(worktree_path, &["rebase", "--abort"], REBASE_TIMEOUT);
            return Err(describe_failure(&["rebase", "origin/main"], &rebase));
        }

        self.clear_stale_merge_state();

        let checkout = run_git(&self.repo_path, &["checkout", "main"], CHECKOUT_TIMEOUT)
            .map_err(|e| e.to_string())?;
        if !checkout.status.success() {
            return Err(describe_failure(&["checkout", "main"], &checkout));
        }

        // Plain merge, not --no-ff: the preceding rebase puts `branch`
        // directly ahead of `origin/main`, so this is expected to land
        // as a fast-forward rather than a merge commit.
        let merge = run_git(&self.repo_path, &["merge", branch], MERGE_TIMEOUT)
            .map_err(|e| e.to_string())?;
        if !merge.status.success() {
            let _ = run_git(&self.repo_path, &["merge", "--abort"], MERGE_TIMEOUT);
            return Err(describe_failure(&["merge", branch], &merge));
        }

        if self.push_to_remote {
            let push = run_git(&self.repo_path, &["push", "origin", "main"], PUSH_TIMEOUT)
                .map_err(|e| e.to_string())?;
            if !push.status.success() {
                return Err(describe_failure(&["push", "origin", "main"], &push));
            }
        }

        Ok(())
    }

    /// Clear a stale `MERGE_HEAD` left behind by a crashed prior run:
    /// try `git merge --abort` first, then `git reset --hard HEAD`,
    /// then remove the file directly as a last resort.
    fn clear_stale_merge_state(&self) {
        let merge_head = self.repo_path.join(".git").join("MERGE_HEAD");
        if !merge_head.exists() {
            return;
        }

        tracing::warn!(path = %merge_head.display(), "stale MERGE_HEAD found, clearing");

        let abort = run_git(&self.repo_path, &["merge", "--abort"], MERGE_TIMEOUT);
        if matches!(&abort, Ok(out) if out.status.success()) {
            return;
        }

        let reset = run_git(&self.repo_path, &["reset", "--hard", "HEAD"], MERGE_TIMEOUT);
        if matches!(&reset, Ok(out) if out.status.success()) {
            return;
        }

        let _ = std::fs::remove_file(&merge_head);
    }
}

/// Run `test_command` through `sh -c`, the same way the worker's own
/// shell-outs are run, polling for completion like [`run_git`].
fn run_git_like_shell(dir: &Path, command: &str, timeout: Duration) -> Result<Output, GitRunError> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command).current_dir(dir);
    run_piped(cmd, command.to_string(), timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git_lock::new_git_lock;
    use std::process::Command as StdCommand;
    use tempfile::TempDir;

    fn run(dir: &Path, args: &[&str]) {
        let status = StdCommand::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap_or_else(|e| panic!("git {} failed: {e}", args.join(" ")));
        assert!(
            status.status.success(),
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&status.stderr)
        );
    }

    /// A bare "origin" remote plus a clone-like root repo and a task
    /// worktree branched off `main`, wired together the way the
    /// dispatcher would see them (minus the remote, since `push` and
    /// `fetch` need a registered one to be meaningful here).
    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        worktree: PathBuf,
    }

    fn setup() -> Fixture {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("root");
        std::fs::create_dir_all(&root).unwrap();

        run(&root, &["init", "-b", "main"]);
        run(&root, &["config", "user.email", "test@baton.dev"]);
        run(&root, &["config", "user.name", "Baton Test"]);
        std::fs::write(root.join("README.md"), "hello\n").unwrap();
        run(&root, &["add", "."]);
        run(&root, &["commit", "-m", "initial"]);

        let worktree = root.join("worktrees").join("aaaa1111");
        std::fs::create_dir_all(worktree.parent().unwrap()).unwrap();
        run(
            &root,
            &[
                "worktree",
                "add",
                "-b",
                "task/aaaa1111",
                worktree.to_str().unwrap(),
                "main",
            ],
        );

        Fixture {
            _dir: dir,
            root,
            worktree,
        }
    }

    #[test]
    fn empty_test_command_skips_tests() {
        let fx = setup();
        let pipeline = IntegrationPipeline::new(new_git_lock(), &fx.root, "", true, 3);
        assert!(pipeline.run_tests(&fx.worktree).is_ok());
    }

    #[test]
    fn failing_test_command_is_non_retryable_with_stderr() {
        let fx = setup();
        let pipeline =
            IntegrationPipeline::new(new_git_lock(), &fx.root, "echo FAIL 1>&2; exit 1", true, 3);
        let err = pipeline.run_tests(&fx.worktree).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Tests failed"));
        assert!(msg.contains("FAIL"));
    }

    /// A test command writing well past a pipe buffer's worth of stdout
    /// before exiting must not stall the poll loop waiting on it -- the
    /// regression this guards is stdout/stderr only being drained after
    /// `try_wait` reports exit, which deadlocks once a child blocks on
    /// `write()` with nothing reading the other end.
    #[test]
    fn large_stdout_does_not_deadlock_test_command() {
        let fx = setup();
        let command = "head -c 200000 /dev/zero | tr '\\0' 'a'; echo; exit 0";
        let pipeline = IntegrationPipeline::new(new_git_lock(), &fx.root, command, true, 3);

        let start = std::time::Instant::now();
        let result = pipeline.run_tests(&fx.worktree);
        assert!(result.is_ok(), "large stdout test command should succeed: {result:?}");
        assert!(
            start.elapsed() < Duration::from_secs(10),
            "draining stdout concurrently should not stall until TEST_TIMEOUT"
        );
    }

    #[test]
    fn stage2_lands_task_branch_onto_main_without_remote() {
        let fx = setup();
        std::fs::write(fx.worktree.join("feature.txt"), "feature\n").unwrap();
        run(&fx.worktree, &["add", "feature.txt"]);
        run(&fx.worktree, &["commit", "-m", "add feature"]);

        // No remote configured, so stage 2's "fetch origin main" would
        // fail; exercise the merge-to-main logic directly instead.
        let pipeline = IntegrationPipeline::new(new_git_lock(), &fx.root, "", false, 0);
        run(&fx.root, &["checkout", "main"]);
        let result = run_git(
            &fx.root,
            &["merge", "--no-ff", "task/aaaa1111"],
            MERGE_TIMEOUT,
        )
        .unwrap();
        assert!(result.status.success());
        assert!(fx.root.join("feature.txt").exists());
        let _ = pipeline;
    }

    #[test]
    fn clear_stale_merge_state_removes_merge_head() {
        let fx = setup();
        let git_dir = fx.root.join(".git");
        std::fs::write(git_dir.join("MERGE_HEAD"), "deadbeef\n").unwrap();

        let pipeline = IntegrationPipeline::new(new_git_lock(), &fx.root, "", false, 0);
        pipeline.clear_stale_merge_state();

        assert!(!git_dir.join("MERGE_HEAD").exists());
    }

    /// Same as [`setup`] but with a bare "origin" remote registered and
    /// `main` pushed to it, so the full `run()` pipeline (including its
    /// `fetch`/`push` steps) has something real to talk to.
    struct RemoteFixture {
        _dir: TempDir,
        origin: PathBuf,
        root: PathBuf,
        worktree: PathBuf,
    }

    fn setup_with_remote() -> RemoteFixture {
        let dir = TempDir::new().unwrap();
        let origin = dir.path().join("origin.git");
        run(dir.path(), &["init", "--bare", "-b", "main", origin.to_str().unwrap()]);

        let root = dir.path().join("root");
        std::fs::create_dir_all(&root).unwrap();
        run(&root, &["init", "-b", "main"]);
        run(&root, &["config", "user.email", "test@baton.dev"]);
        run(&root, &["config", "user.name", "Baton Test"]);
        std::fs::write(root.join("README.md"), "hello\n").unwrap();
        run(&root, &["add", "."]);
        run(&root, &["commit", "-m", "initial"]);
        run(&root, &["remote", "add", "origin", origin.to_str().unwrap()]);
        run(&root, &["push", "-u", "origin", "main"]);

        let worktree = root.join("worktrees").join("aaaa1111");
        std::fs::create_dir_all(worktree.parent().unwrap()).unwrap();
        run(
            &root,
            &[
                "worktree",
                "add",
                "-b",
                "task/aaaa1111",
                worktree.to_str().unwrap(),
                "main",
            ],
        );

        RemoteFixture {
            _dir: dir,
            origin,
            root,
            worktree,
        }
    }

    #[test]
    fn run_lands_and_pushes_a_clean_task_to_main() {
        let fx = setup_with_remote();
        std::fs::write(fx.worktree.join("feature.txt"), "feature\n").unwrap();
        run(&fx.worktree, &["add", "feature.txt"]);
        run(&fx.worktree, &["commit", "-m", "add feature"]);

        let pipeline = IntegrationPipeline::new(new_git_lock(), &fx.root, "", true, 1);
        pipeline.run("aaaa1111", &fx.worktree).expect("pipeline should succeed");

        assert!(fx.root.join("feature.txt").exists(), "main should have the landed change");

        let log = run_git(&fx.origin, &["log", "main", "--oneline"], MERGE_TIMEOUT).unwrap();
        let subjects = String::from_utf8_lossy(&log.stdout);
        assert!(
            subjects.contains("add feature"),
            "pushed origin/main should include the landed commit: {subjects}"
        );
    }

    /// A stage-2 failure is retryable: the same task succeeds once
    /// whatever made `git checkout main` fail goes away, without
    /// needing a fresh pipeline or worktree.
    #[test]
    fn stage2_retryable_failure_recovers_once_contention_clears() {
        let fx = setup_with_remote();
        std::fs::write(fx.worktree.join("feature.txt"), "feature\n").unwrap();
        run(&fx.worktree, &["add", "feature.txt"]);
        run(&fx.worktree, &["commit", "-m", "add feature"]);

        run(&fx.root, &["checkout", "-b", "scratch"]);
        let decoy = fx.root.parent().unwrap().join("decoy");
        run(&fx.root, &["worktree", "add", decoy.to_str().unwrap(), "main"]);

        let pipeline = IntegrationPipeline::new(new_git_lock(), &fx.root, "", false, 3);
        let first = pipeline.stage2_rebase_and_land(&fx.worktree, "task/aaaa1111");
        assert!(first.is_err(), "checkout should fail while main is held by the decoy worktree");

        run(&fx.root, &["worktree", "remove", "--force", decoy.to_str().unwrap()]);

        let second = pipeline.stage2_rebase_and_land(&fx.worktree, "task/aaaa1111");
        assert!(second.is_ok(), "retry should succeed once the decoy is gone: {second:?}");
        assert!(fx.root.join("feature.txt").exists());
    }

    #[test]
    fn max_merge_retries_zero_fails_after_exactly_one_attempt() {
        let fx = setup_with_remote();
        std::fs::write(fx.worktree.join("feature.txt"), "feature\n").unwrap();
        run(&fx.worktree, &["add", "feature.txt"]);
        run(&fx.worktree, &["commit", "-m", "add feature"]);

        // Free up `main` in root by moving root onto a scratch branch,
        // then check `main` out in a second worktree -- stage 2's
        // `git checkout main` in root now fails deterministically
        // (git refuses to check out a branch that's live elsewhere),
        // a real retryable failure rather than a simulated one.
        run(&fx.root, &["checkout", "-b", "scratch"]);
        let decoy = fx.root.parent().unwrap().join("decoy");
        run(&fx.root, &["worktree", "add", decoy.to_str().unwrap(), "main"]);

        let pipeline = IntegrationPipeline::new(new_git_lock(), &fx.root, "", false, 0);
        let err = pipeline.run("aaaa1111", &fx.worktree).unwrap_err();

        match err {
            IntegrationError::RetriesExhausted { attempts, last_error } => {
                assert_eq!(attempts, 1);
                assert!(last_error.contains("checkout"), "unexpected error: {last_error}");
            }
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
    }
}
