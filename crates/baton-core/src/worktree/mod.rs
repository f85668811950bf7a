//! Git worktree management for task isolation.
//!
//! Each task runs in its own git worktree, providing filesystem
//! isolation without the overhead of full repository clones. Worktrees
//! share the object store of the root repository but have independent
//! working directories and index files.
//!
//! Git does not support concurrent worktree operations on the same
//! repository (it uses a lock file on the shared object store), and
//! the integration pipeline (`crate::integration`) mutates the same
//! repo state from the other side. Every git-mutating method here
//! takes the same [`GitLock`] the pipeline uses, so creates,
//! teardowns, and merges are all serialized against each other.

use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;

use crate::git_lock::GitLock;

/// Errors that can occur during worktree operations.
#[derive(Debug, Error)]
pub enum WorktreeError {
    /// The root repository path does not exist or is not a git repository.
    #[error("not a git repository: {0}")]
    NotAGitRepo(PathBuf),

    /// A git command failed to execute.
    #[error("git command failed: {message}")]
    GitCommand {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// A git command exited with a non-zero status.
    #[error("git {command} failed (exit {code}): {stderr}")]
    GitExit {
        command: String,
        code: i32,
        stderr: String,
    },

    /// The worktree path already exists but is associated with a different
    /// branch than expected.
    #[error(
        "worktree path exists but has unexpected branch: expected {expected}, found {found}"
    )]
    BranchMismatch { expected: String, found: String },

    /// Failed to parse porcelain output from `git worktree list`.
    #[error("failed to parse worktree list output: {0}")]
    ParseError(String),

    /// Materializing shared/per-task files into the worktree failed.
    #[error("failed to materialize {path}: {source}")]
    Materialize {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A single entry from `git log`, as surfaced by the HTTP façade's
/// `/agent/commits` endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub sha: String,
    pub author: String,
    pub date: String,
    pub subject: String,
}

/// Information about a single git worktree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    /// Absolute path to the worktree directory.
    pub path: PathBuf,
    /// Branch checked out in this worktree, if any.
    pub branch: Option<String>,
    /// HEAD commit SHA.
    pub head_commit: String,
}

/// Manages git worktrees for task isolation.
///
/// Worktrees live under `<root>/worktrees/<task_id>`, each on its own
/// `task/<task_id>` branch created off `main`.
#[derive(Debug, Clone)]
pub struct WorktreeManager {
    /// Path to the root git repository.
    repo_path: PathBuf,
    /// Base directory under which worktrees are created.
    worktree_base: PathBuf,
    /// Serializes git operations; shared with the integration pipeline.
    git_lock: GitLock,
}

impl WorktreeManager {
    /// Create a new `WorktreeManager` rooted at `repo_path`, with
    /// worktrees placed under `repo_path/worktrees`.
    ///
    /// # Errors
    ///
    /// Returns [`WorktreeError::NotAGitRepo`] if `repo_path` is not a git
    /// repository.
    pub fn new(repo_path: impl Into<PathBuf>, git_lock: GitLock) -> Result<Self, WorktreeError> {
        let repo_path = repo_path.into();

        let output = Command::new("git")
            .arg("rev-parse")
            .arg("--git-dir")
            .current_dir(&repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git rev-parse".into(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(WorktreeError::NotAGitRepo(repo_path));
        }

        let worktree_base = repo_path.join("worktrees");

        Ok(Self {
            repo_path,
            worktree_base,
            git_lock,
        })
    }

    /// Return the base directory where worktrees are created.
    pub fn worktree_base(&self) -> &Path {
        &self.worktree_base
    }

    /// Return the root repository path.
    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Build the conventional branch name for a task.
    ///
    /// Format: `task/<task_id>`
    pub fn branch_name(task_id: &str) -> String {
        format!("task/{task_id}")
    }

    /// Create a new worktree for `task_id`, branched off `main`.
    ///
    /// Idempotent: if a worktree already exists at the expected path
    /// with the expected branch, it is returned as-is.
    pub fn create_worktree(&self, task_id: &str) -> Result<WorktreeInfo, WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let branch_name = Self::branch_name(task_id);
        let worktree_path = self.worktree_base.join(task_id);

        if let Ok(existing) = self.find_worktree_by_path(&worktree_path) {
            if let Some(ref branch) = existing.branch {
                if branch == &branch_name {
                    tracing::info!(
                        path = %worktree_path.display(),
                        branch = %branch_name,
                        "worktree already exists, returning existing"
                    );
                    return Ok(existing);
                }
                return Err(WorktreeError::BranchMismatch {
                    expected: branch_name,
                    found: branch.clone(),
                });
            }
            tracing::info!(path = %worktree_path.display(), "worktree exists with detached HEAD, returning existing");
            return Ok(existing);
        }

        if !self.worktree_base.exists() {
            std::fs::create_dir_all(&self.worktree_base).map_err(|e| WorktreeError::GitCommand {
                message: format!(
                    "failed to create worktree base directory: {}",
                    self.worktree_base.display()
                ),
                source: e,
            })?;
        }

        let branch_exists = self.branch_exists(&branch_name)?;

        let output = if branch_exists {
            Command::new("git")
                .args(["worktree", "add"])
                .arg(&worktree_path)
                .arg(&branch_name)
                .current_dir(&self.repo_path)
                .output()
                .map_err(|e| WorktreeError::GitCommand {
                    message: "failed to run git worktree add".into(),
                    source: e,
                })?
        } else {
            Command::new("git")
                .args(["worktree", "add", "-b"])
                .arg(&branch_name)
                .arg(&worktree_path)
                .arg("main")
                .current_dir(&self.repo_path)
                .output()
                .map_err(|e| WorktreeError::GitCommand {
                    message: "failed to run git worktree add -b".into(),
                    source: e,
                })?
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            self.cleanup_partial(&worktree_path);
            return Err(WorktreeError::GitExit {
                command: "worktree add".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        self.find_worktree_by_path(&worktree_path)
    }

    /// Materialize shared and per-task files into a freshly created
    /// worktree: `data/` directory, `symlink_files` symlinks, a
    /// `logs` symlink back to the root, and `copy_files` copies.
    pub fn materialize(
        &self,
        worktree_path: &Path,
        symlink_files: &[String],
        copy_files: &[String],
    ) -> Result<(), WorktreeError> {
        let data_dir = worktree_path.join("data");
        std::fs::create_dir_all(&data_dir).map_err(|source| WorktreeError::Materialize {
            path: data_dir,
            source,
        })?;

        for rel in symlink_files {
            self.symlink_one(worktree_path, rel)?;
        }
        self.symlink_one(worktree_path, "logs")?;

        for name in copy_files {
            let src = self.repo_path.join(name);
            if !src.exists() {
                continue;
            }
            let dst = worktree_path.join(name);
            std::fs::copy(&src, &dst).map_err(|source| WorktreeError::Materialize {
                path: dst,
                source,
            })?;
        }

        Ok(())
    }

    #[cfg(unix)]
    fn symlink_one(&self, worktree_path: &Path, rel: &str) -> Result<(), WorktreeError> {
        let target = self.repo_path.join(rel);
        let link = worktree_path.join(rel);
        if link.exists() {
            return Ok(());
        }
        if let Some(parent) = link.parent() {
            std::fs::create_dir_all(parent).map_err(|source| WorktreeError::Materialize {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        std::os::unix::fs::symlink(&target, &link).map_err(|source| WorktreeError::Materialize {
            path: link,
            source,
        })
    }

    #[cfg(not(unix))]
    fn symlink_one(&self, _worktree_path: &Path, _rel: &str) -> Result<(), WorktreeError> {
        Ok(())
    }

    /// Remove a worktree by its path.
    ///
    /// This removes the worktree directory and unregisters it from git.
    /// If the worktree does not exist, this is a no-op (idempotent).
    pub fn remove_worktree(&self, path: &Path) -> Result<(), WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        if self.find_worktree_by_path(path).is_err() {
            if path.exists() {
                tracing::warn!(
                    path = %path.display(),
                    "directory exists but not registered as worktree, removing"
                );
                let _ = std::fs::remove_dir_all(path);
            }
            return Ok(());
        }

        let output = Command::new("git")
            .args(["worktree", "remove", "--force"])
            .arg(path)
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git worktree remove".into(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            if stderr.contains("is not a working tree") {
                return Ok(());
            }
            return Err(WorktreeError::GitExit {
                command: "worktree remove".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        Ok(())
    }

    /// Remove the worktree, delete the local branch, and optionally the
    /// remote tracking branch. The standard teardown of a finished task.
    pub fn teardown(&self, path: &Path, task_id: &str, push_to_remote: bool) -> Result<(), WorktreeError> {
        self.remove_worktree(path)?;
        let branch = Self::branch_name(task_id);
        self.delete_branch(&branch)?;
        if push_to_remote {
            if let Err(e) = self.delete_remote_branch(&branch) {
                tracing::warn!(branch = %branch, error = %e, "failed to delete remote branch");
            }
        }
        Ok(())
    }

    /// List all worktrees associated with the root repository.
    pub fn list_worktrees(&self) -> Result<Vec<WorktreeInfo>, WorktreeError> {
        let output = Command::new("git")
            .args(["worktree", "list", "--porcelain"])
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git worktree list".into(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(WorktreeError::GitExit {
                command: "worktree list".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_porcelain_output(&stdout)
    }

    /// Prune stale worktree entries.
    pub fn cleanup_stale(&self) -> Result<(), WorktreeError> {
        let output = Command::new("git")
            .args(["worktree", "prune"])
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git worktree prune".into(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(WorktreeError::GitExit {
                command: "worktree prune".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        Ok(())
    }

    /// Delete a local branch. Idempotent: missing branches are not an error.
    pub fn delete_branch(&self, branch_name: &str) -> Result<(), WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let output = Command::new("git")
            .args(["branch", "-D", branch_name])
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git branch -D".into(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            if stderr.contains("not found") {
                return Ok(());
            }
            return Err(WorktreeError::GitExit {
                command: "branch -D".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        Ok(())
    }

    /// Delete the remote tracking branch on `origin`.
    pub fn delete_remote_branch(&self, branch_name: &str) -> Result<(), WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let output = Command::new("git")
            .args(["push", "origin", "--delete", branch_name])
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git push --delete".into(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(WorktreeError::GitExit {
                command: "push --delete".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        Ok(())
    }

    /// Check whether a branch exists in the repository.
    pub fn branch_exists(&self, branch_name: &str) -> Result<bool, WorktreeError> {
        let output = Command::new("git")
            .args(["rev-parse", "--verify"])
            .arg(format!("refs/heads/{branch_name}"))
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git rev-parse --verify".into(),
                source: e,
            })?;

        Ok(output.status.success())
    }

    /// The most recent `count` commits on the current branch of the root
    /// repository, newest first.
    pub fn recent_commits(&self, count: usize) -> Result<Vec<CommitInfo>, WorktreeError> {
        let output = Command::new("git")
            .args(["log", &format!("-n{count}"), "--pretty=format:%H\x1f%an\x1f%aI\x1f%s\x1e"])
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git log".into(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(WorktreeError::GitExit {
                command: "log".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .split('\x1e')
            .map(str::trim)
            .filter(|record| !record.is_empty())
            .filter_map(|record| {
                let mut fields = record.splitn(4, '\x1f');
                let commit = CommitInfo {
                    sha: fields.next()?.to_string(),
                    author: fields.next()?.to_string(),
                    date: fields.next()?.to_string(),
                    subject: fields.next().unwrap_or_default().to_string(),
                };
                Some(commit)
            })
            .collect())
    }

    fn find_worktree_by_path(&self, path: &Path) -> Result<WorktreeInfo, WorktreeError> {
        let worktrees = self.list_worktrees()?;
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());

        for wt in worktrees {
            let wt_canonical = wt.path.canonicalize().unwrap_or_else(|_| wt.path.clone());
            if wt_canonical == canonical {
                return Ok(wt);
            }
        }

        Err(WorktreeError::ParseError(format!(
            "worktree not found at path: {}",
            path.display()
        )))
    }

    fn cleanup_partial(&self, path: &Path) {
        if path.exists() {
            tracing::warn!(path = %path.display(), "cleaning up partial worktree directory");
            let _ = std::fs::remove_dir_all(path);
        }
        let _ = self.cleanup_stale();
    }
}

/// Parse the porcelain output of `git worktree list --porcelain`.
fn parse_porcelain_output(output: &str) -> Result<Vec<WorktreeInfo>, WorktreeError> {
    let mut worktrees = Vec::new();
    let mut current_path: Option<PathBuf> = None;
    let mut current_head: Option<String> = None;
    let mut current_branch: Option<String> = None;

    for line in output.lines() {
        if line.is_empty() {
            if let (Some(path), Some(head)) = (current_path.take(), current_head.take()) {
                worktrees.push(WorktreeInfo {
                    path,
                    branch: current_branch.take(),
                    head_commit: head,
                });
            } else {
                current_path = None;
                current_head = None;
                current_branch = None;
            }
            continue;
        }

        if let Some(rest) = line.strip_prefix("worktree ") {
            current_path = Some(PathBuf::from(rest));
        } else if let Some(rest) = line.strip_prefix("HEAD ") {
            current_head = Some(rest.to_string());
        } else if let Some(rest) = line.strip_prefix("branch ") {
            let branch = rest.strip_prefix("refs/heads/").unwrap_or(rest).to_string();
            current_branch = Some(branch);
        }
    }

    if let (Some(path), Some(head)) = (current_path, current_head) {
        worktrees.push(WorktreeInfo {
            path,
            branch: current_branch,
            head_commit: head,
        });
    }

    Ok(worktrees)
}
