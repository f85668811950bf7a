//! The single process-wide mutex serializing every git-state-mutating
//! operation against the root repository.
//!
//! Multiple worktrees share one `.git` object/ref store, and the
//! integration pipeline checks out and merges into the root repo's
//! working tree directly. Git itself does not arbitrate concurrent
//! mutation of that shared state, so every caller that touches it --
//! worktree create/teardown (`crate::worktree`), and the merge/rebase/
//! push cycle (`crate::integration`) -- takes this same lock for the
//! duration of each git command. Tests are deliberately run outside the
//! lock so they can overlap across tasks.
//!
//! Git subprocesses are launched with the blocking `std::process`
//! API, so the lock itself is a plain `std::sync::Mutex` rather than
//! `tokio::sync::Mutex`; callers that need it from async code acquire
//! it inside a `spawn_blocking` closure.

use std::sync::{Arc, Mutex};

/// Shared handle to the process-wide git lock.
pub type GitLock = Arc<Mutex<()>>;

/// Create a new, unlocked git lock.
pub fn new_git_lock() -> GitLock {
    Arc::new(Mutex::new(()))
}
