//! Shared fixtures for baton-core/baton-cli integration tests.
//!
//! Every executor/scheduler/lifecycle/HTTP test needs the same two
//! things: a throwaway git repository to isolate, and a fake worker
//! script standing in for the external coding subprocess. Centralizing
//! them here keeps the per-crate test modules focused on the behavior
//! under test rather than git bootstrapping.

use std::path::Path;
use std::process::Command;

/// Initialize `dir` as a git repository with a `main` branch, test
/// identity, and one commit, the shape every worktree/integration test
/// needs as its root repo.
pub fn init_repo(dir: &Path) {
    let run = |args: &[&str]| {
        let status = Command::new("git").args(args).current_dir(dir).output().unwrap();
        assert!(status.status.success(), "git {args:?} failed: {:?}", status);
    };
    run(&["init", "-b", "main"]);
    run(&["config", "user.email", "test@baton.dev"]);
    run(&["config", "user.name", "Baton Test"]);
    std::fs::write(dir.join("README.md"), "# repo\n").unwrap();
    run(&["add", "."]);
    run(&["commit", "-m", "initial"]);
}

/// Write `script` to `path` and mark it executable, standing in for the
/// worker command the supervisor invokes.
pub fn write_fake_worker(path: &Path, script: &str) {
    std::fs::write(path, script).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(path, perms).unwrap();
    }
}

/// A fake worker script that emits one `assistant` event with `text` and
/// exits 0, the minimal shape the supervisor's event parser accepts.
pub fn fake_worker_emitting(text: &str) -> String {
    format!(
        "#!/bin/sh\n\
         echo '{{\"type\": \"assistant\", \"message\": \"{text}\"}}'\n\
         exit 0\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_repo_creates_a_commit_on_main() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());

        let output = Command::new("git")
            .args(["log", "--oneline"])
            .current_dir(dir.path())
            .output()
            .unwrap();
        assert!(output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout).lines().count(), 1);
    }

    #[test]
    fn write_fake_worker_is_executable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.sh");
        write_fake_worker(&path, &fake_worker_emitting("hello"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o111, 0o111);
        }
    }
}
