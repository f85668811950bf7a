//! Launches, streams, times out, and terminates the external worker
//! subprocess.
//!
//! The worker is an opaque binary (by default `claude -p <prompt>
//! --output-format stream-json --verbose`) that emits one JSON object
//! per line on stdout. Each process is started in its own process
//! group so that [`ProcessHandle::cancel`] can reliably reclaim any
//! children the worker itself spawns.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex as AsyncMutex;

use crate::config::WorkerOptions;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn worker command '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("worker process has no pid")]
    NoPid,
}

/// Arguments for a single worker invocation.
pub struct RunArgs {
    pub working_dir: std::path::PathBuf,
    pub prompt: String,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
}

/// Outcome of a completed (or cancelled/timed-out) worker run.
#[derive(Debug)]
pub struct RunOutcome {
    /// `None` if the process never reported an exit code (killed before reap).
    pub exit_code: Option<i32>,
    /// Every successfully parsed stdout event, in arrival order.
    pub events: Vec<Value>,
    /// Last 4 KB of stderr, if any was captured.
    pub stderr_snippet: Option<String>,
    pub timed_out: bool,
    pub aborted: bool,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && !self.aborted && self.exit_code == Some(0)
    }
}

/// Bounded ring buffer keeping only the last `cap` bytes written to it.
struct RingBuffer {
    cap: usize,
    buf: Vec<u8>,
}

impl RingBuffer {
    fn new(cap: usize) -> Self {
        Self {
            cap,
            buf: Vec::new(),
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
        if self.buf.len() > self.cap {
            let excess = self.buf.len() - self.cap;
            self.buf.drain(0..excess);
        }
    }

    fn into_string(self) -> Option<String> {
        if self.buf.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&self.buf).into_owned())
        }
    }
}

const STDERR_SNIPPET_CAP: usize = 4 * 1024;

/// A tracked, cancellable worker process.
#[derive(Clone)]
pub struct ProcessHandle {
    pid: u32,
    child: Arc<AsyncMutex<Child>>,
}

impl ProcessHandle {
    /// SIGTERM the process group; if still alive after 5s, SIGKILL it;
    /// wait up to 3s for the OS to reap it.
    pub async fn cancel(&self) {
        let pid = self.pid as i32;

        #[cfg(unix)]
        {
            // SAFETY: `pid` came from a child we spawned with its own
            // process group (process_group(0)), so signalling -pid
            // reaches exactly that group and nothing else.
            unsafe {
                libc::kill(-pid, libc::SIGTERM);
            }
        }

        let mut child = self.child.lock().await;
        if tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .is_ok()
        {
            return;
        }

        #[cfg(unix)]
        {
            // SAFETY: same process group as above.
            unsafe {
                libc::kill(-pid, libc::SIGKILL);
            }
        }
        let _ = tokio::time::timeout(Duration::from_secs(3), child.wait()).await;
    }
}

/// Map from task id to the in-flight worker process for that task.
///
/// Guarded by its own lock, separate from the task store and git lock,
/// so that cancelling a worker never has to wait on either of those.
/// Callers snapshot a clone of the handle under the lock, then cancel
/// it without holding the lock -- the snapshot-then-act pattern the
/// rest of the dispatcher follows to avoid deadlocks with an
/// executor's own cleanup path needing the same registry.
#[derive(Default)]
pub struct ProcessRegistry {
    inner: Mutex<HashMap<String, ProcessHandle>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn track(&self, task_id: &str, handle: ProcessHandle) {
        self.inner
            .lock()
            .expect("process registry mutex poisoned")
            .insert(task_id.to_string(), handle);
    }

    fn untrack(&self, task_id: &str) {
        self.inner
            .lock()
            .expect("process registry mutex poisoned")
            .remove(task_id);
    }

    /// Snapshot the handle for one task, if it is currently tracked.
    pub fn get(&self, task_id: &str) -> Option<ProcessHandle> {
        self.inner
            .lock()
            .expect("process registry mutex poisoned")
            .get(task_id)
            .cloned()
    }

    /// Snapshot every currently tracked handle.
    pub fn snapshot_all(&self) -> Vec<ProcessHandle> {
        self.inner
            .lock()
            .expect("process registry mutex poisoned")
            .values()
            .cloned()
            .collect()
    }
}

/// Launches and supervises worker subprocesses.
pub struct WorkerSupervisor {
    registry: Arc<ProcessRegistry>,
}

impl WorkerSupervisor {
    pub fn new(registry: Arc<ProcessRegistry>) -> Self {
        Self { registry }
    }

    /// Run the worker for `task_id` to completion (or until timeout).
    ///
    /// Tracks the process in the registry for the duration of the call
    /// and untracks it before returning, success or failure.
    pub async fn run(
        &self,
        task_id: &str,
        options: &WorkerOptions,
        args: RunArgs,
    ) -> Result<RunOutcome, SupervisorError> {
        let mut cmd = Command::new(&options.command);
        cmd.arg("-p")
            .arg(&args.prompt)
            .arg("--output-format")
            .arg(&options.output_format);
        if options.verbose {
            cmd.arg("--verbose");
        }
        if options.skip_permissions {
            cmd.arg("--dangerously-skip-permissions");
        }
        cmd.current_dir(&args.working_dir);
        for (key, value) in &args.env {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            command: options.command.clone(),
            source,
        })?;
        let pid = child.id().ok_or(SupervisorError::NoPid)?;

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");

        let child = Arc::new(AsyncMutex::new(child));
        let handle = ProcessHandle {
            pid,
            child: Arc::clone(&child),
        };
        self.registry.track(task_id, handle.clone());

        let events: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
        let events_writer = Arc::clone(&events);
        let stdout_task = tokio::spawn(async move {
            let reader = BufReader::new(stdout);
            let mut lines = reader.lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<Value>(trimmed) {
                            Ok(event) => {
                                events_writer
                                    .lock()
                                    .expect("event log mutex poisoned")
                                    .push(event);
                            }
                            Err(err) => {
                                tracing::warn!(line = trimmed, error = %err, "dropping unparseable worker event line");
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        tracing::warn!(error = %err, "error reading worker stdout");
                        break;
                    }
                }
            }
        });

        let stderr_task = tokio::spawn(async move {
            let mut ring = RingBuffer::new(STDERR_SNIPPET_CAP);
            let mut reader = stderr;
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => ring.push(&buf[..n]),
                }
            }
            ring.into_string()
        });

        let wait_result = tokio::time::timeout(args.timeout, async {
            let mut guard = child.lock().await;
            guard.wait().await
        })
        .await;

        let (exit_code, timed_out) = match wait_result {
            Ok(Ok(status)) => (status.code(), false),
            Ok(Err(err)) => {
                tracing::warn!(task_id, error = %err, "error waiting on worker process");
                (None, false)
            }
            Err(_) => {
                tracing::warn!(task_id, "worker timed out, cancelling");
                handle.cancel().await;
                (None, true)
            }
        };

        let _ = stdout_task.await;
        let stderr_snippet = stderr_task.await.unwrap_or(None);

        self.registry.untrack(task_id);

        let events = Arc::try_unwrap(events)
            .map(|m| m.into_inner().expect("event log mutex poisoned"))
            .unwrap_or_else(|arc| arc.lock().expect("event log mutex poisoned").clone());

        Ok(RunOutcome {
            exit_code,
            events,
            stderr_snippet,
            timed_out,
            aborted: false,
        })
    }
}

/// Collect the text of every `assistant` message block plus the final
/// `result` text from a plan-phase event stream, double-newline
/// separated. Falls back to `"No plan generated."` when nothing
/// assistant-shaped was emitted.
pub fn collect_plan_text(events: &[Value]) -> String {
    let mut parts = Vec::new();

    for event in events {
        let Some(event_type) = event.get("type").and_then(Value::as_str) else {
            continue;
        };
        match event_type {
            "assistant" => {
                if let Some(message) = event.get("message") {
                    parts.extend(extract_message_text(message));
                }
            }
            "result" => {
                if let Some(text) = event.get("result").and_then(Value::as_str) {
                    parts.push(text.to_string());
                }
            }
            _ => {}
        }
    }

    if parts.is_empty() {
        "No plan generated.".to_string()
    } else {
        parts.join("\n\n")
    }
}

fn extract_message_text(message: &Value) -> Vec<String> {
    if let Some(text) = message.as_str() {
        return vec![text.to_string()];
    }
    let mut out = Vec::new();
    if let Some(blocks) = message.get("content").and_then(Value::as_array) {
        for block in blocks {
            if block.get("type").and_then(Value::as_str) == Some("text") {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    out.push(text.to_string());
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn collect_plan_text_concatenates_assistant_and_result() {
        let events = vec![
            json!({"type": "assistant", "message": "first thought"}),
            json!({"type": "tool_use", "tool": "Read", "input": {}}),
            json!({"type": "assistant", "message": {"content": [{"type": "text", "text": "second thought"}]}}),
            json!({"type": "result", "cost_usd": 0.01, "result": "final summary"}),
        ];
        let text = collect_plan_text(&events);
        assert_eq!(text, "first thought\n\nsecond thought\n\nfinal summary");
    }

    #[test]
    fn collect_plan_text_falls_back_when_empty() {
        let events = vec![json!({"type": "tool_use", "tool": "Bash", "input": {}})];
        assert_eq!(collect_plan_text(&events), "No plan generated.");
    }

    #[tokio::test]
    async fn run_captures_stdout_events_and_exit_code() {
        let registry = Arc::new(ProcessRegistry::new());
        let supervisor = WorkerSupervisor::new(registry);
        let options = WorkerOptions {
            command: "sh".to_string(),
            timeout: 5,
            output_format: "stream-json".to_string(),
            verbose: false,
            skip_permissions: false,
        };
        // `sh -p <prompt> --output-format stream-json` -- sh ignores the
        // unknown flags and `-c` won't run, so instead drive this test
        // through a tiny script invoked directly.
        let script = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(
            script.path(),
            "#!/bin/sh\necho '{\"type\":\"assistant\",\"message\":\"hi\"}'\nexit 0\n",
        )
        .unwrap();
        let mut perms = std::fs::metadata(script.path()).unwrap().permissions();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            perms.set_mode(0o755);
        }
        std::fs::set_permissions(script.path(), perms).unwrap();

        let options = WorkerOptions {
            command: script.path().to_string_lossy().into_owned(),
            ..options
        };

        let outcome = supervisor
            .run(
                "aaaa1111",
                &options,
                RunArgs {
                    working_dir: std::env::temp_dir(),
                    prompt: "do the thing".to_string(),
                    env: vec![],
                    timeout: Duration::from_secs(5),
                },
            )
            .await
            .unwrap();

        assert_eq!(outcome.exit_code, Some(0));
        assert!(outcome.succeeded());
        assert_eq!(outcome.events.len(), 1);
        assert_eq!(outcome.events[0]["message"], json!("hi"));
    }

    #[tokio::test]
    async fn run_times_out_and_cancels() {
        let registry = Arc::new(ProcessRegistry::new());
        let supervisor = WorkerSupervisor::new(registry);

        let script = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(script.path(), "#!/bin/sh\nsleep 10\n").unwrap();
        let mut perms = std::fs::metadata(script.path()).unwrap().permissions();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            perms.set_mode(0o755);
        }
        std::fs::set_permissions(script.path(), perms).unwrap();

        let options = WorkerOptions {
            command: script.path().to_string_lossy().into_owned(),
            timeout: 1,
            output_format: "stream-json".to_string(),
            verbose: false,
            skip_permissions: false,
        };
        let outcome = supervisor
            .run(
                "bbbb2222",
                &options,
                RunArgs {
                    working_dir: std::env::temp_dir(),
                    prompt: "irrelevant".to_string(),
                    env: vec![],
                    timeout: Duration::from_millis(200),
                },
            )
            .await
            .unwrap();
        assert!(outcome.timed_out);
        assert!(!outcome.succeeded());
    }
}
