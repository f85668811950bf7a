//! Per-task session log: the outcome summary and raw event stream of a
//! task's most recent worker run, persisted at `data/<id>.log.json`.
//!
//! Written with the same write-temp-in-same-directory + rename pattern
//! the task store uses, so a reader never observes a partial document.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionLogError {
    #[error("failed to write session log at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Outcome summary of a worker run, independent of the raw event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSummary {
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub aborted: bool,
    pub stderr_snippet: Option<String>,
}

/// The full persisted log document for a task's most recent run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogDocument {
    pub summary: LogSummary,
    pub events: Vec<Value>,
}

impl LogDocument {
    pub fn path_for(data_dir: &Path, task_id: &str) -> PathBuf {
        data_dir.join(format!("{task_id}.log.json"))
    }

    /// Persist this log document for `task_id` under `data_dir`.
    pub fn write(&self, data_dir: &Path, task_id: &str) -> Result<(), SessionLogError> {
        std::fs::create_dir_all(data_dir).map_err(|source| SessionLogError::Write {
            path: data_dir.to_path_buf(),
            source,
        })?;

        let path = Self::path_for(data_dir, task_id);
        let contents = serde_json::to_string_pretty(self).expect("LogDocument serializes");

        let tmp_path = data_dir.join(format!(".{task_id}.log.json.{}.tmp", std::process::id()));
        std::fs::write(&tmp_path, &contents).map_err(|source| SessionLogError::Write {
            path: tmp_path.clone(),
            source,
        })?;
        std::fs::rename(&tmp_path, &path).map_err(|source| SessionLogError::Write {
            path: path.clone(),
            source,
        })?;
        Ok(())
    }

    /// Load a previously persisted log document, if any.
    pub fn read(data_dir: &Path, task_id: &str) -> Option<Self> {
        let contents = std::fs::read_to_string(Self::path_for(data_dir, task_id)).ok()?;
        serde_json::from_str(&contents).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let doc = LogDocument {
            summary: LogSummary {
                exit_code: Some(0),
                timed_out: false,
                aborted: false,
                stderr_snippet: None,
            },
            events: vec![serde_json::json!({"type": "assistant"})],
        };
        doc.write(dir.path(), "aaaa1111").unwrap();

        let loaded = LogDocument::read(dir.path(), "aaaa1111").unwrap();
        assert_eq!(loaded.summary.exit_code, Some(0));
        assert_eq!(loaded.events.len(), 1);
    }

    #[test]
    fn read_of_missing_task_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(LogDocument::read(dir.path(), "ffffffff").is_none());
    }

    #[test]
    fn write_leaves_no_temp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let doc = LogDocument {
            summary: LogSummary {
                exit_code: None,
                timed_out: true,
                aborted: false,
                stderr_snippet: Some("boom".into()),
            },
            events: vec![],
        };
        doc.write(dir.path(), "bbbb2222").unwrap();

        let leftover_tmp = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().ends_with(".tmp"));
        assert!(!leftover_tmp);
    }
}
