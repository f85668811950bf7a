//! Dispatcher configuration: `agent.yaml`/`config.yaml` in the project
//! root, all fields optional and defaulted.
//!
//! Resolution chain: `--config <path>` CLI flag > `agent.yaml` >
//! `config.yaml` > built-in defaults. Unknown keys are rejected so a
//! typo in the YAML surfaces at load time instead of silently falling
//! back to a default.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Worker-subprocess invocation options, nested under `claude_code` (or
/// whichever key the worker's config section carries) in the YAML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct WorkerOptions {
    /// Path/name of the worker binary to invoke.
    pub command: String,
    /// Per-task wall-clock timeout, seconds.
    pub timeout: u64,
    /// Passed through to the worker as `--output-format`; the supervisor
    /// always parses newline-delimited JSON regardless of its value.
    pub output_format: String,
    pub verbose: bool,
    pub skip_permissions: bool,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            timeout: 600,
            output_format: "stream-json".to_string(),
            verbose: true,
            skip_permissions: false,
        }
    }
}

/// Full dispatcher configuration, as loaded from `agent.yaml`/`config.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AgentConfig {
    pub max_parallel_workers: usize,
    pub poll_interval_seconds: u64,
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub test_command: String,
    pub push_to_remote: bool,
    pub max_merge_retries: u32,
    pub symlink_files: Vec<String>,
    pub copy_files: Vec<String>,
    pub claude_code: WorkerOptions,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_parallel_workers: 5,
            poll_interval_seconds: 10,
            port_range_start: 9200,
            port_range_end: 9299,
            test_command: "pytest".to_string(),
            push_to_remote: true,
            max_merge_retries: 3,
            symlink_files: Vec::new(),
            copy_files: vec!["CLAUDE.md".to_string(), "PROGRESS.md".to_string()],
            claude_code: WorkerOptions::default(),
        }
    }
}

impl AgentConfig {
    /// Parse a config from YAML text, rejecting unknown keys.
    pub fn from_yaml(contents: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(contents)
    }

    /// Resolve and load configuration for `project_root`.
    ///
    /// Order: `explicit_path` (the `--config` flag) > `agent.yaml` >
    /// `config.yaml` > defaults (if none of the files exist).
    pub fn load(project_root: &Path, explicit_path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit_path {
            return Self::load_file(path);
        }
        for name in ["agent.yaml", "config.yaml"] {
            let path = project_root.join(name);
            if path.is_file() {
                return Self::load_file(&path);
            }
        }
        Ok(Self::default())
    }

    fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = AgentConfig::default();
        assert_eq!(cfg.max_parallel_workers, 5);
        assert_eq!(cfg.poll_interval_seconds, 10);
        assert_eq!(cfg.port_range_start, 9200);
        assert_eq!(cfg.port_range_end, 9299);
        assert_eq!(cfg.test_command, "pytest");
        assert!(cfg.push_to_remote);
        assert_eq!(cfg.max_merge_retries, 3);
        assert!(cfg.symlink_files.is_empty());
        assert_eq!(cfg.copy_files, vec!["CLAUDE.md", "PROGRESS.md"]);
    }

    #[test]
    fn partial_yaml_fills_in_defaults() {
        let cfg = AgentConfig::from_yaml("max_parallel_workers: 2\ntest_command: \"\"\n").unwrap();
        assert_eq!(cfg.max_parallel_workers, 2);
        assert_eq!(cfg.test_command, "");
        assert_eq!(cfg.poll_interval_seconds, 10);
    }

    #[test]
    fn unknown_key_is_rejected() {
        let err = AgentConfig::from_yaml("totally_bogus_key: 1\n");
        assert!(err.is_err());
    }

    #[test]
    fn load_prefers_agent_yaml_over_config_yaml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("agent.yaml"), "max_parallel_workers: 7\n").unwrap();
        std::fs::write(dir.path().join("config.yaml"), "max_parallel_workers: 9\n").unwrap();
        let cfg = AgentConfig::load(dir.path(), None).unwrap();
        assert_eq!(cfg.max_parallel_workers, 7);
    }

    #[test]
    fn load_falls_back_to_config_yaml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.yaml"), "max_parallel_workers: 9\n").unwrap();
        let cfg = AgentConfig::load(dir.path(), None).unwrap();
        assert_eq!(cfg.max_parallel_workers, 9);
    }

    #[test]
    fn load_defaults_when_no_file_present() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = AgentConfig::load(dir.path(), None).unwrap();
        assert_eq!(cfg.max_parallel_workers, 5);
    }

    #[test]
    fn explicit_path_overrides_project_root_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("agent.yaml"), "max_parallel_workers: 7\n").unwrap();
        let explicit = dir.path().join("custom.yaml");
        std::fs::write(&explicit, "max_parallel_workers: 1\n").unwrap();
        let cfg = AgentConfig::load(dir.path(), Some(&explicit)).unwrap();
        assert_eq!(cfg.max_parallel_workers, 1);
    }
}
