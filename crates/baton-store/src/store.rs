//! Atomic, mutex-serialized persistence of the task document.
//!
//! The store is a single JSON file (`data/dev-tasks.json`). Every
//! mutation is a read-modify-write under one in-process mutex followed
//! by a write-temp-in-same-directory + rename, so the file on disk
//! never contains a partially written document and concurrent
//! in-process writers never interleave.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::models::{Task, TaskKind, TaskStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task {0} not found")]
    NotFound(String),

    #[error("task {0} already exists")]
    AlreadyExists(String),

    #[error("failed to read task store at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write task store at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse task store at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// On-disk shape of `data/dev-tasks.json`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Document {
    tasks: BTreeMap<String, Task>,
}

/// Narrow persistence interface, per the design note that the store
/// should be swappable without touching the executor.
#[async_trait::async_trait]
pub trait TaskStore: Send + Sync {
    async fn add(
        &self,
        id: &str,
        title: &str,
        content: &str,
        kind: TaskKind,
        needs_plan_review: bool,
    ) -> Result<(), StoreError>;

    async fn claim(&self, id: &str, port: Option<u16>) -> Result<Option<Task>, StoreError>;
    async fn complete(&self, id: &str) -> Result<(), StoreError>;
    async fn fail(&self, id: &str, error: &str) -> Result<(), StoreError>;
    async fn to_plan_review(&self, id: &str, plan_content: &str) -> Result<(), StoreError>;
    async fn to_pending(&self, id: &str) -> Result<(), StoreError>;
    async fn list_pending(&self) -> Result<Vec<String>, StoreError>;
    async fn load(&self, id: &str) -> Result<Task, StoreError>;
    async fn list_all(&self) -> Result<Vec<Task>, StoreError>;

    /// `plan_review` -> `pending`, keeping `plan_content`. `None` if the
    /// task is not currently in `plan_review`.
    async fn approve_plan(&self, id: &str) -> Result<Option<Task>, StoreError>;
    /// `plan_review` -> `pending`, clearing `plan_content` and appending
    /// `feedback` to `content`. `None` if not in `plan_review`.
    async fn revise_plan(&self, id: &str, feedback: &str) -> Result<Option<Task>, StoreError>;
    /// `plan_review` -> `failed`. `None` if not in `plan_review`.
    async fn reject_plan(&self, id: &str) -> Result<Option<Task>, StoreError>;
    /// `failed` -> `pending`, clearing `error`. `None` if not `failed`.
    async fn rerun(&self, id: &str) -> Result<Option<Task>, StoreError>;
}

/// File-backed implementation of [`TaskStore`].
///
/// `path` is the full path to `dev-tasks.json`; the temp file used for
/// the atomic rename is written alongside it in the same directory so
/// the rename is guaranteed to stay on one filesystem.
pub struct JsonTaskStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonTaskStore {
    /// Open (or lazily create on first write) a store rooted at `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: data_dir.into().join("dev-tasks.json"),
            lock: Mutex::new(()),
        }
    }

    fn read_document(&self) -> Result<Document, StoreError> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => {
                serde_json::from_str(&contents).map_err(|source| StoreError::Parse {
                    path: self.path.clone(),
                    source,
                })
            }
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(Document::default()),
            Err(source) => Err(StoreError::Read {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn write_document(&self, doc: &Document) -> Result<(), StoreError> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir).map_err(|source| StoreError::Write {
            path: self.path.clone(),
            source,
        })?;

        let contents = serde_json::to_string_pretty(doc).expect("Document serializes");

        let tmp_path = dir.join(format!(
            ".dev-tasks.json.{}.tmp",
            std::process::id()
        ));
        std::fs::write(&tmp_path, contents).map_err(|source| StoreError::Write {
            path: tmp_path.clone(),
            source,
        })?;
        std::fs::rename(&tmp_path, &self.path).map_err(|source| StoreError::Write {
            path: self.path.clone(),
            source,
        })?;
        Ok(())
    }

    /// Run `f` against the document under the write lock, persisting the
    /// result if `f` returns `Ok`.
    async fn mutate<T>(
        &self,
        f: impl FnOnce(&mut Document) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let _guard = self.lock.lock().await;
        let mut doc = self.read_document()?;
        let result = f(&mut doc)?;
        self.write_document(&doc)?;
        Ok(result)
    }
}

#[async_trait::async_trait]
impl TaskStore for JsonTaskStore {
    async fn add(
        &self,
        id: &str,
        title: &str,
        content: &str,
        kind: TaskKind,
        needs_plan_review: bool,
    ) -> Result<(), StoreError> {
        let id = id.to_owned();
        let title = title.to_owned();
        let content = content.to_owned();
        self.mutate(move |doc| {
            if doc.tasks.contains_key(&id) {
                return Err(StoreError::AlreadyExists(id));
            }
            let task = Task::new(id.clone(), title, content, kind, needs_plan_review);
            doc.tasks.insert(id, task);
            Ok(())
        })
        .await
    }

    async fn claim(&self, id: &str, port: Option<u16>) -> Result<Option<Task>, StoreError> {
        let id = id.to_owned();
        self.mutate(move |doc| {
            let Some(task) = doc.tasks.get_mut(&id) else {
                return Err(StoreError::NotFound(id));
            };
            if task.status != TaskStatus::Pending {
                return Ok(None);
            }
            task.status = TaskStatus::InProgress;
            task.worker_port = port;
            task.modified = Utc::now();
            Ok(Some(task.clone()))
        })
        .await
    }

    async fn complete(&self, id: &str) -> Result<(), StoreError> {
        let id = id.to_owned();
        self.mutate(move |doc| {
            let task = doc.tasks.get_mut(&id).ok_or(StoreError::NotFound(id))?;
            task.status = TaskStatus::Completed;
            task.worker_port = None;
            task.modified = Utc::now();
            Ok(())
        })
        .await
    }

    async fn fail(&self, id: &str, error: &str) -> Result<(), StoreError> {
        let id = id.to_owned();
        let error = error.to_owned();
        self.mutate(move |doc| {
            let task = doc.tasks.get_mut(&id).ok_or(StoreError::NotFound(id))?;
            task.status = TaskStatus::Failed;
            task.error = Some(error);
            task.worker_port = None;
            task.modified = Utc::now();
            Ok(())
        })
        .await
    }

    async fn to_plan_review(&self, id: &str, plan_content: &str) -> Result<(), StoreError> {
        let id = id.to_owned();
        let plan_content = plan_content.to_owned();
        self.mutate(move |doc| {
            let task = doc.tasks.get_mut(&id).ok_or(StoreError::NotFound(id))?;
            task.status = TaskStatus::PlanReview;
            task.plan_content = Some(plan_content);
            task.worker_port = None;
            task.modified = Utc::now();
            Ok(())
        })
        .await
    }

    async fn to_pending(&self, id: &str) -> Result<(), StoreError> {
        let id = id.to_owned();
        self.mutate(move |doc| {
            let task = doc.tasks.get_mut(&id).ok_or(StoreError::NotFound(id))?;
            task.status = TaskStatus::Pending;
            task.worker_port = None;
            task.modified = Utc::now();
            Ok(())
        })
        .await
    }

    async fn list_pending(&self) -> Result<Vec<String>, StoreError> {
        let _guard = self.lock.lock().await;
        let doc = self.read_document()?;
        let mut pending: Vec<&Task> = doc
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .collect();
        pending.sort_by_key(|t| t.created);
        Ok(pending.into_iter().map(|t| t.id.clone()).collect())
    }

    async fn approve_plan(&self, id: &str) -> Result<Option<Task>, StoreError> {
        let id = id.to_owned();
        self.mutate(move |doc| {
            let task = doc.tasks.get_mut(&id).ok_or(StoreError::NotFound(id))?;
            if task.status != TaskStatus::PlanReview {
                return Ok(None);
            }
            task.status = TaskStatus::Pending;
            task.worker_port = None;
            task.modified = Utc::now();
            Ok(Some(task.clone()))
        })
        .await
    }

    async fn revise_plan(&self, id: &str, feedback: &str) -> Result<Option<Task>, StoreError> {
        let id = id.to_owned();
        let feedback = feedback.to_owned();
        self.mutate(move |doc| {
            let task = doc.tasks.get_mut(&id).ok_or(StoreError::NotFound(id))?;
            if task.status != TaskStatus::PlanReview {
                return Ok(None);
            }
            task.status = TaskStatus::Pending;
            task.plan_content = None;
            task.worker_port = None;
            if !feedback.is_empty() {
                task.content = format!("{}\n\n{}", task.content, feedback);
            }
            task.modified = Utc::now();
            Ok(Some(task.clone()))
        })
        .await
    }

    async fn reject_plan(&self, id: &str) -> Result<Option<Task>, StoreError> {
        let id = id.to_owned();
        self.mutate(move |doc| {
            let task = doc.tasks.get_mut(&id).ok_or(StoreError::NotFound(id))?;
            if task.status != TaskStatus::PlanReview {
                return Ok(None);
            }
            task.status = TaskStatus::Failed;
            task.worker_port = None;
            task.modified = Utc::now();
            Ok(Some(task.clone()))
        })
        .await
    }

    async fn rerun(&self, id: &str) -> Result<Option<Task>, StoreError> {
        let id = id.to_owned();
        self.mutate(move |doc| {
            let task = doc.tasks.get_mut(&id).ok_or(StoreError::NotFound(id))?;
            if task.status != TaskStatus::Failed {
                return Ok(None);
            }
            task.status = TaskStatus::Pending;
            task.error = None;
            task.worker_port = None;
            task.modified = Utc::now();
            Ok(Some(task.clone()))
        })
        .await
    }

    async fn load(&self, id: &str) -> Result<Task, StoreError> {
        let _guard = self.lock.lock().await;
        let doc = self.read_document()?;
        doc.tasks
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_owned()))
    }

    async fn list_all(&self) -> Result<Vec<Task>, StoreError> {
        let _guard = self.lock.lock().await;
        let doc = self.read_document()?;
        Ok(doc.tasks.into_values().collect())
    }
}
