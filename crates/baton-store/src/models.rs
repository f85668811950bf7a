use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a task in the dispatcher's state machine.
///
/// ```text
/// pending -> in_progress -> plan_review -> pending   (plan approved/revised)
///                        -> completed
///                        -> failed
/// plan_review -> failed                              (plan rejected)
/// failed -> pending                                  (rerun)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    PlanReview,
    InProgress,
    Completed,
    Failed,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::PlanReview => "plan_review",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "plan_review" => Ok(Self::PlanReview),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Kind of a task. Metadata only -- carries no scheduling weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Feature,
    Bugfix,
    Refactor,
    Chore,
    Docs,
    Test,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Feature => "feature",
            Self::Bugfix => "bugfix",
            Self::Refactor => "refactor",
            Self::Chore => "chore",
            Self::Docs => "docs",
            Self::Test => "test",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskKind {
    type Err = TaskKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "feature" => Ok(Self::Feature),
            "bugfix" => Ok(Self::Bugfix),
            "refactor" => Ok(Self::Refactor),
            "chore" => Ok(Self::Chore),
            "docs" => Ok(Self::Docs),
            "test" => Ok(Self::Test),
            other => Err(TaskKindParseError(other.to_owned())),
        }
    }
}

impl Default for TaskKind {
    fn default() -> Self {
        Self::Feature
    }
}

/// Error returned when parsing an invalid [`TaskKind`] string.
#[derive(Debug, Clone)]
pub struct TaskKindParseError(pub String);

impl fmt::Display for TaskKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task kind: {:?}", self.0)
    }
}

impl std::error::Error for TaskKindParseError {}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// The central entity: a unit of autonomous coding work.
///
/// Identified by an opaque 8-char lowercase hex id. Task records are
/// plain values -- the store is the only thing that mutates them, and
/// always as a whole-document replace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub content: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub needs_plan_review: bool,
    pub plan_content: Option<String>,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub worker_port: Option<u16>,
    pub error: Option<String>,
}

impl Task {
    pub fn new(id: String, title: String, content: String, kind: TaskKind, needs_plan_review: bool) -> Self {
        let now = Utc::now();
        Self {
            id,
            title,
            content,
            kind,
            status: TaskStatus::Pending,
            needs_plan_review,
            plan_content: None,
            created: now,
            modified: now,
            worker_port: None,
            error: None,
        }
    }

    /// Whether this task still needs a plan phase before full execution.
    pub fn needs_plan_phase(&self) -> bool {
        self.needs_plan_review && self.plan_content.is_none()
    }
}
