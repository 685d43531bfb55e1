//! Task record and its status state machine.
//!
//! ```text
//! PENDING ─▶ STARTED ─▶ SUCCESS
//!               │
//!               └──▶ FAILURE ─(retries left)─▶ RETRY ─▶ STARTED
//! ```
//!
//! `SUCCESS` and `FAILURE` are terminal once recorded without a retry.
//! `STARTED ─▶ STARTED` is allowed: it is a redelivered job whose previous
//! worker lost its lease.

use crate::error::{ErrorClass, PipelineError};
use crate::output::PipelineResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Started,
    Success,
    Failure,
    Retry,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failure)
    }

    /// Whether `self → next` is a legal edge of the state machine.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Started)
                | (Started, Started)
                | (Started, Success)
                | (Started, Failure)
                | (Failure, Retry)
                | (Retry, Started)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Started => "STARTED",
            TaskStatus::Success => "SUCCESS",
            TaskStatus::Failure => "FAILURE",
            TaskStatus::Retry => "RETRY",
        };
        f.write_str(s)
    }
}

/// Classified error summary exposed through the status query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub class: ErrorClass,
    pub retryable: bool,
    pub message: String,
}

impl From<&PipelineError> for TaskError {
    fn from(e: &PipelineError) -> Self {
        let class = e.class();
        Self {
            class,
            retryable: class.is_retryable(),
            message: e.to_string(),
        }
    }
}

/// One asynchronous processing job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub status: TaskStatus,
    /// Task-level retries performed so far.
    pub retry_count: u32,
    pub file_id: String,
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<PipelineResult>,
    /// Last failure. Kept while `RETRY` so callers can see why.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(file_id: impl Into<String>, filename: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id: uuid::Uuid::new_v4().to_string(),
            status: TaskStatus::Pending,
            retry_count: 0,
            file_id: file_id.into(),
            filename,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
