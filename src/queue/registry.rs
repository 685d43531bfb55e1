//! Task status storage.
//!
//! Every mutation goes through [`TaskStatus::can_transition_to`], so a task
//! in a terminal state can never be overwritten by a late or duplicate
//! worker.
//!
//! Finished tasks are kept for a configurable time so clients can collect
//! their result, then dropped by [`TaskRegistry::purge_expired`].

use super::task::{Task, TaskError, TaskStatus};
use crate::error::QueueError;
use crate::output::PipelineResult;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<String, Task>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new `PENDING` task and return a copy of it.
    pub fn create(&self, file_id: &str, filename: Option<String>) -> Task {
        let task = Task::new(file_id, filename);
        self.write().insert(task.task_id.clone(), task.clone());
        task
    }

    pub fn get(&self, task_id: &str) -> Option<Task> {
        self.read().get(task_id).cloned()
    }

    /// Drop terminal tasks last updated at least `ttl` ago. Pending and
    /// running tasks are never dropped. Returns how many were removed.
    pub fn purge_expired(&self, ttl: Duration) -> usize {
        let Ok(ttl) = chrono::Duration::from_std(ttl) else {
            return 0;
        };
        let cutoff = Utc::now() - ttl;
        let mut tasks = self.write();
        let before = tasks.len();
        tasks.retain(|_, task| !(task.is_terminal() && task.updated_at <= cutoff));
        let purged = before - tasks.len();
        if purged > 0 {
            debug!("Purged {} expired task results", purged);
        }
        purged
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `PENDING | RETRY | STARTED → STARTED`.
    pub fn start(&self, task_id: &str) -> Result<Task, QueueError> {
        self.update(task_id, |task| transition(task, TaskStatus::Started))
    }

    /// `STARTED → SUCCESS` with the pipeline result.
    pub fn succeed(&self, task_id: &str, result: PipelineResult) -> Result<Task, QueueError> {
        self.update(task_id, |task| {
            transition(task, TaskStatus::Success)?;
            task.result = Some(result);
            task.error = None;
            Ok(())
        })
    }

    /// `STARTED → FAILURE`, and on to `RETRY` when `retry` is set.
    ///
    /// Both edges are applied under one lock so a status query never sees a
    /// `FAILURE` that is about to be retried.
    pub fn fail(&self, task_id: &str, error: TaskError, retry: bool) -> Result<Task, QueueError> {
        self.update(task_id, |task| {
            transition(task, TaskStatus::Failure)?;
            if retry {
                transition(task, TaskStatus::Retry)?;
                task.retry_count += 1;
            }
            task.error = Some(error);
            Ok(())
        })
    }

    fn update<F>(&self, task_id: &str, f: F) -> Result<Task, QueueError>
    where
        F: FnOnce(&mut Task) -> Result<(), QueueError>,
    {
        let mut tasks = self.write();
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| QueueError::UnknownTask(task_id.to_string()))?;
        // Work on a copy so a rejected transition leaves the record untouched.
        let mut next = task.clone();
        f(&mut next)?;
        next.updated_at = Utc::now();
        *task = next.clone();
        Ok(next)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Task>> {
        self.tasks.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Task>> {
        self.tasks.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn transition(task: &mut Task, next: TaskStatus) -> Result<(), QueueError> {
    if !task.status.can_transition_to(next) {
        return Err(QueueError::InvalidTransition {
            task_id: task.task_id.clone(),
            from: task.status.to_string(),
            to: next.to_string(),
        });
    }
    task.status = next;
    Ok(())
}
