//! The task queue: acceptance, worker pool and task-level retry.
//!
//! ## Execution model
//!
//! [`TaskQueue::enqueue`] records a `PENDING` task, publishes a job and
//! returns the task id without waiting. Worker loops claim jobs from the
//! [`Broker`], run the [`Pipeline`] and record the outcome.
//!
//! ## Retry
//!
//! A failed run is retried only when its [`crate::error::ErrorClass`] is
//! retryable and the task still has budget in [`QueueConfig::retry`]. The
//! job goes back to the broker with exponential backoff as its visibility
//! delay; the task shows `RETRY` meanwhile. Everything else ends in
//! `FAILURE`. If the broker refuses the requeue because the lease already
//! passed to another delivery, the task is left to that delivery.
//!
//! ## Redelivery
//!
//! The broker may deliver a job again after a lease expires. A delivery for
//! a task that is already terminal is acknowledged and skipped; otherwise
//! the document is processed again, which is safe because storage upserts
//! by `chunk_id`.
//!
//! ## Expiry
//!
//! Terminal tasks older than [`QueueConfig::result_ttl`] are dropped from the
//! registry on every enqueue and whenever a worker finds the broker empty.

use super::broker::{Broker, Job, Lease, MemoryBroker};
use super::registry::TaskRegistry;
use super::task::{Task, TaskError};
use crate::config::QueueConfig;
use crate::error::{PipelineError, QueueError};
use crate::model::SourceDocument;
use crate::orchestrator::Pipeline;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Acceptance boundary plus worker pool over one shared [`Pipeline`].
pub struct TaskQueue {
    pipeline: Arc<Pipeline>,
    broker: Arc<dyn Broker>,
    registry: Arc<TaskRegistry>,
    config: QueueConfig,
}

impl TaskQueue {
    /// Queue backed by an in-process [`MemoryBroker`].
    pub fn new(pipeline: Arc<Pipeline>, config: QueueConfig) -> Self {
        let broker = Arc::new(MemoryBroker::new(config.visibility_timeout()));
        Self::with_broker(pipeline, broker, config)
    }

    pub fn with_broker(pipeline: Arc<Pipeline>, broker: Arc<dyn Broker>, config: QueueConfig) -> Self {
        Self {
            pipeline,
            broker,
            registry: Arc::new(TaskRegistry::new()),
            config,
        }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Accept a document. Returns the new task id immediately.
    pub async fn enqueue(&self, document: SourceDocument) -> String {
        self.registry.purge_expired(self.config.result_ttl());
        let task = self
            .registry
            .create(document.file_id(), document.filename().map(str::to_string));
        info!(
            task_id = %task.task_id,
            file_id = %task.file_id,
            "Accepted {} bytes",
            document.len()
        );
        self.broker
            .publish(Job {
                task_id: task.task_id.clone(),
                document,
            })
            .await;
        task.task_id
    }

    /// Current state of a task, or `None` for an unknown id.
    pub fn status(&self, task_id: &str) -> Option<Task> {
        self.registry.get(task_id)
    }

    /// Poll until the task is terminal or `timeout` elapses; returns the
    /// last observed state.
    pub async fn wait_for(&self, task_id: &str, timeout: Duration) -> Option<Task> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let task = self.status(task_id)?;
            if task.is_terminal() || tokio::time::Instant::now() >= deadline {
                return Some(task);
            }
            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }

    /// Claim and handle one visible job. Returns `false` when none was
    /// visible.
    pub async fn run_once(&self) -> bool {
        match self.broker.claim().await {
            Some(lease) => {
                self.handle(lease).await;
                true
            }
            None => false,
        }
    }

    /// Start `config.workers` worker loops. They stop after their current
    /// job once `shutdown` becomes `true` or its sender is dropped.
    pub fn spawn_workers(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        (0..self.config.workers.max(1))
            .map(|worker_id| {
                let queue = Arc::clone(self);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { queue.worker_loop(worker_id, shutdown).await })
            })
            .collect()
    }

    async fn worker_loop(&self, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        info!("Worker {} started", worker_id);
        loop {
            if *shutdown.borrow() {
                break;
            }
            if self.run_once().await {
                continue;
            }
            self.registry.purge_expired(self.config.result_ttl());
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
            }
        }
        info!("Worker {} stopped", worker_id);
    }

    /// Process one delivery end to end.
    async fn handle(&self, lease: Lease) {
        let task_id = lease.job.task_id.clone();

        let task = match self.registry.get(&task_id) {
            Some(task) => task,
            None => {
                warn!(task_id = %task_id, "Dropping job for unknown task");
                self.broker.ack(lease.lease_id).await;
                return;
            }
        };
        if task.is_terminal() {
            debug!(task_id = %task_id, "Task already {}; skipping redelivery", task.status);
            self.broker.ack(lease.lease_id).await;
            return;
        }
        if let Err(e) = self.registry.start(&task_id) {
            error!(task_id = %task_id, "{}", e);
            self.broker.ack(lease.lease_id).await;
            return;
        }
        info!(
            task_id = %task_id,
            attempt = task.retry_count + 1,
            delivery = lease.delivery,
            "Task started"
        );

        let outcome = self.execute(lease.job.document.clone()).await;
        if let Err(e) = self.record(&task_id, task.retry_count, lease.lease_id, outcome).await {
            error!(task_id = %task_id, "Could not record outcome: {}", e);
        }
    }

    /// Run the pipeline on its own task so a panic becomes an `Internal`
    /// failure instead of killing the worker loop.
    async fn execute(&self, document: SourceDocument) -> Result<crate::output::PipelineResult, PipelineError> {
        let pipeline = Arc::clone(&self.pipeline);
        match tokio::spawn(async move { pipeline.process(&document).await }).await {
            Ok(outcome) => outcome,
            Err(join) => Err(PipelineError::Internal(format!("pipeline task aborted: {}", join))),
        }
    }

    async fn record(
        &self,
        task_id: &str,
        retries_done: u32,
        lease_id: u64,
        outcome: Result<crate::output::PipelineResult, PipelineError>,
    ) -> Result<(), QueueError> {
        match outcome {
            Ok(result) => {
                info!(
                    task_id = %task_id,
                    file_id = %result.file_id,
                    "Task succeeded: {} chunks stored, {} warnings",
                    result.chunks_added,
                    result.warnings.len()
                );
                let recorded = self.registry.succeed(task_id, result);
                if !self.broker.ack(lease_id).await {
                    warn!(task_id = %task_id, "Lease expired before ack; a duplicate run will be skipped");
                }
                recorded?;
            }
            Err(e) => {
                let summary = TaskError::from(&e);
                let retry = summary.retryable && self.config.retry.allows_retry(retries_done);
                if retry {
                    let delay = self.config.retry.backoff(retries_done + 1);
                    warn!(
                        task_id = %task_id,
                        attempt = retries_done + 1,
                        "Task failed [{}]: {}; retry {}/{} in {}ms",
                        summary.class,
                        e,
                        retries_done + 1,
                        self.config.retry.max_retries,
                        delay.as_millis()
                    );
                    if !self.broker.requeue(lease_id, delay).await {
                        warn!(
                            task_id = %task_id,
                            "Lease expired before requeue; leaving the task to its current delivery"
                        );
                        return Ok(());
                    }
                    self.registry.fail(task_id, summary, true)?;
                } else {
                    error!(task_id = %task_id, "Task failed [{}]: {}", summary.class, e);
                    let recorded = self.registry.fail(task_id, summary, false);
                    if !self.broker.ack(lease_id).await {
                        warn!(task_id = %task_id, "Lease expired before ack; a duplicate run will be skipped");
                    }
                    recorded?;
                }
            }
        }
        Ok(())
    }
}
