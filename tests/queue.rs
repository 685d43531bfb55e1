//! Task queue behaviour: acceptance, retry classification, worker pool.

mod common;

use common::*;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use transcritor::error::{ErrorClass, ExternalError};
use transcritor::queue::{Broker, Job, MemoryBroker};
use transcritor::{QueueConfig, RetryPolicy, SourceDocument, TaskQueue, TaskStatus, VectorStore};

fn fast_queue() -> QueueConfig {
    QueueConfig {
        workers: 2,
        retry: RetryPolicy {
            max_retries: 2,
            base_backoff_ms: 1,
            max_backoff_ms: 1,
        },
        visibility_timeout_secs: 60,
        poll_interval_ms: 5,
        result_ttl_secs: 3600,
    }
}

fn no_call_retry() -> transcritor::PipelineConfig {
    transcritor::PipelineConfig {
        call_retry: RetryPolicy::none(),
        ..test_config()
    }
}

/// Run jobs on the current task until `task_id` is terminal.
async fn drain(queue: &TaskQueue, task_id: &str) {
    for _ in 0..200 {
        if queue.status(task_id).is_some_and(|t| t.is_terminal()) {
            return;
        }
        if !queue.run_once().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
    panic!("task {task_id} never finished");
}

#[tokio::test]
async fn enqueue_returns_a_pending_task_without_processing() {
    let h = harness(2, ScriptedExtractor::healthy());
    let extractor = h.extractor.clone();
    let queue = TaskQueue::new(Arc::new(h.pipeline), fast_queue());

    let task_id = queue
        .enqueue(SourceDocument::new(pdf_bytes("pending"), Some("a.pdf".into())))
        .await;

    let task = queue.status(&task_id).expect("task recorded");
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.retry_count, 0);
    assert_eq!(task.filename.as_deref(), Some("a.pdf"));
    assert!(task.result.is_none());
    assert_eq!(extractor.calls_for(0), 0);
    assert!(queue.status("no-such-task").is_none());
}

#[tokio::test]
async fn successful_task_carries_the_pipeline_result() {
    let h = harness(2, ScriptedExtractor::healthy());
    let store = h.store.clone();
    let queue = TaskQueue::new(Arc::new(h.pipeline), fast_queue());
    let doc = SourceDocument::new(pdf_bytes("success"), None);
    let file_id = doc.file_id().to_string();

    let task_id = queue.enqueue(doc).await;
    drain(&queue, &task_id).await;

    let task = queue.status(&task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Success);
    let result = task.result.expect("result on success");
    assert_eq!(result.file_id, file_id);
    assert_eq!(result.chunks_added, store.count().await.unwrap());
    assert!(task.error.is_none());
}

#[tokio::test]
async fn empty_upload_fails_once_as_invalid_input() {
    let h = harness(1, ScriptedExtractor::healthy());
    let store = h.store.clone();
    let queue = TaskQueue::new(Arc::new(h.pipeline), fast_queue());

    let task_id = queue.enqueue(SourceDocument::new(Vec::<u8>::new(), None)).await;
    drain(&queue, &task_id).await;

    let task = queue.status(&task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Failure);
    assert_eq!(task.retry_count, 0, "invalid input is never retried");
    let error = task.error.expect("error summary");
    assert_eq!(error.class, ErrorClass::InvalidInput);
    assert!(!error.retryable);
    assert_eq!(store.count().await.unwrap(), 0);
}

#[tokio::test]
async fn transient_failures_are_retried_up_to_the_budget() {
    let embedder = Arc::new(RateLimitedEmbedder {
        requests: Default::default(),
    });
    let h = harness_with(
        1,
        ScriptedExtractor::healthy(),
        FakeParser::ok(),
        embedder.clone(),
        RecordingStore::new(),
        no_call_retry(),
    );
    let extractor = h.extractor.clone();
    let queue = TaskQueue::new(Arc::new(h.pipeline), fast_queue());

    let task_id = queue.enqueue(SourceDocument::new(pdf_bytes("throttled"), None)).await;
    drain(&queue, &task_id).await;

    let task = queue.status(&task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Failure);
    assert_eq!(task.retry_count, 2);
    assert_eq!(task.error.unwrap().class, ErrorClass::TransientExternal);
    // One initial run plus two task retries.
    assert_eq!(extractor.calls_for(0), 3);
    assert!(embedder.requests.load(Ordering::SeqCst) >= 3);
}

#[tokio::test]
async fn storage_failure_is_retried_and_then_succeeds() {
    let h = harness_with(
        2,
        ScriptedExtractor::healthy(),
        FakeParser::ok(),
        Arc::new(HashEmbedder::new()),
        RecordingStore::failing_first(1),
        no_call_retry(),
    );
    let store = h.store.clone();
    let queue = TaskQueue::new(Arc::new(h.pipeline), fast_queue());

    let task_id = queue.enqueue(SourceDocument::new(pdf_bytes("flaky-db"), None)).await;
    drain(&queue, &task_id).await;

    let task = queue.status(&task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Success);
    assert_eq!(task.retry_count, 1);
    assert_eq!(store.upsert_pages.lock().unwrap().len(), 1);
    assert_eq!(task.result.unwrap().chunks_added, store.count().await.unwrap());
}

#[tokio::test]
async fn worker_pool_processes_tasks_and_stops_on_shutdown() {
    let h = harness(2, ScriptedExtractor::healthy());
    let queue = Arc::new(TaskQueue::new(Arc::new(h.pipeline), fast_queue()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = queue.spawn_workers(shutdown_rx);
    assert_eq!(workers.len(), 2);

    let first = queue.enqueue(SourceDocument::new(pdf_bytes("pool-1"), None)).await;
    let second = queue.enqueue(SourceDocument::new(pdf_bytes("pool-2"), None)).await;

    for task_id in [&first, &second] {
        let task = queue
            .wait_for(task_id, Duration::from_secs(10))
            .await
            .expect("known task");
        assert_eq!(task.status, TaskStatus::Success, "task {task_id}");
    }

    shutdown_tx.send(true).expect("workers listening");
    for worker in workers {
        tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .expect("worker stopped")
            .expect("worker did not panic");
    }
}

#[tokio::test]
async fn redelivery_of_a_finished_task_is_skipped() {
    let h = harness(1, ScriptedExtractor::healthy());
    let extractor = h.extractor.clone();
    let broker = Arc::new(MemoryBroker::new(Duration::from_secs(60)));
    let queue = TaskQueue::with_broker(Arc::new(h.pipeline), broker.clone(), fast_queue());
    let doc = SourceDocument::new(pdf_bytes("redelivered"), None);

    let task_id = queue.enqueue(doc.clone()).await;
    drain(&queue, &task_id).await;
    let finished = queue.status(&task_id).unwrap();
    assert_eq!(finished.status, TaskStatus::Success);

    // Same job again, as a broker with at-least-once delivery might do.
    broker
        .publish(Job {
            task_id: task_id.clone(),
            document: doc,
        })
        .await;
    assert!(queue.run_once().await);

    assert_eq!(queue.status(&task_id).unwrap(), finished);
    assert_eq!(extractor.calls_for(0), 1);
    assert_eq!(broker.len().await, 0);
}

/// Two overlapping deliveries of one job: the first lease expires while its
/// run is still going, so the broker hands the job to a second run. The
/// first run finishes after 100 ms, the second after 300 ms.
async fn overlapping_deliveries(
    extractor: ScriptedExtractor,
) -> (TaskQueue, Arc<MemoryBroker>, Arc<ScriptedExtractor>, String) {
    let extractor = extractor.with_delay(|_, attempt| {
        Duration::from_millis(if attempt == 0 { 100 } else { 300 })
    });
    let h = harness_with(
        1,
        extractor,
        FakeParser::ok(),
        Arc::new(HashEmbedder::new()),
        RecordingStore::new(),
        no_call_retry(),
    );
    let extractor = h.extractor.clone();
    let broker = Arc::new(MemoryBroker::new(Duration::from_millis(30)));
    let queue = TaskQueue::with_broker(Arc::new(h.pipeline), broker.clone(), fast_queue());

    let task_id = queue.enqueue(SourceDocument::new(pdf_bytes("overlap"), None)).await;
    let (first, second) = tokio::join!(queue.run_once(), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.run_once().await
    });
    assert!(first && second, "both deliveries claimed the job");
    (queue, broker, extractor, task_id)
}

#[tokio::test]
async fn a_rejected_late_success_still_acknowledges_its_lease() {
    let (queue, broker, extractor, task_id) = overlapping_deliveries(ScriptedExtractor::healthy()).await;

    assert_eq!(extractor.calls_for(0), 2);
    let task = queue.status(&task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Success);
    assert_eq!(broker.len().await, 0, "job must not stay leased");
}

#[tokio::test]
async fn a_failed_run_that_lost_its_lease_leaves_the_task_to_the_live_delivery() {
    let extractor = ScriptedExtractor::new(|page, attempt| {
        if attempt == 0 {
            Err(ExternalError::Transient("503 Service Unavailable".into()))
        } else {
            Ok(page_text(page))
        }
    });
    let (queue, broker, _, task_id) = overlapping_deliveries(extractor).await;

    let task = queue.status(&task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Success);
    assert_eq!(task.retry_count, 0);
    assert!(task.result.is_some());
    assert_eq!(broker.len().await, 0);
}

#[tokio::test]
async fn finished_tasks_expire_after_the_result_ttl() {
    let h = harness(1, ScriptedExtractor::healthy());
    let queue = TaskQueue::new(
        Arc::new(h.pipeline),
        QueueConfig {
            result_ttl_secs: 0,
            ..fast_queue()
        },
    );

    let first = queue.enqueue(SourceDocument::new(pdf_bytes("ttl-1"), None)).await;
    drain(&queue, &first).await;
    assert!(queue.status(&first).is_some_and(|t| t.is_terminal()));

    // Accepting the next document sweeps the expired one.
    let second = queue.enqueue(SourceDocument::new(pdf_bytes("ttl-2"), None)).await;
    assert!(queue.status(&first).is_none());
    assert_eq!(queue.status(&second).unwrap().status, TaskStatus::Pending);
    assert_eq!(queue.registry().len(), 1);
}
