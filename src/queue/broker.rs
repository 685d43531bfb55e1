//! Job delivery with visibility-timeout leases.
//!
//! A claimed job stays in the broker, hidden until its lease deadline. The
//! worker acknowledges it when done; if the worker disappears, the deadline
//! passes and the job is delivered again. Delivery is therefore
//! at-least-once, and a late acknowledgement from a worker whose lease was
//! already handed to someone else is rejected.

use crate::model::SourceDocument;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// Work item referencing the document bytes of one task.
#[derive(Debug, Clone)]
pub struct Job {
    pub task_id: String,
    pub document: SourceDocument,
}

/// A claimed job. `lease_id` is what the worker acknowledges.
#[derive(Debug, Clone)]
pub struct Lease {
    pub lease_id: u64,
    /// 1 on first delivery, higher on redelivery or retry.
    pub delivery: u32,
    pub job: Job,
}

/// Queue between the acceptance boundary and the worker pool.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, job: Job);

    /// Claim the oldest visible job, hiding it for the visibility timeout.
    async fn claim(&self) -> Option<Lease>;

    /// Remove a job for good. `false` if the lease is no longer current.
    async fn ack(&self, lease_id: u64) -> bool;

    /// Give a job back, visible again after `delay`. `false` if the lease
    /// is no longer current.
    async fn requeue(&self, lease_id: u64, delay: Duration) -> bool;

    /// Jobs not yet acknowledged, visible or not.
    async fn len(&self) -> usize;
}

#[derive(Debug)]
struct Entry {
    job: Job,
    visible_at: Instant,
    lease: Option<u64>,
    deliveries: u32,
}

#[derive(Debug, Default)]
struct State {
    next_seq: u64,
    next_lease: u64,
    /// Keyed by publish order so claims are FIFO among visible jobs.
    entries: BTreeMap<u64, Entry>,
}

/// In-process [`Broker`].
#[derive(Debug)]
pub struct MemoryBroker {
    visibility_timeout: Duration,
    state: Mutex<State>,
}

impl MemoryBroker {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            visibility_timeout,
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        // Poisoning is ignored; the state is plain data.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn find_lease(state: &mut State, lease_id: u64) -> Option<u64> {
        state
            .entries
            .iter()
            .find(|(_, e)| e.lease == Some(lease_id))
            .map(|(seq, _)| *seq)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, job: Job) {
        let mut state = self.state();
        let seq = state.next_seq;
        state.next_seq += 1;
        debug!("Published job for task {}", job.task_id);
        state.entries.insert(
            seq,
            Entry {
                job,
                visible_at: Instant::now(),
                lease: None,
                deliveries: 0,
            },
        );
    }

    async fn claim(&self) -> Option<Lease> {
        let now = Instant::now();
        let mut state = self.state();
        let lease_id = state.next_lease;
        let entry = state.entries.values_mut().find(|e| e.visible_at <= now)?;

        if entry.lease.is_some() {
            debug!("Lease expired for task {}; redelivering", entry.job.task_id);
        }
        entry.lease = Some(lease_id);
        entry.visible_at = now + self.visibility_timeout;
        entry.deliveries += 1;
        let lease = Lease {
            lease_id,
            delivery: entry.deliveries,
            job: entry.job.clone(),
        };
        state.next_lease += 1;
        Some(lease)
    }

    async fn ack(&self, lease_id: u64) -> bool {
        let mut state = self.state();
        match Self::find_lease(&mut state, lease_id) {
            Some(seq) => {
                state.entries.remove(&seq);
                true
            }
            None => false,
        }
    }

    async fn requeue(&self, lease_id: u64, delay: Duration) -> bool {
        let mut state = self.state();
        let Some(seq) = Self::find_lease(&mut state, lease_id) else {
            return false;
        };
        if let Some(entry) = state.entries.get_mut(&seq) {
            entry.lease = None;
            entry.visible_at = Instant::now() + delay;
        }
        true
    }

    async fn len(&self) -> usize {
        self.state().entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(task_id: &str) -> Job {
        Job {
            task_id: task_id.into(),
            document: SourceDocument::new(b"%PDF-1.4".to_vec(), None),
        }
    }

    #[tokio::test]
    async fn claimed_job_is_invisible_until_acked() {
        let broker = MemoryBroker::new(Duration::from_secs(60));
        broker.publish(job("a")).await;

        let lease = broker.claim().await.unwrap();
        assert_eq!(lease.job.task_id, "a");
        assert_eq!(lease.delivery, 1);
        assert!(broker.claim().await.is_none());

        assert!(broker.ack(lease.lease_id).await);
        assert_eq!(broker.len().await, 0);
    }

    #[tokio::test]
    async fn expired_lease_is_redelivered_and_stale_ack_rejected() {
        let broker = MemoryBroker::new(Duration::from_millis(10));
        broker.publish(job("a")).await;

        let first = broker.claim().await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let second = broker.claim().await.unwrap();
        assert_eq!(second.job.task_id, "a");
        assert_eq!(second.delivery, 2);

        assert!(!broker.ack(first.lease_id).await);
        assert!(broker.ack(second.lease_id).await);
    }

    #[tokio::test]
    async fn requeue_delays_visibility() {
        let broker = MemoryBroker::new(Duration::from_secs(60));
        broker.publish(job("a")).await;
        let lease = broker.claim().await.unwrap();

        assert!(broker.requeue(lease.lease_id, Duration::from_millis(20)).await);
        assert!(broker.claim().await.is_none());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(broker.claim().await.unwrap().delivery, 2);
    }

    #[tokio::test]
    async fn claims_are_fifo() {
        let broker = MemoryBroker::new(Duration::from_secs(60));
        broker.publish(job("a")).await;
        broker.publish(job("b")).await;
        assert_eq!(broker.claim().await.unwrap().job.task_id, "a");
        assert_eq!(broker.claim().await.unwrap().job.task_id, "b");
    }
}
