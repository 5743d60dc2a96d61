//! In-memory queue backend for tests, demos, and local pipelines.
//!
//! Implements the full queue contract (ready/delayed/dead states, lease
//! visibility, attempt counting) without durability. Due jobs are leased
//! through the same interval-poller stream the durable backend uses, so a
//! worker cannot tell the two apart.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_core::stream::BoxStream;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::job::DispatchJob;
use crate::queue::{EnqueueJobs, LeaseJobs, LeasedJob, SettleJobs, poller::PollerBuilder};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Ready,
    Delayed,
    Dead,
}

#[derive(Debug)]
struct Slot {
    job: DispatchJob,
    policy: RetryPolicy,
    attempt: u32,
    state: SlotState,
    due_at: Instant,
    leased: bool,
    reason: Option<String>,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: i64,
    slots: BTreeMap<i64, Slot>,
}

/// An in-memory job queue.
///
/// Jobs are held in a map keyed by an incrementing correlation id, so
/// lease order is FIFO. Clones share the same store.
#[derive(Clone)]
pub struct InMemoryQueue {
    inner: Arc<Mutex<Inner>>,
    poll_interval: Duration,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new(Duration::from_millis(10))
    }
}

impl InMemoryQueue {
    /// Create a queue whose lease stream polls at the given interval.
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            poll_interval,
        }
    }

    /// Number of jobs waiting in *ready* or *delayed* state.
    pub async fn pending(&self) -> usize {
        let inner = self.inner.lock().await;
        inner
            .slots
            .values()
            .filter(|s| s.state != SlotState::Dead)
            .count()
    }

    /// Correlation id and reason of every job in the dead set.
    pub async fn dead(&self) -> Vec<(i64, String)> {
        let inner = self.inner.lock().await;
        inner
            .slots
            .iter()
            .filter(|(_, s)| s.state == SlotState::Dead)
            .map(|(id, s)| (*id, s.reason.clone().unwrap_or_default()))
            .collect()
    }

    /// Payloads of every job not in the dead set, in queue order.
    ///
    /// Primarily intended for tests.
    pub async fn queued_jobs(&self) -> Vec<DispatchJob> {
        let inner = self.inner.lock().await;
        inner
            .slots
            .values()
            .filter(|s| s.state != SlotState::Dead)
            .map(|s| s.job.clone())
            .collect()
    }

    /// True when no job is held in any state.
    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.slots.is_empty()
    }

    /// Lease every due job that no other consumer holds.
    async fn lease_due(inner: &Arc<Mutex<Inner>>) -> Vec<LeasedJob<i64>> {
        let now = Instant::now();
        let mut inner = inner.lock().await;
        let mut leased = Vec::new();

        for (id, slot) in inner.slots.iter_mut() {
            if slot.state != SlotState::Dead && !slot.leased && slot.due_at <= now {
                slot.leased = true;
                leased.push(LeasedJob {
                    id: *id,
                    attempt: slot.attempt,
                    policy: slot.policy,
                    job: slot.job.clone(),
                });
            }
        }

        leased
    }
}

#[async_trait]
impl EnqueueJobs for InMemoryQueue {
    type Error = InMemoryQueueError;
    type ID = i64;

    async fn enqueue(&self, job: DispatchJob, policy: RetryPolicy) -> Result<i64, Self::Error> {
        let mut inner = self.inner.lock().await;
        let id = inner.next_id;
        inner.next_id += 1;
        inner.slots.insert(
            id,
            Slot {
                job,
                policy,
                attempt: 0,
                state: SlotState::Ready,
                due_at: Instant::now(),
                leased: false,
                reason: None,
            },
        );
        Ok(id)
    }
}

#[async_trait]
impl LeaseJobs for InMemoryQueue {
    type Error = tower::BoxError;
    type ID = i64;

    async fn jobs(
        &self,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'_, Result<LeasedJob<i64>, Self::Error>>, Self::Error> {
        let inner = Arc::clone(&self.inner);
        let stream = PollerBuilder::new(self.poll_interval).start(cancel, move || {
            let inner = Arc::clone(&inner);
            async move { Ok(Self::lease_due(&inner).await) }
        });
        Ok(stream)
    }
}

#[async_trait]
impl SettleJobs for InMemoryQueue {
    type Error = InMemoryQueueError;
    type ID = i64;

    async fn complete(&self, job: LeasedJob<i64>) -> Result<(), Self::Error> {
        let mut inner = self.inner.lock().await;
        inner
            .slots
            .remove(&job.id)
            .map(drop)
            .ok_or_else(|| InMemoryQueueError::not_found(job.id))
    }

    async fn reschedule(&self, job: LeasedJob<i64>, delay: Duration) -> Result<(), Self::Error> {
        let mut inner = self.inner.lock().await;
        let slot = inner
            .slots
            .get_mut(&job.id)
            .ok_or_else(|| InMemoryQueueError::not_found(job.id))?;
        slot.attempt += 1;
        slot.state = SlotState::Delayed;
        slot.due_at = Instant::now() + delay;
        slot.leased = false;
        Ok(())
    }

    async fn fail(&self, job: LeasedJob<i64>, reason: String) -> Result<(), Self::Error> {
        let mut inner = self.inner.lock().await;
        let slot = inner
            .slots
            .get_mut(&job.id)
            .ok_or_else(|| InMemoryQueueError::not_found(job.id))?;
        slot.state = SlotState::Dead;
        slot.leased = false;
        tracing::error!(job = job.id, %reason, "job moved to the dead set");
        slot.reason = Some(reason);
        Ok(())
    }
}

/// Error type for in-memory queue operations.
#[derive(Debug)]
pub struct InMemoryQueueError {
    kind: InMemoryQueueErrorKind,
}

#[derive(Debug)]
enum InMemoryQueueErrorKind {
    NotFound(i64),
}

impl InMemoryQueueError {
    fn not_found(id: i64) -> Self {
        Self {
            kind: InMemoryQueueErrorKind::NotFound(id),
        }
    }
}

impl std::fmt::Display for InMemoryQueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            InMemoryQueueErrorKind::NotFound(id) => {
                write!(f, "job {id} not found in the in-memory queue")
            }
        }
    }
}

impl std::error::Error for InMemoryQueueError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{ApiKey, recipient_rows};
    use crate::mailing::Subscriber;
    use crate::retry::Backoff;

    fn job(mailing_id: &str) -> DispatchJob {
        let subscribers = [Subscriber {
            email: Some("a@example.org".into()),
            id: Some("a1".into()),
        }];
        DispatchJob {
            mailing_id: mailing_id.to_owned(),
            name: "Bulk_email-topic".to_owned(),
            template_id: "T1".to_owned(),
            api_key: ApiKey::new("K1"),
            rows: recipient_rows(&subscribers, "s", "b", "https://example.org"),
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::new(
            5,
            Backoff::Fixed {
                base: Duration::from_secs(60),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn enqueued_jobs_are_leased_in_fifo_order() {
        let queue = InMemoryQueue::default();
        queue.enqueue(job("m1"), policy()).await.unwrap();
        queue.enqueue(job("m2"), policy()).await.unwrap();

        let leased = InMemoryQueue::lease_due(&queue.inner).await;
        assert_eq!(leased.len(), 2);
        assert_eq!(leased[0].job.mailing_id, "m1");
        assert_eq!(leased[1].job.mailing_id, "m2");
        assert_eq!(leased[0].attempt, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn a_leased_job_is_invisible_to_other_consumers() {
        let queue = InMemoryQueue::default();
        queue.enqueue(job("m1"), policy()).await.unwrap();

        let first = InMemoryQueue::lease_due(&queue.inner).await;
        assert_eq!(first.len(), 1);
        assert!(InMemoryQueue::lease_due(&queue.inner).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reschedule_increments_attempt_and_delays_visibility() {
        let queue = InMemoryQueue::default();
        queue.enqueue(job("m1"), policy()).await.unwrap();

        let leased = InMemoryQueue::lease_due(&queue.inner).await.remove(0);
        queue
            .reschedule(leased, Duration::from_secs(300))
            .await
            .unwrap();

        assert!(InMemoryQueue::lease_due(&queue.inner).await.is_empty());

        tokio::time::advance(Duration::from_secs(300)).await;
        let again = InMemoryQueue::lease_due(&queue.inner).await;
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].attempt, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn complete_removes_the_job() {
        let queue = InMemoryQueue::default();
        queue.enqueue(job("m1"), policy()).await.unwrap();

        let leased = InMemoryQueue::lease_due(&queue.inner).await.remove(0);
        queue.complete(leased).await.unwrap();

        assert!(queue.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn fail_moves_the_job_to_the_dead_set() {
        let queue = InMemoryQueue::default();
        let id = queue.enqueue(job("m1"), policy()).await.unwrap();

        let leased = InMemoryQueue::lease_due(&queue.inner).await.remove(0);
        queue.fail(leased, "HTTP 400".to_owned()).await.unwrap();

        assert_eq!(queue.pending().await, 0);
        assert_eq!(queue.dead().await, vec![(id, "HTTP 400".to_owned())]);
        // Dead jobs are never leased again.
        assert!(InMemoryQueue::lease_due(&queue.inner).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn lease_stream_yields_due_jobs() {
        use tokio_stream::StreamExt;

        let queue = InMemoryQueue::default();
        queue.enqueue(job("m1"), policy()).await.unwrap();

        let cancel = CancellationToken::new();
        let mut stream = queue.jobs(cancel.clone()).await.unwrap();

        let leased = stream.next().await.unwrap().unwrap();
        assert_eq!(leased.job.mailing_id, "m1");

        cancel.cancel();
        assert!(stream.next().await.is_none());
    }
}
