//! Worker loop delivering queued jobs to the notification provider.
//!
//! This module implements the *dispatch worker*:
//!
//! - Streams leased jobs from the queue
//! - Submits each one through a [`Notify`] stack
//! - Classifies every outcome and settles the job accordingly
//! - Exposes lifecycle hooks for observability and customization
//!
//! A worker handles one job at a time; run several workers against the
//! same durable queue for parallelism. The loop runs until:
//! - The job stream ends
//! - A queue error occurs
//! - A [`CancellationToken`] is triggered
//!
//! Dispatch failures never abort the loop: they are classified into a
//! retryable or fatal outcome and the job is rescheduled or moved to the
//! dead set.

use std::sync::Arc;
use std::time::Duration;

use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;
use tower::Service;

use crate::job::DispatchJob;
use crate::mailing::{MailingState, MailingStore};
use crate::notify::{DispatchError, Notify, Outcome, Receipt};
use crate::queue::{LeaseJobs, LeasedJob, SettleJobs};
use crate::retry::Verdict;

/// Dispatch worker.
///
/// Generic parameters:
/// - `D`: queue backend (leasing and settling)
/// - `HK`: hook implementation for lifecycle events
/// - `S`: dispatch service type
pub struct DispatchWorker<D, HK, S> {
    queue: D,
    notify: Notify<S>,
    mailings: Arc<dyn MailingStore>,
    hook: HK,
}

impl<D, S> DispatchWorker<D, DefaultWorkerHook, S> {
    /// Create a new worker with the default hook implementation.
    pub fn new(queue: D, notify: Notify<S>, mailings: Arc<dyn MailingStore>) -> Self {
        Self {
            queue,
            notify,
            mailings,
            hook: DefaultWorkerHook,
        }
    }
}

impl<D, HK, S> DispatchWorker<D, HK, S>
where
    D: LeaseJobs + SettleJobs + Send + Sync,
    D: SettleJobs<ID = <D as LeaseJobs>::ID>,
    <D as LeaseJobs>::Error: Into<tower::BoxError>,
    <D as SettleJobs>::Error: Into<tower::BoxError>,
    <D as LeaseJobs>::ID: std::fmt::Display + Send,
    HK: WorkerHook<<D as LeaseJobs>::ID>,
    S: Service<DispatchJob, Response = Receipt> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<tower::BoxError>,
{
    /// Replace the worker hook while keeping all other generics unchanged.
    pub fn with_hook<HK2: WorkerHook<<D as LeaseJobs>::ID>>(
        self,
        hook: HK2,
    ) -> DispatchWorker<D, HK2, S> {
        DispatchWorker {
            queue: self.queue,
            notify: self.notify,
            mailings: self.mailings,
            hook,
        }
    }

    /// Run the worker loop.
    ///
    /// The worker:
    /// - Subscribes to the queue's leased-job stream
    /// - Dispatches each job and classifies the outcome
    /// - On success, records the mailing as sent and completes the job
    /// - On retryable failure, reschedules with the policy's delay, or
    ///   moves the job to the dead set once the attempt budget is spent
    /// - On fatal failure, moves the job to the dead set immediately
    ///
    /// The loop terminates gracefully via the provided
    /// [`CancellationToken`].
    #[tracing::instrument(skip_all)]
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), WorkerRunError> {
        self.hook.on_startup();

        let mut jobs = self
            .queue
            .jobs(cancel.clone())
            .await
            .map_err(|e| WorkerRunError::queue(e.into()))?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.hook.on_shutdown();
                    break;
                }
                lease = jobs.next() => {
                    match lease {
                        Some(Ok(lease)) => {
                            self.hook.on_job_leased(&lease);

                            match self.notify.send(lease.job.clone()).await {
                                Ok(receipt) => {
                                    self.hook.on_job_delivered(&lease, &receipt);

                                    // Best-effort telemetry: a failure here means the
                                    // recorded state may lag reality, but the job is done.
                                    if let Err(err) = self
                                        .mailings
                                        .mailing_update(
                                            &lease.job.mailing_id,
                                            MailingState::Sent,
                                            MailingState::Sending,
                                        )
                                        .await
                                    {
                                        self.hook.on_mailing_update_error(&lease, err.as_ref());
                                    }

                                    if let Err(err) = self.queue.complete(lease).await {
                                        self.hook.on_settle_error(err.into().as_ref());
                                    }
                                }
                                Err(err) => {
                                    let attempts_made = lease.attempt + 1;
                                    match err.outcome() {
                                        Outcome::Retryable => {
                                            match lease.policy.after_retryable(attempts_made) {
                                                Verdict::Retry(delay) => {
                                                    self.hook.on_job_rescheduled(&lease, delay, &err);
                                                    if let Err(err) =
                                                        self.queue.reschedule(lease, delay).await
                                                    {
                                                        self.hook.on_settle_error(err.into().as_ref());
                                                    }
                                                }
                                                Verdict::Dead => {
                                                    let reason = format!(
                                                        "attempts exhausted after {attempts_made}: {err}"
                                                    );
                                                    self.hook.on_job_dead(&lease, &reason);
                                                    if let Err(err) =
                                                        self.queue.fail(lease, reason).await
                                                    {
                                                        self.hook.on_settle_error(err.into().as_ref());
                                                    }
                                                }
                                            }
                                        }
                                        Outcome::Fatal => {
                                            let reason = err.to_string();
                                            self.hook.on_job_dead(&lease, &reason);
                                            if let Err(err) = self.queue.fail(lease, reason).await {
                                                self.hook.on_settle_error(err.into().as_ref());
                                            }
                                        }
                                    }
                                }
                            }
                        }
                        Some(Err(err)) => {
                            let err = err.into();
                            self.hook.on_lease_error(err.as_ref());
                            return Err(WorkerRunError::queue(err));
                        }
                        None => {
                            self.hook.on_queue_drained();
                            return Ok(());
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

/// Error returned when the worker loop fails.
///
/// Only queue failures abort the loop; dispatch failures are classified
/// and settled in place.
#[derive(Debug)]
pub struct WorkerRunError {
    context: tracing_error::SpanTrace,
    source: tower::BoxError,
}

impl WorkerRunError {
    fn queue(source: tower::BoxError) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            source,
        }
    }
}

impl std::fmt::Display for WorkerRunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Queue error: {}", self.source)?;
        self.context.fmt(f)
    }
}

impl std::error::Error for WorkerRunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

/// Hook trait for observing worker lifecycle events.
///
/// Hooks are invoked synchronously and should avoid heavy or blocking
/// work. Typical use cases are logging, metrics, and dead-set alerting.
pub trait WorkerHook<ID>: Send + Sync {
    fn on_startup(&self);
    fn on_shutdown(&self);
    fn on_job_leased(&self, job: &LeasedJob<ID>);
    fn on_lease_error(&self, error: &dyn std::error::Error);
    fn on_job_delivered(&self, job: &LeasedJob<ID>, receipt: &Receipt);
    fn on_job_rescheduled(&self, job: &LeasedJob<ID>, delay: Duration, error: &DispatchError);
    fn on_job_dead(&self, job: &LeasedJob<ID>, reason: &str);
    fn on_mailing_update_error(&self, job: &LeasedJob<ID>, error: &dyn std::error::Error);
    fn on_settle_error(&self, error: &dyn std::error::Error);
    fn on_queue_drained(&self);
}

/// Default worker hook implementation.
///
/// Logs lifecycle events using `tracing`. Jobs are identified by their
/// queue-assigned correlation id and mailing id; the payload (and with it
/// the credential) is never logged.
pub struct DefaultWorkerHook;

impl<ID: std::fmt::Display> WorkerHook<ID> for DefaultWorkerHook {
    fn on_startup(&self) {
        tracing::info!("Dispatch worker is starting up");
    }

    fn on_shutdown(&self) {
        tracing::info!("Dispatch worker is shutting down");
    }

    fn on_job_leased(&self, job: &LeasedJob<ID>) {
        tracing::debug!(job = %job.id, mailing = %job.job.mailing_id, "Job leased");
    }

    fn on_lease_error(&self, error: &dyn std::error::Error) {
        tracing::error!(?error, "Error leasing jobs");
    }

    fn on_job_delivered(&self, job: &LeasedJob<ID>, receipt: &Receipt) {
        tracing::info!(
            job = %job.id,
            mailing = %job.job.mailing_id,
            status = receipt.status,
            body = %receipt.body,
            "Bulk mailing delivered",
        );
    }

    fn on_job_rescheduled(&self, job: &LeasedJob<ID>, delay: Duration, error: &DispatchError) {
        tracing::warn!(
            job = %job.id,
            mailing = %job.job.mailing_id,
            attempt = job.attempt + 1,
            delay_ms = delay.as_millis() as u64,
            %error,
            "Dispatch failed, retry scheduled",
        );
    }

    fn on_job_dead(&self, job: &LeasedJob<ID>, reason: &str) {
        tracing::error!(
            job = %job.id,
            mailing = %job.job.mailing_id,
            reason,
            "Job failed permanently",
        );
    }

    fn on_mailing_update_error(&self, job: &LeasedJob<ID>, error: &dyn std::error::Error) {
        // Logged apart from dispatch failures: delivery succeeded but the
        // mailing's recorded state may now be inconsistent with reality.
        tracing::error!(
            job = %job.id,
            mailing = %job.job.mailing_id,
            ?error,
            "Failed to record mailing state transition",
        );
    }

    fn on_settle_error(&self, error: &dyn std::error::Error) {
        tracing::error!(?error, "Failed to settle job in queue");
    }

    fn on_queue_drained(&self) {
        tracing::info!("Job stream ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{ApiKey, recipient_rows};
    use crate::mailing::Subscriber;
    use crate::notify::InMemoryNotifier;
    use crate::queue::inmemory::InMemoryQueue;
    use crate::retry::{Backoff, RetryPolicy};
    use crate::queue::EnqueueJobs;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingMailings {
        updates: Mutex<Vec<(String, MailingState, MailingState)>>,
        fail_updates: bool,
    }

    #[async_trait::async_trait]
    impl MailingStore for RecordingMailings {
        async fn topic(&self, _topic_id: &str) -> Result<Option<crate::Topic>, tower::BoxError> {
            Ok(None)
        }

        async fn mailing_update(
            &self,
            mailing_id: &str,
            new_state: MailingState,
            expected_prior: MailingState,
        ) -> Result<(), tower::BoxError> {
            self.updates
                .lock()
                .await
                .push((mailing_id.to_owned(), new_state, expected_prior));
            if self.fail_updates {
                return Err("state store unavailable".into());
            }
            Ok(())
        }
    }

    fn job() -> DispatchJob {
        let subscribers = [
            Subscriber {
                email: Some("a@example.org".into()),
                id: Some("a1".into()),
            },
            Subscriber {
                email: Some("b@example.org".into()),
                id: Some("b1".into()),
            },
        ];
        DispatchJob {
            mailing_id: "mailing-1".to_owned(),
            name: "Bulk_email-topic".to_owned(),
            template_id: "T1".to_owned(),
            api_key: ApiKey::new("K1"),
            rows: recipient_rows(&subscribers, "subj", "body", "https://example.org"),
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_attempts,
            Backoff::Exponential {
                base: Duration::from_secs(300),
            },
        )
    }

    async fn wait_until(condition: impl AsyncFn() -> bool) {
        tokio::time::timeout(Duration::from_secs(86_400), async {
            while !condition().await {
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test(start_paused = true)]
    async fn successful_dispatch_records_the_mailing_as_sent_once() {
        let queue = InMemoryQueue::default();
        queue.enqueue(job(), policy(5)).await.unwrap();

        let notifier = InMemoryNotifier::default();
        let mailings = Arc::new(RecordingMailings::default());
        let worker = DispatchWorker::new(
            queue.clone(),
            Notify::new(notifier.clone()),
            mailings.clone(),
        );

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(worker.run(cancel.clone()));

        let q = queue.clone();
        wait_until(async || q.is_empty().await).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(notifier.dispatched().await.len(), 1);
        assert_eq!(
            *mailings.updates.lock().await,
            vec![(
                "mailing-1".to_owned(),
                MailingState::Sent,
                MailingState::Sending
            )]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_failures_back_off_then_deliver() {
        let queue = InMemoryQueue::default();
        queue.enqueue(job(), policy(5)).await.unwrap();

        let notifier = InMemoryNotifier::default();
        notifier.push_retryable(503).await;
        notifier.push_retryable(503).await;
        // Third attempt succeeds via the empty-script default.

        let mailings = Arc::new(RecordingMailings::default());
        let worker = DispatchWorker::new(
            queue.clone(),
            Notify::new(notifier.clone()),
            mailings.clone(),
        );

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(worker.run(cancel.clone()));

        let q = queue.clone();
        wait_until(async || q.is_empty().await).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(notifier.dispatched().await.len(), 3);
        assert_eq!(mailings.updates.lock().await.len(), 1);
        assert!(queue.dead().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_failure_kills_the_job_on_first_occurrence() {
        let queue = InMemoryQueue::default();
        queue.enqueue(job(), policy(5)).await.unwrap();

        let notifier = InMemoryNotifier::default();
        notifier.push_fatal(400).await;

        let mailings = Arc::new(RecordingMailings::default());
        let worker = DispatchWorker::new(
            queue.clone(),
            Notify::new(notifier.clone()),
            mailings.clone(),
        );

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(worker.run(cancel.clone()));

        let q = queue.clone();
        wait_until(async || !q.dead().await.is_empty()).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        let dead = queue.dead().await;
        assert_eq!(dead.len(), 1);
        assert!(dead[0].1.contains("400"));
        assert_eq!(notifier.dispatched().await.len(), 1);
        assert!(mailings.updates.lock().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_exhaustion_moves_the_job_to_the_dead_set() {
        let queue = InMemoryQueue::default();
        queue.enqueue(job(), policy(2)).await.unwrap();

        let notifier = InMemoryNotifier::default();
        notifier.push_retryable(503).await;
        notifier.push_retryable(502).await;

        let mailings = Arc::new(RecordingMailings::default());
        let worker = DispatchWorker::new(
            queue.clone(),
            Notify::new(notifier.clone()),
            mailings.clone(),
        );

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(worker.run(cancel.clone()));

        let q = queue.clone();
        wait_until(async || !q.dead().await.is_empty()).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        let dead = queue.dead().await;
        assert_eq!(dead.len(), 1);
        assert!(dead[0].1.contains("attempts exhausted after 2"));
        assert_eq!(notifier.dispatched().await.len(), 2);
        assert!(mailings.updates.lock().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn mailing_update_failure_does_not_block_completion() {
        let queue = InMemoryQueue::default();
        queue.enqueue(job(), policy(5)).await.unwrap();

        let notifier = InMemoryNotifier::default();
        let mailings = Arc::new(RecordingMailings {
            fail_updates: true,
            ..Default::default()
        });
        let worker = DispatchWorker::new(
            queue.clone(),
            Notify::new(notifier.clone()),
            mailings.clone(),
        );

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(worker.run(cancel.clone()));

        let q = queue.clone();
        wait_until(async || q.is_empty().await).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        // The transition was attempted exactly once and its failure was
        // swallowed; the job still completed.
        assert_eq!(mailings.updates.lock().await.len(), 1);
    }
}
