//! Job queue abstractions and backend drivers.
//!
//! The queue is the durable holding area between "send this mailing" and
//! the provider call. It owns three logical job states:
//!
//! - *ready*: dispatchable now
//! - *delayed*: scheduled for a future time by the backoff policy
//! - *dead*: attempts exhausted or fatally rejected; operator territory
//!
//! Responsibilities are split across capability traits so backends can be
//! swapped per deployment (the "demo vs production" queue is a
//! configuration choice, not a second code path):
//!
//! - [`EnqueueJobs`]: admit a job with its retry policy
//! - [`LeaseJobs`]: stream due jobs, each visible to exactly one worker
//! - [`SettleJobs`]: complete, reschedule, or fail a leased job
//!
//! Backends: [`inmemory`] for tests and demos, and `sqlx` (feature-gated)
//! for restart-safe Postgres persistence.

pub mod inmemory;
pub mod poller;

#[cfg(feature = "sqlx")]
pub mod sqlx;

use std::time::Duration;

use futures_core::stream::BoxStream;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use tracing_error::SpanTrace;

use crate::job::DispatchJob;
use crate::retry::RetryPolicy;

/// Error returned by queue operations.
///
/// Wraps the backend error and captures a tracing span backtrace for
/// diagnostics.
#[derive(Debug)]
pub struct QueueError {
    context: SpanTrace,
    source: tower::BoxError,
}

impl QueueError {
    fn backend(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self {
            context: SpanTrace::capture(),
            source: err,
        }
    }
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Queue backend error: {}", self.source)?;
        self.context.fmt(f)
    }
}

impl std::error::Error for QueueError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

/// A job handed out by the queue, visible to exactly one worker until it
/// is settled.
///
/// `id` is the queue-assigned correlation id, used only for logging and
/// the dead-set failure event. `attempt` counts delivery attempts made so
/// far; the backend increments it on every reschedule.
#[derive(Debug, Clone, PartialEq)]
pub struct LeasedJob<ID> {
    /// Queue-assigned correlation id.
    pub id: ID,
    /// Attempts made so far; 0 for a job that has never been tried.
    pub attempt: u32,
    /// Policy attached at enqueue time, immutable for the job's lifetime.
    pub policy: RetryPolicy,
    /// The durable payload.
    pub job: DispatchJob,
}

/// High-level façade over a queue backend, used by the enqueue side.
pub struct JobQueue<D>(D);

impl<D> JobQueue<D>
where
    D: Clone,
{
    /// Create a new queue façade over the given backend.
    pub fn new(backend: D) -> Self {
        Self(backend)
    }

    /// Admit a job in *ready* state with its per-job retry policy.
    ///
    /// Never blocks on delivery: the job is picked up asynchronously by
    /// whatever worker leases it next. Returns the correlation id.
    #[instrument(skip(self, job, policy), fields(mailing = %job.mailing_id))]
    pub async fn enqueue(&self, job: DispatchJob, policy: RetryPolicy) -> Result<D::ID, QueueError>
    where
        D: EnqueueJobs,
        D::Error: Into<tower::BoxError>,
    {
        self.0
            .enqueue(job, policy)
            .await
            .map_err(|e| QueueError::backend(e.into()))
    }
}

/// Trait for admitting jobs into the queue.
#[async_trait::async_trait]
pub trait EnqueueJobs {
    /// Backend-specific error type.
    type Error;
    /// Correlation id type assigned to stored jobs.
    type ID;

    /// Durably store a job in *ready* state and return its id.
    async fn enqueue(&self, job: DispatchJob, policy: RetryPolicy) -> Result<Self::ID, Self::Error>;
}

/// Trait for leasing due jobs to workers.
///
/// The returned stream must:
/// - Yield each due *ready*/*delayed* job to exactly one consumer
/// - Keep a yielded job invisible until it is settled or its lease lapses
/// - Respect cancellation via the provided [`CancellationToken`]
#[async_trait::async_trait]
pub trait LeaseJobs {
    /// Backend-specific error type.
    type Error;
    /// Correlation id type for stored jobs.
    type ID;

    /// Stream leased jobs until cancellation.
    async fn jobs(
        &self,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'_, Result<LeasedJob<Self::ID>, Self::Error>>, Self::Error>;
}

/// Trait for settling a leased job.
#[async_trait::async_trait]
pub trait SettleJobs {
    /// Backend-specific error type.
    type Error;
    /// Correlation id type for stored jobs.
    type ID;

    /// Remove the job permanently; terminal success.
    async fn complete(&self, job: LeasedJob<Self::ID>) -> Result<(), Self::Error>;

    /// Move the job back to *delayed*, due at `now + delay`, incrementing
    /// its attempt count.
    async fn reschedule(&self, job: LeasedJob<Self::ID>, delay: Duration)
    -> Result<(), Self::Error>;

    /// Move the job to the dead set and emit a failure event carrying its
    /// correlation id and reason.
    async fn fail(&self, job: LeasedJob<Self::ID>, reason: String) -> Result<(), Self::Error>;
}
