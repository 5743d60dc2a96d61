//! Durable Postgres queue backend.
//!
//! Jobs live in a single `dispatch_queue` table. The payload and retry
//! policy are stored as JSONB next to the scheduling columns, so a job is
//! self-contained across restarts. Leasing is a `FOR UPDATE SKIP LOCKED`
//! claim that stamps `leased_until`; a worker that dies mid-call simply
//! lets the lease lapse and the job becomes consumable again.

use std::time::Duration;

use async_trait::async_trait;
use futures_core::stream::BoxStream;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgPool, Row};
use tokio_util::sync::CancellationToken;

use crate::config::QueueConn;
use crate::job::DispatchJob;
use crate::queue::{EnqueueJobs, LeaseJobs, LeasedJob, SettleJobs, poller::PollerBuilder};
use crate::retry::RetryPolicy;

/// SQLx-based durable queue driver.
#[derive(Clone)]
pub struct SqlxQueue {
    pool: PgPool,
    poll_interval: Duration,
    fetch_size: usize,
    lease_for: Duration,
}

impl SqlxQueue {
    /// Create a queue over an existing pool and ensure the table exists.
    #[tracing::instrument(skip_all)]
    pub async fn try_new(pool: PgPool, poll_interval: Duration) -> Result<Self, Error> {
        create_table(&pool).await?;
        Ok(Self {
            pool,
            poll_interval,
            fetch_size: 100,
            lease_for: Duration::from_secs(300),
        })
    }

    /// Connect according to the configured topology and create the queue.
    ///
    /// For a [`QueueConn::HighAvailability`] topology, candidate hosts are
    /// probed in order and the first writable primary is used; standbys
    /// answer `pg_is_in_recovery() = true` and are skipped.
    #[tracing::instrument(skip_all)]
    pub async fn connect(conn: &QueueConn, poll_interval: Duration) -> Result<Self, Error> {
        let pool = match conn {
            QueueConn::Single { host, port } => {
                let options = PgConnectOptions::new().host(host).port(*port);
                PgPoolOptions::new().connect_with(options).await?
            }
            QueueConn::HighAvailability { hosts, cluster } => {
                let mut primary = None;
                for (host, port) in hosts {
                    let options = PgConnectOptions::new().host(host).port(*port);
                    let candidate = match PgPoolOptions::new().connect_with(options).await {
                        Ok(pool) => pool,
                        Err(err) => {
                            tracing::warn!(host = %host, port = %port, error = %err, "queue host unreachable");
                            continue;
                        }
                    };
                    let in_recovery: bool = sqlx::query_scalar("SELECT pg_is_in_recovery()")
                        .fetch_one(&candidate)
                        .await?;
                    if in_recovery {
                        candidate.close().await;
                        continue;
                    }
                    tracing::info!(host = %host, port = %port, cluster = %cluster, "connected to queue primary");
                    primary = Some(candidate);
                    break;
                }
                primary.ok_or_else(|| Error::no_primary(cluster.clone()))?
            }
        };

        Self::try_new(pool, poll_interval).await
    }

    /// Batch size for each lease query.
    pub fn with_fetch_size(mut self, size: usize) -> Self {
        self.fetch_size = size;
        self
    }

    /// How long a leased job stays invisible before it is considered
    /// abandoned.
    pub fn with_lease_duration(mut self, lease_for: Duration) -> Self {
        self.lease_for = lease_for;
        self
    }

    /// Claim up to `fetch_size` due jobs, stamping their lease.
    #[tracing::instrument(skip_all)]
    async fn claim_due(&self) -> Result<Vec<LeasedJob<i64>>, Error> {
        let rows = sqlx::query(
            "UPDATE dispatch_queue
             SET leased_until = now() + ($2 * interval '1 millisecond')
             WHERE job_id IN (
                 SELECT job_id FROM dispatch_queue
                 WHERE state IN ('ready', 'delayed')
                   AND due_at <= now()
                   AND (leased_until IS NULL OR leased_until <= now())
                 ORDER BY job_id
                 LIMIT $1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING job_id, attempt, payload, policy",
        )
        .bind(self.fetch_size as i64)
        .bind(self.lease_for.as_millis() as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut leased = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.try_get("job_id")?;
            let attempt: i32 = row.try_get("attempt")?;
            let payload: serde_json::Value = row.try_get("payload")?;
            let policy: serde_json::Value = row.try_get("policy")?;

            leased.push(LeasedJob {
                id,
                attempt: attempt as u32,
                policy: serde_json::from_value(policy)?,
                job: serde_json::from_value(payload)?,
            });
        }

        Ok(leased)
    }
}

#[async_trait]
impl EnqueueJobs for SqlxQueue {
    type Error = Error;
    type ID = i64;

    #[tracing::instrument(skip_all, fields(mailing = %job.mailing_id))]
    async fn enqueue(&self, job: DispatchJob, policy: RetryPolicy) -> Result<i64, Error> {
        let payload = serde_json::to_value(&job)?;
        let policy = serde_json::to_value(policy)?;

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO dispatch_queue (payload, policy, state, due_at)
             VALUES ($1, $2, 'ready', now())
             RETURNING job_id",
        )
        .bind(payload)
        .bind(policy)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }
}

#[async_trait]
impl LeaseJobs for SqlxQueue {
    type Error = tower::BoxError;
    type ID = i64;

    #[tracing::instrument(skip_all)]
    async fn jobs(
        &self,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'_, Result<LeasedJob<i64>, Self::Error>>, Self::Error> {
        let this = self.clone();
        let stream = PollerBuilder::new(self.poll_interval)
            .channel_size(self.fetch_size)
            .start(cancel, move || {
                let this = this.clone();
                async move { this.claim_due().await.map_err(Into::into) }
            });
        Ok(stream)
    }
}

#[async_trait]
impl SettleJobs for SqlxQueue {
    type Error = Error;
    type ID = i64;

    async fn complete(&self, job: LeasedJob<i64>) -> Result<(), Error> {
        sqlx::query("DELETE FROM dispatch_queue WHERE job_id = $1")
            .bind(job.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn reschedule(&self, job: LeasedJob<i64>, delay: Duration) -> Result<(), Error> {
        sqlx::query(
            "UPDATE dispatch_queue
             SET attempt = attempt + 1,
                 state = 'delayed',
                 due_at = now() + ($2 * interval '1 millisecond'),
                 leased_until = NULL
             WHERE job_id = $1",
        )
        .bind(job.id)
        .bind(delay.as_millis() as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail(&self, job: LeasedJob<i64>, reason: String) -> Result<(), Error> {
        sqlx::query(
            "UPDATE dispatch_queue
             SET state = 'dead', failed_reason = $2, leased_until = NULL
             WHERE job_id = $1",
        )
        .bind(job.id)
        .bind(&reason)
        .execute(&self.pool)
        .await?;
        tracing::error!(job = job.id, %reason, "job moved to the dead set");
        Ok(())
    }
}

async fn create_table(pool: &PgPool) -> Result<(), Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS dispatch_queue (
            job_id BIGSERIAL PRIMARY KEY,
            payload JSONB NOT NULL,
            policy JSONB NOT NULL,
            attempt INT NOT NULL DEFAULT 0,
            state TEXT NOT NULL DEFAULT 'ready',
            due_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            leased_until TIMESTAMPTZ,
            failed_reason TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )",
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Sqlx queue errors.
#[derive(Debug)]
pub struct Error {
    context: tracing_error::SpanTrace,
    kind: SqlxQueueErrorKind,
}

/// Kinds of sqlx queue errors.
#[derive(Debug)]
pub enum SqlxQueueErrorKind {
    Database(sqlx::Error),
    Serde(serde_json::Error),
    /// No writable primary among the configured hosts of the named
    /// cluster.
    NoPrimary(String),
}

impl Error {
    fn no_primary(cluster: String) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: SqlxQueueErrorKind::NoPrimary(cluster),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            SqlxQueueErrorKind::Database(err) => writeln!(f, "Database error: {}", err),
            SqlxQueueErrorKind::Serde(err) => writeln!(f, "Serde error: {}", err),
            SqlxQueueErrorKind::NoPrimary(cluster) => {
                writeln!(f, "No writable primary found for queue cluster {cluster}")
            }
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            SqlxQueueErrorKind::Database(err) => Some(err),
            SqlxQueueErrorKind::Serde(err) => Some(err),
            SqlxQueueErrorKind::NoPrimary(_) => None,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: SqlxQueueErrorKind::Database(err),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: SqlxQueueErrorKind::Serde(err),
        }
    }
}
