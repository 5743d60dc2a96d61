//! Scripted in-memory notifier for tests, demos, and local pipelines.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::job::DispatchJob;
use crate::notify::{DispatchError, Notifier, Receipt};

/// One scripted answer of the fake provider.
#[derive(Debug)]
enum Step {
    Success(Receipt),
    Retryable(u16),
    Fatal(u16),
}

/// Notifier that answers from a script instead of calling a provider.
///
/// Steps are consumed in order; once the script is exhausted every
/// dispatch succeeds with an empty acknowledgement. Clones share the
/// script and the record of dispatched jobs.
#[derive(Clone, Default)]
pub struct InMemoryNotifier {
    script: Arc<Mutex<VecDeque<Step>>>,
    dispatched: Arc<Mutex<Vec<DispatchJob>>>,
}

impl InMemoryNotifier {
    /// Script a successful dispatch.
    pub async fn push_success(&self, receipt: Receipt) {
        self.script.lock().await.push_back(Step::Success(receipt));
    }

    /// Script a server-side failure with the given status.
    pub async fn push_retryable(&self, status: u16) {
        self.script.lock().await.push_back(Step::Retryable(status));
    }

    /// Script a client-side rejection with the given status.
    pub async fn push_fatal(&self, status: u16) {
        self.script.lock().await.push_back(Step::Fatal(status));
    }

    /// Every job dispatched so far, in order.
    pub async fn dispatched(&self) -> Vec<DispatchJob> {
        self.dispatched.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl Notifier for InMemoryNotifier {
    type Error = DispatchError;

    #[tracing::instrument(skip_all, fields(mailing = %job.mailing_id))]
    async fn dispatch(&mut self, job: DispatchJob) -> Result<Receipt, DispatchError> {
        self.dispatched.lock().await.push(job);

        match self.script.lock().await.pop_front() {
            None => Ok(Receipt::accepted()),
            Some(Step::Success(receipt)) => Ok(receipt),
            Some(Step::Retryable(status)) => {
                Err(DispatchError::retryable(ScriptedFailure { status }))
            }
            Some(Step::Fatal(status)) => Err(DispatchError::fatal(ScriptedFailure { status })),
        }
    }
}

/// Failure injected by the script.
#[derive(Debug)]
pub struct ScriptedFailure {
    status: u16,
}

impl std::fmt::Display for ScriptedFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bulk api answered HTTP {}", self.status)
    }
}

impl std::error::Error for ScriptedFailure {}
