#![doc = include_str!("../README.md")]

pub mod config;
pub mod job;
pub mod mailing;
pub mod notify;
pub mod queue;
pub mod retry;
mod send;
pub mod worker;

#[doc(inline)]
pub use config::{DispatchConfig, QueueConn};

#[doc(inline)]
pub use job::{ApiKey, DispatchJob, recipient_rows};

#[doc(inline)]
pub use mailing::{MailingState, MailingStore, Subscriber, SubscriberStore, Topic};

#[doc(inline)]
pub use notify::{DispatchError, Notifier, Notify, Outcome, Receipt};

#[doc(inline)]
pub use queue::{EnqueueJobs, JobQueue, LeaseJobs, LeasedJob, QueueError, SettleJobs};

#[doc(inline)]
pub use retry::{Backoff, RetryPolicy, Verdict};

#[doc(inline)]
pub use send::{Dispatcher, SetupError, SetupErrorKind};

#[doc(inline)]
pub use worker::{DefaultWorkerHook, DispatchWorker, WorkerHook, WorkerRunError};
