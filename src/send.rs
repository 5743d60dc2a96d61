//! Turning a send request into an enqueued dispatch job.
//!
//! [`Dispatcher::send_bulk_emails`] is the trigger interface consumed by
//! the application's HTTP/CRUD layer. It resolves the topic and its
//! subscribers, shapes the recipient rows, and enqueues exactly one job —
//! or raises a single wrapped [`SetupError`] before any job exists. It
//! performs no retries itself: retry applies only to the enqueued job's
//! provider call.

use std::sync::Arc;

use tracing::instrument;
use tracing_error::SpanTrace;

use crate::config::DispatchConfig;
use crate::job::{DispatchJob, recipient_rows};
use crate::mailing::{MailingStore, SubscriberStore};
use crate::queue::{EnqueueJobs, JobQueue, QueueError};
use crate::retry::RetryPolicy;

/// Front door of the dispatch subsystem.
///
/// Holds the enqueue side of the queue plus the two collaborator stores.
/// All configuration is captured at construction time; nothing is read
/// from the environment afterwards.
pub struct Dispatcher<D> {
    queue: JobQueue<D>,
    mailings: Arc<dyn MailingStore>,
    subscribers: Arc<dyn SubscriberStore>,
    base_url: String,
    policy: RetryPolicy,
}

impl<D> Dispatcher<D>
where
    D: EnqueueJobs + Clone,
    D::Error: Into<tower::BoxError>,
    D::ID: std::fmt::Display,
{
    /// Create a dispatcher from the process configuration.
    pub fn new(
        queue: JobQueue<D>,
        mailings: Arc<dyn MailingStore>,
        subscribers: Arc<dyn SubscriberStore>,
        config: &DispatchConfig,
    ) -> Self {
        Self {
            queue,
            mailings,
            subscribers,
            base_url: config.base_url.clone(),
            policy: config.retry,
        }
    }

    /// Queue a bulk mailing for the topic's confirmed subscribers.
    ///
    /// Returns the queue-assigned correlation id. Setup failures are
    /// raised before anything is enqueued; once this returns `Ok`, the
    /// caller is done and delivery proceeds asynchronously.
    #[instrument(skip(self, subject, mailing_body))]
    pub async fn send_bulk_emails(
        &self,
        mailing_id: &str,
        topic_id: &str,
        subject: &str,
        mailing_body: &str,
    ) -> Result<D::ID, SetupError> {
        let topic = self
            .mailings
            .topic(topic_id)
            .await
            .map_err(SetupError::store)?
            .ok_or_else(|| SetupError::topic_not_found(topic_id))?;

        let (Some(template_id), Some(api_key)) = (topic.template_id, topic.api_key) else {
            return Err(SetupError::topic_misconfigured(topic_id));
        };

        let subscribers = self
            .subscribers
            .confirmed_subscribers(topic_id)
            .await
            .map_err(SetupError::store)?;
        if subscribers.is_empty() {
            return Err(SetupError::no_subscribers(topic_id));
        }

        let rows = recipient_rows(&subscribers, subject, mailing_body, &self.base_url);
        // Only the header row left: every subscriber was malformed. A job
        // with zero valid recipients is never created.
        if rows.len() <= 1 {
            return Err(SetupError::no_subscribers(topic_id));
        }

        let job = DispatchJob {
            mailing_id: mailing_id.to_owned(),
            name: format!("Bulk_email-{topic_id}"),
            template_id,
            api_key,
            rows,
        };

        let id = self
            .queue
            .enqueue(job, self.policy)
            .await
            .map_err(SetupError::queue)?;

        tracing::info!(job = %id, mailing = mailing_id, topic = topic_id, "bulk mailing queued");
        Ok(id)
    }
}

/// Error raised to the trigger caller before any job exists.
#[derive(Debug)]
pub struct SetupError {
    context: SpanTrace,
    kind: SetupErrorKind,
}

/// Setup error taxonomy.
#[derive(Debug)]
pub enum SetupErrorKind {
    /// The topic does not exist.
    TopicNotFound(String),
    /// The topic is missing its template id or API key.
    TopicMisconfigured(String),
    /// The topic has no confirmed subscribers with a usable address.
    NoSubscribers(String),
    /// A collaborator store failed.
    Store(tower::BoxError),
    /// The queue refused the job.
    Queue(QueueError),
}

impl SetupError {
    fn topic_not_found(topic_id: &str) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: SetupErrorKind::TopicNotFound(topic_id.to_owned()),
        }
    }

    fn topic_misconfigured(topic_id: &str) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: SetupErrorKind::TopicMisconfigured(topic_id.to_owned()),
        }
    }

    fn no_subscribers(topic_id: &str) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: SetupErrorKind::NoSubscribers(topic_id.to_owned()),
        }
    }

    fn store(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: SetupErrorKind::Store(err),
        }
    }

    fn queue(err: QueueError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: SetupErrorKind::Queue(err),
        }
    }

    /// The classified kind of this setup failure.
    pub fn kind(&self) -> &SetupErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for SetupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            SetupErrorKind::TopicNotFound(topic) => {
                writeln!(f, "Can't find the topic: {topic}")
            }
            SetupErrorKind::TopicMisconfigured(topic) => {
                writeln!(f, "Topic {topic} is missing a template id or API key")
            }
            SetupErrorKind::NoSubscribers(topic) => {
                writeln!(f, "No subscribers for the topic: {topic}")
            }
            SetupErrorKind::Store(err) => writeln!(f, "Store error: {err}"),
            SetupErrorKind::Queue(err) => writeln!(f, "Queue error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for SetupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            SetupErrorKind::Store(err) => Some(err.as_ref()),
            SetupErrorKind::Queue(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::ApiKey;
    use crate::mailing::{MailingState, Subscriber, Topic};
    use crate::queue::inmemory::InMemoryQueue;
    use std::collections::HashMap;

    struct StubStores {
        topics: HashMap<String, Topic>,
        subscribers: Vec<Subscriber>,
    }

    #[async_trait::async_trait]
    impl MailingStore for StubStores {
        async fn topic(&self, topic_id: &str) -> Result<Option<Topic>, tower::BoxError> {
            Ok(self.topics.get(topic_id).cloned())
        }

        async fn mailing_update(
            &self,
            _mailing_id: &str,
            _new_state: MailingState,
            _expected_prior: MailingState,
        ) -> Result<(), tower::BoxError> {
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl SubscriberStore for StubStores {
        async fn confirmed_subscribers(
            &self,
            _topic_id: &str,
        ) -> Result<Vec<Subscriber>, tower::BoxError> {
            Ok(self.subscribers.clone())
        }
    }

    fn sub(email: &str, id: &str) -> Subscriber {
        Subscriber {
            email: Some(email.to_owned()),
            id: Some(id.to_owned()),
        }
    }

    fn dispatcher(
        queue: &InMemoryQueue,
        topics: HashMap<String, Topic>,
        subscribers: Vec<Subscriber>,
    ) -> Dispatcher<InMemoryQueue> {
        let stores = Arc::new(StubStores {
            topics,
            subscribers,
        });
        Dispatcher::new(
            JobQueue::new(queue.clone()),
            stores.clone(),
            stores,
            &DispatchConfig::default(),
        )
    }

    fn configured_topic() -> Topic {
        Topic {
            template_id: Some("T1".to_owned()),
            api_key: Some(ApiKey::new("K1")),
        }
    }

    #[tokio::test]
    async fn a_valid_request_enqueues_one_job() {
        let queue = InMemoryQueue::default();
        let topics = HashMap::from([("topic-a".to_owned(), configured_topic())]);
        let subscribers = vec![
            sub("one@example.org", "id1"),
            Subscriber {
                email: Some(String::new()),
                id: Some("id2".to_owned()),
            },
            sub("three@example.org", "id3"),
        ];
        let dispatcher = dispatcher(&queue, topics, subscribers);

        dispatcher
            .send_bulk_emails("mailing-1", "topic-a", "Hello", "Body")
            .await
            .unwrap();

        let jobs = queue.queued_jobs().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].template_id, "T1");
        assert_eq!(jobs[0].name, "Bulk_email-topic-a");
        assert_eq!(jobs[0].mailing_id, "mailing-1");
        // Header plus the two well-formed subscribers.
        assert_eq!(jobs[0].rows.len(), 3);
    }

    #[tokio::test]
    async fn an_unknown_topic_raises_before_anything_is_enqueued() {
        let queue = InMemoryQueue::default();
        let dispatcher = dispatcher(&queue, HashMap::new(), vec![sub("a@example.org", "a1")]);

        let err = dispatcher
            .send_bulk_emails("mailing-1", "X", "s", "b")
            .await
            .unwrap_err();

        assert!(matches!(err.kind(), SetupErrorKind::TopicNotFound(t) if t == "X"));
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn a_topic_without_credentials_is_misconfigured() {
        let queue = InMemoryQueue::default();
        let topics = HashMap::from([(
            "topic-a".to_owned(),
            Topic {
                template_id: Some("T1".to_owned()),
                api_key: None,
            },
        )]);
        let dispatcher = dispatcher(&queue, topics, vec![sub("a@example.org", "a1")]);

        let err = dispatcher
            .send_bulk_emails("mailing-1", "topic-a", "s", "b")
            .await
            .unwrap_err();

        assert!(matches!(err.kind(), SetupErrorKind::TopicMisconfigured(_)));
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn an_empty_subscriber_list_raises_no_subscribers() {
        let queue = InMemoryQueue::default();
        let topics = HashMap::from([("topic-a".to_owned(), configured_topic())]);
        let dispatcher = dispatcher(&queue, topics, vec![]);

        let err = dispatcher
            .send_bulk_emails("mailing-1", "topic-a", "s", "b")
            .await
            .unwrap_err();

        assert!(matches!(err.kind(), SetupErrorKind::NoSubscribers(_)));
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn all_malformed_subscribers_never_create_a_job() {
        let queue = InMemoryQueue::default();
        let topics = HashMap::from([("topic-a".to_owned(), configured_topic())]);
        let subscribers = vec![
            Subscriber {
                email: None,
                id: Some("id1".to_owned()),
            },
            Subscriber {
                email: Some("a@example.org".to_owned()),
                id: None,
            },
        ];
        let dispatcher = dispatcher(&queue, topics, subscribers);

        let err = dispatcher
            .send_bulk_emails("mailing-1", "topic-a", "s", "b")
            .await
            .unwrap_err();

        assert!(matches!(err.kind(), SetupErrorKind::NoSubscribers(_)));
        assert!(queue.is_empty().await);
    }
}
