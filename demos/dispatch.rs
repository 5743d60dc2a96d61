use std::collections::HashMap;
use std::sync::Arc;

use maildrop::notify::InMemoryNotifier;
use maildrop::queue::inmemory::InMemoryQueue;
use maildrop::{
    ApiKey, Backoff, DispatchConfig, DispatchWorker, Dispatcher, JobQueue, MailingState,
    MailingStore, Notify, RetryPolicy, Subscriber, SubscriberStore, Topic,
};
use tokio_util::sync::CancellationToken;
use tracing_error::ErrorLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

struct DemoStores {
    topics: HashMap<String, Topic>,
    subscribers: Vec<Subscriber>,
}

#[async_trait::async_trait]
impl MailingStore for DemoStores {
    async fn topic(&self, topic_id: &str) -> Result<Option<Topic>, tower::BoxError> {
        Ok(self.topics.get(topic_id).cloned())
    }

    async fn mailing_update(
        &self,
        mailing_id: &str,
        new_state: MailingState,
        expected_prior: MailingState,
    ) -> Result<(), tower::BoxError> {
        tracing::info!(mailing = mailing_id, from = %expected_prior, to = %new_state, "mailing state updated");
        Ok(())
    }
}

#[async_trait::async_trait]
impl SubscriberStore for DemoStores {
    async fn confirmed_subscribers(
        &self,
        _topic_id: &str,
    ) -> Result<Vec<Subscriber>, tower::BoxError> {
        Ok(self.subscribers.clone())
    }
}

fn subscriber(email: &str, id: &str) -> Subscriber {
    Subscriber {
        email: Some(email.to_owned()),
        id: Some(id.to_owned()),
    }
}

#[tokio::main]
async fn main() {
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::from_default_env())
        .with(ErrorLayer::default())
        .init();

    let stores = Arc::new(DemoStores {
        topics: HashMap::from([(
            "weekly-digest".to_owned(),
            Topic {
                template_id: Some("digest-template".to_owned()),
                api_key: Some(ApiKey::new("demo-key")),
            },
        )]),
        subscribers: vec![
            subscriber("alice@example.org", "tok-alice"),
            subscriber("bob@example.org", "tok-bob"),
        ],
    });

    let queue = InMemoryQueue::default();
    // Shorten the production backoff so the retry is visible right away.
    let config = DispatchConfig::default().with_retry(RetryPolicy::new(
        5,
        Backoff::Fixed {
            base: std::time::Duration::from_secs(2),
        },
    ));

    let dispatcher = Dispatcher::new(
        JobQueue::new(queue.clone()),
        stores.clone(),
        stores.clone(),
        &config,
    );

    let job_id = dispatcher
        .send_bulk_emails(
            "mailing-42",
            "weekly-digest",
            "This week's digest",
            "Hello from the digest!",
        )
        .await
        .unwrap();
    tracing::info!(job = job_id, "mailing queued");

    let cancel = CancellationToken::new();
    let cancel_signal = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        cancel_signal.cancel();
    });

    // The scripted notifier fails the first attempt so the retry path is
    // visible in the logs before delivery succeeds.
    let notifier = InMemoryNotifier::default();
    notifier.push_retryable(503).await;

    let worker = DispatchWorker::new(queue.clone(), Notify::new(notifier), stores);
    let worker_handle = tokio::spawn(worker.run(cancel.clone()));

    let watcher = tokio::spawn(async move {
        while !queue.is_empty().await {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        tracing::info!("all jobs settled");
        cancel.cancel();
    });

    let (worker_result, _) = tokio::try_join!(worker_handle, watcher).unwrap();
    worker_result.unwrap();
}
