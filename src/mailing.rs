//! Collaborator interfaces: topic/mailing store and subscriber store.
//!
//! The core does not own mailing or subscriber persistence. It resolves a
//! topic's delivery settings before enqueueing, and records a mailing's
//! lifecycle progress after a successful dispatch. Both stores are trait
//! seams so the application can plug in whatever backs them.

use serde::{Deserialize, Serialize};

use crate::job::ApiKey;

/// Lifecycle state of a mailing.
///
/// The core only ever drives `Sending` to `Sent`; the rest of the alphabet
/// exists so implementors can share one enum with their authoring flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MailingState {
    Draft,
    Approved,
    Sending,
    Sent,
    Cancelled,
}

impl std::fmt::Display for MailingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MailingState::Draft => "draft",
            MailingState::Approved => "approved",
            MailingState::Sending => "sending",
            MailingState::Sent => "sent",
            MailingState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A topic's delivery settings, as resolved from the mailing store.
///
/// Either field may be missing for a misconfigured topic; the dispatcher
/// validates both before building a job.
#[derive(Debug, Clone)]
pub struct Topic {
    /// Provider template for this topic's mailings.
    pub template_id: Option<String>,
    /// Provider credential scoped to this topic.
    pub api_key: Option<ApiKey>,
}

/// One subscriber record, as returned by the subscriber store.
///
/// Both fields are optional on purpose: upstream data is dirty, and the
/// row formatter skips entries it cannot render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscriber {
    /// Recipient address.
    pub email: Option<String>,
    /// Stable opaque token identifying the subscriber, used in the
    /// unsubscribe link.
    pub id: Option<String>,
}

/// Topic lookup and mailing state transitions.
#[async_trait::async_trait]
pub trait MailingStore: Send + Sync {
    /// Resolve a topic's delivery settings, or `None` if the topic does
    /// not exist.
    async fn topic(&self, topic_id: &str) -> Result<Option<Topic>, tower::BoxError>;

    /// Transition a mailing to `new_state`, asserting it currently is in
    /// `expected_prior`. The assertion is the sole consistency check; the
    /// core treats this call as fire-and-forget telemetry and never
    /// retries it.
    async fn mailing_update(
        &self,
        mailing_id: &str,
        new_state: MailingState,
        expected_prior: MailingState,
    ) -> Result<(), tower::BoxError>;
}

/// Subscriber lookup.
#[async_trait::async_trait]
pub trait SubscriberStore: Send + Sync {
    /// Confirmed subscribers of a topic, in a stable order.
    async fn confirmed_subscribers(&self, topic_id: &str)
    -> Result<Vec<Subscriber>, tower::BoxError>;
}
