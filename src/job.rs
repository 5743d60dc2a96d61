//! The dispatch job payload and the recipient row formatter.
//!
//! A [`DispatchJob`] is the durable unit of work: everything a worker needs
//! to submit one bulk mailing to the provider, resolved once at creation
//! time. Credentials are captured into the job and stay fixed for its
//! lifetime; a topic rotating its key does not affect in-flight jobs.

use serde::{Deserialize, Serialize};

use crate::mailing::Subscriber;

/// Header row the provider's bulk format requires at index 0.
pub const HEADER_ROW: [&str; 4] = ["subject", "email address", "body", "unsub_link"];

/// One row of the bulk table: subject, recipient address, body, unsub link.
pub type Row = [String; 4];

/// Topic-scoped provider credential.
///
/// Treated as a secret: `Debug` is redacted so the key can never leak
/// through logs or error chains. It still serializes in full, because the
/// job carrying it must survive a restart.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The raw key, for building the `Authorization` header.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ApiKey(***)")
    }
}

impl From<&str> for ApiKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Durable unit of dispatch work.
///
/// The queue assigns the correlation id and tracks the attempt count; the
/// payload itself is immutable once enqueued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchJob {
    /// Mailing this job advances on success.
    pub mailing_id: String,
    /// Provider-facing name of the submission.
    pub name: String,
    /// Provider template for the topic.
    pub template_id: String,
    /// Credential scoped to the topic.
    pub api_key: ApiKey,
    /// Header row plus one row per valid recipient.
    pub rows: Vec<Row>,
}

/// Shape a subscriber list into the provider's bulk row table.
///
/// Pure and deterministic. Subscribers with a missing or empty email, or
/// without a renderable id token, are skipped silently: one malformed
/// subscriber must never abort a whole mailing. Output order follows input
/// order, with [`HEADER_ROW`] always first.
pub fn recipient_rows(
    subscribers: &[Subscriber],
    subject: &str,
    body: &str,
    base_url: &str,
) -> Vec<Row> {
    let mut rows = Vec::with_capacity(subscribers.len() + 1);
    rows.push(HEADER_ROW.map(str::to_owned));

    for subscriber in subscribers {
        let Some(email) = subscriber.email.as_deref().filter(|e| !e.is_empty()) else {
            continue;
        };
        let Some(token) = subscriber.id.as_deref().filter(|t| !t.is_empty()) else {
            continue;
        };

        rows.push([
            subject.to_owned(),
            email.to_owned(),
            body.to_owned(),
            format!("{base_url}/subs/remove/{token}"),
        ]);
    }

    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub(email: Option<&str>, id: Option<&str>) -> Subscriber {
        Subscriber {
            email: email.map(str::to_owned),
            id: id.map(str::to_owned),
        }
    }

    #[test]
    fn header_row_is_always_first() {
        let rows = recipient_rows(&[], "s", "b", "https://example.org");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0], HEADER_ROW.map(str::to_owned));
    }

    #[test]
    fn skips_subscribers_without_email_or_token() {
        let subscribers = [
            sub(Some("a@example.org"), Some("aaa")),
            sub(Some(""), Some("bbb")),
            sub(None, Some("ccc")),
            sub(Some("d@example.org"), None),
            sub(Some("e@example.org"), Some("")),
            sub(Some("f@example.org"), Some("fff")),
        ];
        let rows = recipient_rows(&subscribers, "subj", "body", "https://example.org");

        let emails: Vec<_> = rows[1..].iter().map(|r| r[1].as_str()).collect();
        assert_eq!(emails, ["a@example.org", "f@example.org"]);
    }

    #[test]
    fn preserves_input_order_and_builds_unsub_links() {
        let subscribers = [
            sub(Some("one@example.org"), Some("id1")),
            sub(Some("two@example.org"), Some("id2")),
        ];
        let rows = recipient_rows(&subscribers, "Hello", "Text", "https://apps.example.org/notify");

        assert_eq!(
            rows[1],
            [
                "Hello".to_owned(),
                "one@example.org".to_owned(),
                "Text".to_owned(),
                "https://apps.example.org/notify/subs/remove/id1".to_owned(),
            ]
        );
        assert_eq!(rows[2][3], "https://apps.example.org/notify/subs/remove/id2");
    }

    #[test]
    fn one_invalid_subscriber_out_of_three_yields_three_rows() {
        // Header plus two valid recipients.
        let subscribers = [
            sub(Some("a@example.org"), Some("a1")),
            sub(Some(""), Some("b1")),
            sub(Some("c@example.org"), Some("c1")),
        ];
        let rows = recipient_rows(&subscribers, "s", "b", "https://example.org");
        assert_eq!(rows.len(), 3);
    }

    #[test]
    fn api_key_debug_is_redacted() {
        let key = ApiKey::new("super-secret");
        assert_eq!(format!("{key:?}"), "ApiKey(***)");
        assert_eq!(key.expose(), "super-secret");
    }
}
