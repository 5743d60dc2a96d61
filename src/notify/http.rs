//! HTTP notifier for the provider's bulk-notification endpoint.

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use serde::Serialize;

use crate::config::DispatchConfig;
use crate::job::{DispatchJob, Row};
use crate::notify::{DispatchError, Notifier, Receipt};

/// Request body of the provider's bulk endpoint.
#[derive(Serialize)]
struct BulkBody<'a> {
    name: &'a str,
    template_id: &'a str,
    rows: &'a [Row],
}

/// Notifier backend submitting jobs over HTTP.
///
/// One `POST {bulk_endpoint}` per job, authenticated with the job's own
/// API key behind the configured credential prefix. Every request is
/// bounded by the configured timeout; an unbounded call would starve a
/// worker indefinitely.
///
/// Classification:
/// - 2xx: success; the response body is kept on the [`Receipt`] for
///   informational logging only
/// - 5xx: retryable
/// - transport failure (timeout, connect, broken body): retryable
/// - any other status: fatal
#[derive(Clone)]
pub struct BulkNotifier {
    client: reqwest::Client,
    endpoint: String,
    credential_prefix: String,
}

impl BulkNotifier {
    /// Build a notifier from the process configuration.
    pub fn new(config: &DispatchConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            client,
            endpoint: config.bulk_endpoint.clone(),
            credential_prefix: config.credential_prefix.clone(),
        })
    }
}

#[async_trait]
impl Notifier for BulkNotifier {
    type Error = DispatchError;

    #[tracing::instrument(skip_all, fields(mailing = %job.mailing_id))]
    async fn dispatch(&mut self, job: DispatchJob) -> Result<Receipt, DispatchError> {
        let body = BulkBody {
            name: &job.name,
            template_id: &job.template_id,
            rows: &job.rows,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .header(
                AUTHORIZATION,
                format!("{}{}", self.credential_prefix, job.api_key.expose()),
            )
            .json(&body)
            .send()
            .await
            // The call never completed: network error or timeout.
            .map_err(DispatchError::retryable)?;

        let status = response.status();
        if status.is_success() {
            let body = response
                .json::<serde_json::Value>()
                .await
                .unwrap_or(serde_json::Value::Null);
            return Ok(Receipt {
                status: status.as_u16(),
                body,
            });
        }

        let detail = response.text().await.unwrap_or_default();
        let rejection = ApiRejection {
            status: status.as_u16(),
            detail,
        };
        if status.is_server_error() {
            Err(DispatchError::retryable(rejection))
        } else {
            Err(DispatchError::fatal(rejection))
        }
    }
}

/// Non-2xx answer from the provider.
#[derive(Debug)]
pub struct ApiRejection {
    status: u16,
    detail: String,
}

impl std::fmt::Display for ApiRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bulk api answered HTTP {}", self.status)?;
        if !self.detail.is_empty() {
            write!(f, ": {}", self.detail)?;
        }
        Ok(())
    }
}

impl std::error::Error for ApiRejection {}
