//! Process-wide dispatch configuration.
//!
//! Everything the queue, dispatcher, and worker need is collected into a
//! single [`DispatchConfig`] constructed once at process start and passed
//! by reference into the constructors that need it. Business logic never
//! reads the environment on its own.

use std::time::Duration;

use crate::retry::RetryPolicy;

/// Connection topology for the durable queue backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueConn {
    /// A single queue host.
    Single { host: String, port: u16 },
    /// A highly-available topology: a set of candidate hosts belonging to
    /// the named cluster. The backend probes them in order and uses the
    /// writable primary.
    HighAvailability {
        hosts: Vec<(String, u16)>,
        cluster: String,
    },
}

/// Configuration for the whole dispatch subsystem.
///
/// Field defaults mirror the production deployment this crate was built
/// for; override them per environment with [`DispatchConfig::from_env`] or
/// the `with_*` builders.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Queue backend connection.
    pub queue: QueueConn,
    /// Base URL prepended to unsubscribe links.
    pub base_url: String,
    /// Bulk-notification endpoint of the email provider.
    pub bulk_endpoint: String,
    /// Prefix placed in front of the API key in the `Authorization` header.
    pub credential_prefix: String,
    /// Upper bound on each provider call.
    pub request_timeout: Duration,
    /// Default retry policy attached to newly enqueued jobs.
    pub retry: RetryPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue: QueueConn::Single {
                host: "127.0.0.1".to_owned(),
                port: 5432,
            },
            base_url: "https://apps.canada.ca/x-notify".to_owned(),
            bulk_endpoint: "https://api.notification.canada.ca/v2/notifications/bulk".to_owned(),
            credential_prefix: "ApiKey-v1 ".to_owned(),
            request_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

impl DispatchConfig {
    /// Read the configuration from the process environment.
    ///
    /// Intended to be called exactly once at startup. Missing or
    /// unparseable variables fall back to the defaults; the backoff kind
    /// is resolved from the configured value (`exponential` or `fixed`).
    ///
    /// Recognized variables: `QUEUE_HOST`, `QUEUE_PORT`,
    /// `QUEUE_STANDBY_HOSTS` (comma-separated `host:port` pairs),
    /// `QUEUE_CLUSTER`, `BASE_URL`, `BULK_API_ENDPOINT`,
    /// `CREDENTIAL_PREFIX`, `MAX_ATTEMPTS`, `BACKOFF`, `BACKOFF_DELAY_MS`,
    /// `REQUEST_TIMEOUT_MS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let host = env_or("QUEUE_HOST", "127.0.0.1");
        let port = env_parsed("QUEUE_PORT", 5432);

        let queue = match std::env::var("QUEUE_STANDBY_HOSTS") {
            Ok(standbys) if !standbys.trim().is_empty() => {
                let mut hosts = vec![(host.clone(), port)];
                hosts.extend(standbys.split(',').filter_map(parse_host_port));
                QueueConn::HighAvailability {
                    hosts,
                    cluster: env_or("QUEUE_CLUSTER", "maildrop"),
                }
            }
            _ => QueueConn::Single { host, port },
        };

        Self {
            queue,
            base_url: env_or("BASE_URL", &defaults.base_url),
            bulk_endpoint: env_or("BULK_API_ENDPOINT", &defaults.bulk_endpoint),
            credential_prefix: env_or("CREDENTIAL_PREFIX", &defaults.credential_prefix),
            request_timeout: Duration::from_millis(env_parsed(
                "REQUEST_TIMEOUT_MS",
                defaults.request_timeout.as_millis() as u64,
            )),
            retry: RetryPolicy::from_env(),
        }
    }

    /// Override the unsubscribe base URL.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Override the bulk-notification endpoint.
    pub fn with_bulk_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.bulk_endpoint = endpoint.into();
        self
    }

    /// Override the default retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

pub(crate) fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

pub(crate) fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_host_port(entry: &str) -> Option<(String, u16)> {
    let (host, port) = entry.trim().rsplit_once(':')?;
    Some((host.to_owned(), port.parse().ok()?))
}
