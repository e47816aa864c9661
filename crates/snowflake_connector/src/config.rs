//! Configuration for the request execution engine.
use std::time::Duration;

use serde::Deserialize;

use crate::retry::{BackoffStrategy, Endpoint, RetryPolicy};

/// Backoff parameters for one family of call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct BackoffConfig {
    pub strategy: BackoffStrategy,
    /// Lower bound for a single sleep.
    pub base: Duration,
    /// Upper bound for a single sleep.
    pub cap: Duration,
}

impl BackoffConfig {
    pub const fn new(strategy: BackoffStrategy, base: Duration, cap: Duration) -> Self {
        BackoffConfig {
            strategy,
            base,
            cap,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Dial timeout for the underlying HTTP client.
    pub connect_timeout: Duration,
    /// Timeout for a single HTTP attempt.
    pub request_timeout: Duration,
    /// Total budget for a login request, including retries.
    pub login_timeout: Duration,
    /// Total budget for query requests, including retries. `None` means only
    /// the attempt cap (if any) stops retrying.
    pub query_timeout: Option<Duration>,
    /// Cap on attempts for non-login requests.
    pub max_retry_attempts: Option<u32>,
    /// Cap on attempts for login requests.
    pub max_login_attempts: Option<u32>,
    pub login_backoff: BackoffConfig,
    pub query_backoff: BackoffConfig,
    /// How often to heartbeat the session when keep alive is enabled.
    pub heartbeat_interval: Duration,
    /// Whether to run a heartbeat for the lifetime of the connection.
    pub keep_session_alive: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            connect_timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(60),
            login_timeout: Duration::from_secs(300),
            query_timeout: None,
            max_retry_attempts: None,
            max_login_attempts: Some(7),
            login_backoff: BackoffConfig::new(
                BackoffStrategy::Decorrelated,
                Duration::from_secs(1),
                Duration::from_secs(16),
            ),
            query_backoff: BackoffConfig::new(
                BackoffStrategy::Decorrelated,
                Duration::from_secs(1),
                Duration::from_secs(16),
            ),
            // One hour is plenty for the default four hour master token
            // validity.
            heartbeat_interval: Duration::from_secs(60 * 60),
            keep_session_alive: false,
        }
    }
}

impl ClientConfig {
    /// Build the retry policy used for calls against `endpoint`.
    pub fn retry_policy(&self, endpoint: Endpoint) -> RetryPolicy {
        match endpoint {
            Endpoint::Login => RetryPolicy {
                endpoint,
                backoff: self.login_backoff,
                total_timeout: Some(self.login_timeout),
                max_attempts: self.max_login_attempts,
                request_timeout: self.request_timeout,
            },
            Endpoint::Query | Endpoint::Generic => RetryPolicy {
                endpoint,
                backoff: self.query_backoff,
                total_timeout: self.query_timeout,
                max_attempts: self.max_retry_attempts,
                request_timeout: self.request_timeout,
            },
        }
    }
}
