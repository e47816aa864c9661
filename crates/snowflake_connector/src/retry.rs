//! Retry HTTP calls with jittered backoff.
//!
//! Every logical call gets a [`RetryState`] that tracks the attempt number,
//! the time spent so far and the previous sleep. Each attempt rebuilds the
//! request from scratch (the body comes from a factory, so time sensitive
//! material can be regenerated) and tags the URL with the attempt's
//! correlation parameters so server side logs line up with ours.
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use rand::Rng;
use reqwest::header::HeaderMap;
use reqwest::{Method, Request, StatusCode};
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use crate::config::BackoffConfig;
use crate::errors::{LastFailure, Result, SnowflakeError, TransportError};
use crate::transport::{HttpResponse, Transport};

pub const REQUEST_GUID_KEY: &str = "request_guid";
pub const RETRY_COUNT_KEY: &str = "retryCount";
pub const RETRY_REASON_KEY: &str = "retryReason";
pub const CLIENT_START_TIME_KEY: &str = "clientStartTime";

const MIN_SLEEP: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `min(max(2^a * base, 1ms), cap)`
    Exponential,
    /// Uniform in `[0, exponential]`.
    FullJitter,
    /// Half the exponential value plus a uniform jitter over the other half.
    EqualJitter,
    /// Uniform in `[base, 3 * previous sleep]`.
    Decorrelated,
}

/// Which kind of endpoint a call targets. Endpoints differ in which failures
/// they consider worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Login,
    Query,
    Generic,
}

impl Endpoint {
    pub fn is_retryable_status(&self, status: StatusCode) -> bool {
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return true;
        }
        match self {
            // Query submissions carry a request id the server dedups on, so a
            // request timeout is safe to resend.
            Self::Query => status == StatusCode::REQUEST_TIMEOUT,
            Self::Login | Self::Generic => false,
        }
    }
}

/// Compute the un-jittered exponential backoff for an attempt.
pub fn exponential_backoff(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    base.saturating_mul(factor).max(MIN_SLEEP).min(cap)
}

fn uniform(lo: Duration, hi: Duration) -> Duration {
    let lo_ms = lo.as_millis() as u64;
    let hi_ms = hi.as_millis() as u64;
    if hi_ms <= lo_ms {
        return lo;
    }
    Duration::from_millis(rand::rng().random_range(lo_ms..=hi_ms))
}

impl BackoffConfig {
    /// Compute how long to sleep before retrying after `attempt` failed
    /// attempts, given the previous sleep.
    ///
    /// Jittered values are always within `[base, cap]`.
    pub fn next_sleep(&self, attempt: u32, prev_sleep: Duration) -> Duration {
        let exp = exponential_backoff(attempt, self.base, self.cap);
        let sleep = match self.strategy {
            BackoffStrategy::Exponential => return exp,
            BackoffStrategy::FullJitter => uniform(Duration::ZERO, exp),
            BackoffStrategy::EqualJitter => {
                let half = exp / 2;
                half + uniform(Duration::ZERO, exp - half)
            }
            BackoffStrategy::Decorrelated => {
                let upper = prev_sleep.saturating_mul(3).max(self.base);
                uniform(self.base, upper)
            }
        };
        sleep.max(self.base).min(self.cap)
    }
}

/// How a single logical call should be retried.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub endpoint: Endpoint,
    pub backoff: BackoffConfig,
    /// Total time budget across all attempts and sleeps.
    pub total_timeout: Option<Duration>,
    pub max_attempts: Option<u32>,
    /// Upper bound for a single attempt.
    pub request_timeout: Duration,
}

impl RetryPolicy {
    pub fn with_total_timeout(mut self, total_timeout: Option<Duration>) -> Self {
        self.total_timeout = total_timeout;
        self
    }
}

/// Produces a fresh request body for every attempt.
pub type BodyFactory<'a> = Box<dyn Fn() -> Result<Bytes> + Send + Sync + 'a>;

/// Everything needed to (re)build a request.
pub struct RetryRequest<'a> {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<BodyFactory<'a>>,
}

impl fmt::Debug for RetryRequest<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryRequest")
            .field("method", &self.method)
            .field("url", &self.url.path())
            .field("has_body", &self.body.is_some())
            .finish()
    }
}

impl<'a> RetryRequest<'a> {
    pub fn new(method: Method, url: Url) -> Self {
        RetryRequest {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body<F>(mut self, body: F) -> Self
    where
        F: Fn() -> Result<Bytes> + Send + Sync + 'a,
    {
        self.body = Some(Box::new(body));
        self
    }

    /// Build the request for the current attempt.
    fn build(&self, state: &RetryState) -> Result<Request> {
        let mut url = self.url.clone();
        let kept: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(k, _)| {
                !matches!(
                    k.as_ref(),
                    REQUEST_GUID_KEY | RETRY_COUNT_KEY | RETRY_REASON_KEY | CLIENT_START_TIME_KEY
                )
            })
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        {
            let mut pairs = url.query_pairs_mut();
            pairs.clear();
            pairs.extend_pairs(kept);
            if state.attempt > 0 {
                pairs.append_pair(RETRY_COUNT_KEY, &state.attempt.to_string());
                pairs.append_pair(RETRY_REASON_KEY, &state.last_reason.to_string());
                pairs.append_pair(CLIENT_START_TIME_KEY, &state.client_start_time.to_string());
            }
            pairs.append_pair(REQUEST_GUID_KEY, &Uuid::new_v4().to_string());
        }

        let mut request = Request::new(self.method.clone(), url);
        *request.headers_mut() = self.headers.clone();
        if let Some(body) = &self.body {
            *request.body_mut() = Some(body()?.into());
        }

        Ok(request)
    }
}

/// Per call bookkeeping.
#[derive(Debug)]
struct RetryState {
    /// Number of attempts that already failed.
    attempt: u32,
    started: Instant,
    /// Unix seconds when the logical call started.
    client_start_time: i64,
    prev_sleep: Duration,
    /// HTTP status of the last failure, 0 for network errors.
    last_reason: u16,
    backoff: BackoffConfig,
}

impl RetryState {
    fn new(backoff: BackoffConfig) -> Self {
        RetryState {
            attempt: 0,
            started: Instant::now(),
            client_start_time: Utc::now().timestamp(),
            prev_sleep: Duration::ZERO,
            last_reason: 0,
            backoff,
        }
    }

    fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    fn remaining(&self, policy: &RetryPolicy) -> Option<Duration> {
        policy
            .total_timeout
            .map(|total| total.saturating_sub(self.elapsed()))
    }

    fn attempt_timeout(&self, policy: &RetryPolicy) -> Duration {
        match self.remaining(policy) {
            Some(remaining) => remaining.min(policy.request_timeout),
            None => policy.request_timeout,
        }
    }

    fn record_failure(&mut self, failure: &LastFailure) {
        self.attempt += 1;
        self.last_reason = failure.status().map(|s| s.as_u16()).unwrap_or(0);
    }

    fn next_sleep(&mut self) -> Duration {
        // The failure was already counted, the first retry uses attempt 0.
        let sleep = self
            .backoff
            .next_sleep(self.attempt.saturating_sub(1), self.prev_sleep);
        self.prev_sleep = sleep;
        sleep
    }
}

/// Wraps a transport with retry logic.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    transport: Arc<dyn Transport>,
}

impl RetryExecutor {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        RetryExecutor { transport }
    }

    /// Execute a request, retrying transient failures according to the
    /// policy.
    ///
    /// Returns `RetryTimeout` when the time budget runs out and
    /// `RetryGivenUp` when the attempt cap is hit. Non-retryable statuses are
    /// returned immediately as `HttpError`.
    pub async fn execute(
        &self,
        request: &RetryRequest<'_>,
        policy: &RetryPolicy,
    ) -> Result<HttpResponse> {
        let mut state = RetryState::new(policy.backoff);

        loop {
            let http_req = request.build(&state)?;
            let timeout = state.attempt_timeout(policy);

            let outcome = match tokio::time::timeout(timeout, self.transport.execute(http_req)).await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(TransportError::timeout(format!(
                    "attempt did not complete within {timeout:?}"
                ))
                .into()),
            };

            let failure = match outcome {
                Ok(res) if res.status.is_success() => return Ok(res),
                Ok(res) if policy.endpoint.is_retryable_status(res.status) => {
                    LastFailure::Status(res.status)
                }
                Ok(res) => {
                    debug!(status = %res.status, endpoint = ?policy.endpoint, "non-retryable status");
                    return Err(SnowflakeError::HttpError(res.status));
                }
                Err(e) if e.is_transient() => LastFailure::Error(Box::new(e)),
                Err(e) => return Err(e),
            };

            state.record_failure(&failure);

            if let Some(max) = policy.max_attempts {
                if state.attempt >= max {
                    warn!(attempts = state.attempt, %failure, "retry limit reached");
                    return Err(SnowflakeError::RetryGivenUp {
                        attempts: state.attempt,
                        last: failure,
                    });
                }
            }

            let mut sleep = state.next_sleep();
            let mut out_of_time = false;
            if let Some(remaining) = state.remaining(policy) {
                if sleep >= remaining {
                    sleep = remaining;
                    out_of_time = true;
                }
            }

            debug!(
                attempt = state.attempt,
                ?sleep,
                %failure,
                endpoint = ?policy.endpoint,
                path = request.url.path(),
                "retrying request"
            );
            if !sleep.is_zero() {
                tokio::time::sleep(sleep).await;
            }

            if out_of_time {
                let elapsed = state.elapsed();
                warn!(?elapsed, attempts = state.attempt, %failure, "request timed out");
                return Err(SnowflakeError::RetryTimeout {
                    elapsed,
                    attempts: state.attempt,
                    last: failure,
                });
            }
        }
    }
}
