use std::sync::Arc;

use bytes::Bytes;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{Method, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::trace;
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::errors::{Result, SESSION_EXPIRED_CODE, SnowflakeError};
use crate::retry::{Endpoint, RetryExecutor, RetryPolicy, RetryRequest};
use crate::transport::{HttpResponse, Transport};

const BODY_CONTENT_TYPE: &str = "application/json";
const REQ_ACCEPT: &str = "application/snowflake";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl Serialize for RequestId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut buf = Uuid::encode_buffer();
        serializer.serialize_str(self.0.hyphenated().encode_lower(&mut buf))
    }
}

/// Query parameters carrying only a request id.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestIdParams {
    pub request_id: RequestId,
}

impl RequestIdParams {
    pub fn new() -> Self {
        Self {
            request_id: RequestId::new(),
        }
    }
}

/// Standard response wrapper returned by every endpoint.
#[derive(Debug, Deserialize)]
pub struct Envelope<T> {
    pub data: Option<T>,
    pub code: Option<String>,
    pub message: Option<String>,
    #[serde(default)]
    pub success: bool,
}

impl<T> Envelope<T> {
    pub fn is_session_expired(&self) -> bool {
        self.code.as_deref() == Some(SESSION_EXPIRED_CODE)
    }

    pub fn has_code(&self, code: &str) -> bool {
        self.code.as_deref() == Some(code)
    }
}

/// Client for the REST api. Builds urls and headers, then hands the request
/// to the retry executor.
#[derive(Debug, Clone)]
pub struct SnowflakeClient {
    base_url: Url,
    executor: RetryExecutor,
    config: Arc<ClientConfig>,
}

impl SnowflakeClient {
    pub fn new(base_url: Url, transport: Arc<dyn Transport>, config: ClientConfig) -> Self {
        Self {
            base_url,
            executor: RetryExecutor::new(transport),
            config: Arc::new(config),
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn policy(&self, endpoint: Endpoint) -> RetryPolicy {
        self.config.retry_policy(endpoint)
    }

    /// Resolve `path` (absolute path or full url) against the base url and
    /// attach `params` as the query string.
    pub fn url<P: Serialize>(&self, path: &str, params: Option<&P>) -> Result<Url> {
        let mut url = self
            .base_url
            .join(path)
            .map_err(|e| SnowflakeError::UrlParseError(format!("{e}")))?;

        if let Some(params) = params {
            let query = serde_urlencoded::to_string(params)
                .map_err(|e| SnowflakeError::UrlParseError(format!("{e}")))?;
            if !query.is_empty() {
                // Server supplied urls may already carry parameters.
                let query = match url.query() {
                    Some(existing) if !existing.is_empty() => format!("{existing}&{query}"),
                    _ => query,
                };
                url.set_query(Some(&query));
            }
        }
        Ok(url)
    }

    pub fn headers(token: Option<&str>) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(BODY_CONTENT_TYPE));
        headers.insert(ACCEPT, HeaderValue::from_static(REQ_ACCEPT));
        if let Some(token) = token {
            let val = format!("Snowflake Token=\"{token}\"");
            let val = HeaderValue::from_str(&val).map_err(|_| {
                SnowflakeError::Internal("token is not a valid header value".to_string())
            })?;
            headers.insert(AUTHORIZATION, val);
        }
        Ok(headers)
    }

    /// Execute a prepared request with retries.
    pub async fn execute_request(
        &self,
        request: &RetryRequest<'_>,
        policy: &RetryPolicy,
    ) -> Result<HttpResponse> {
        self.executor.execute(request, policy).await
    }

    /// Execute a json request and decode the response envelope.
    ///
    /// The body is serialized again for every attempt.
    pub async fn execute<P, B, R>(
        &self,
        method: Method,
        path: &str,
        params: Option<&P>,
        body: Option<&B>,
        token: Option<&str>,
        policy: &RetryPolicy,
    ) -> Result<Envelope<R>>
    where
        P: Serialize,
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let url = self.url(path, params)?;
        let mut request = RetryRequest::new(method, url).with_headers(Self::headers(token)?);
        if let Some(body) = body {
            request = request.with_body(move || Ok(Bytes::from(serde_json::to_vec(body)?)));
        }

        let res = self.execute_request(&request, policy).await?;
        trace!(path, len = res.body.len(), "decoding response");
        res.json()
    }
}
