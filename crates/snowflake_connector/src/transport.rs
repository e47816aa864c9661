use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::{Client, Request, StatusCode};
use serde::de::DeserializeOwned;
use tracing::trace;

use crate::errors::{Result, TransportError};

const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Executes a single HTTP request.
///
/// This is the seam between the retry logic and the network. Implementations
/// must not retry on their own.
#[async_trait]
pub trait Transport: Sync + Send + Debug {
    async fn execute(&self, request: Request) -> Result<HttpResponse>;
}

/// A fully buffered response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        HttpResponse {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// Deserialize the body as json.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

#[derive(Debug, Default)]
pub struct ReqwestTransportBuilder {
    connect_timeout: Option<Duration>,
}

impl ReqwestTransportBuilder {
    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = Some(connect_timeout);
        self
    }

    pub fn build(self) -> Result<ReqwestTransport> {
        // Per-attempt timeouts are enforced by the retry executor. Content
        // headers are set per request by the client.
        let mut builder = Client::builder().user_agent(APP_USER_AGENT);

        if let Some(connect_timeout) = self.connect_timeout {
            builder = builder.connect_timeout(connect_timeout);
        }

        Ok(ReqwestTransport {
            inner: builder.build()?,
        })
    }
}

/// Transport backed by a reqwest client.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    inner: Client,
}

impl ReqwestTransport {
    pub fn builder() -> ReqwestTransportBuilder {
        ReqwestTransportBuilder::default()
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn execute(&self, request: Request) -> Result<HttpResponse> {
        let res = self
            .inner
            .execute(request)
            .await
            .map_err(TransportError::from)?;
        let status = res.status();
        let headers = res.headers().clone();
        let body = res.bytes().await.map_err(TransportError::from)?;
        trace!(%status, len = body.len(), "response");

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}
