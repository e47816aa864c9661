//! Test doubles for the transport layer.
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::header::HeaderMap;
use reqwest::{Method, Request, StatusCode};
use serde_json::Value;
use url::Url;

use crate::errors::Result;
use crate::transport::{HttpResponse, Transport};

/// What a fake transport saw.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl RecordedRequest {
    fn from_request(request: &Request) -> Self {
        RecordedRequest {
            method: request.method().clone(),
            url: request.url().clone(),
            headers: request.headers().clone(),
            body: request
                .body()
                .and_then(|b| b.as_bytes())
                .map(Bytes::copy_from_slice),
        }
    }

    pub fn json_body(&self) -> Value {
        serde_json::from_slice(self.body.as_ref().expect("request to have a body"))
            .expect("body to be json")
    }

    pub fn authorization(&self) -> Option<String> {
        self.headers
            .get(reqwest::header::AUTHORIZATION)
            .map(|v| v.to_str().unwrap().to_string())
    }
}

pub fn query_param(request: &RecordedRequest, key: &str) -> Option<String> {
    request
        .url
        .query_pairs()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

/// Transport that answers every request with a closure.
pub struct FnTransport<F> {
    handler: F,
    delay: Option<Duration>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl<F> FnTransport<F>
where
    F: Fn(&RecordedRequest) -> Result<HttpResponse> + Send + Sync,
{
    pub fn new(handler: F) -> Self {
        FnTransport {
            handler,
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Sleep before answering each request.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    pub fn requests_to(&self, path: &str) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.url.path() == path)
            .cloned()
            .collect()
    }
}

impl<F> fmt::Debug for FnTransport<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTransport").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F> Transport for FnTransport<F>
where
    F: Fn(&RecordedRequest) -> Result<HttpResponse> + Send + Sync,
{
    async fn execute(&self, request: Request) -> Result<HttpResponse> {
        let recorded = RecordedRequest::from_request(&request);
        self.requests.lock().push(recorded.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.handler)(&recorded)
    }
}

/// A 200 response with a json body.
pub fn json_response(body: Value) -> Result<HttpResponse> {
    Ok(HttpResponse::new(StatusCode::OK, body.to_string()))
}

/// Standard `{data, code, message, success}` envelope.
pub fn envelope(data: Value, code: Option<&str>, success: bool) -> Result<HttpResponse> {
    json_response(serde_json::json!({
        "data": data,
        "code": code,
        "message": code.map(|c| format!("message for {c}")),
        "success": success,
    }))
}
