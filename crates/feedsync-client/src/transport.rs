use std::{collections::VecDeque, sync::Mutex, time::Duration};

use async_trait::async_trait;
use feedsync_core::{error::ErrorCategory, secret::SecretString};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use thiserror::Error;
use tokio::time::Instant;
use tracing::instrument;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// JSON body, used for GraphQL.
    Post,
    /// No body, used for documents.
    Get,
}

/// One outbound request. Header values are secrets (cookies included).
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub request_id: Uuid,
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, SecretString)>,
    /// JSON body for `Post`; `Null` for `Get`.
    pub body: serde_json::Value,
}

impl TransportRequest {
    /// Value of the first header named `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&SecretString> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    /// Raw `Retry-After` header, if the server sent one.
    pub retry_after: Option<String>,
    pub body: Vec<u8>,
}

impl TransportResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            retry_after: None,
            body: body.into(),
        }
    }

    pub fn json(status: u16, body: &serde_json::Value) -> Self {
        Self::new(status, body.to_string())
    }

    pub fn with_retry_after(mut self, value: impl Into<String>) -> Self {
        self.retry_after = Some(value.into());
        self
    }
}

/// No response was obtained.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("connection interrupted: {0}")]
    Interrupted(String),
    #[error("request could not be built: {0}")]
    Invalid(String),
}

impl TransportError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            TransportError::Timeout
            | TransportError::Connect(_)
            | TransportError::Interrupted(_) => ErrorCategory::Transient,
            TransportError::Invalid(_) => ErrorCategory::Fatal,
        }
    }
}

/// Sends one request and returns whatever the server answered.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name for logs (e.g., "http", "scripted").
    fn name(&self) -> &'static str;

    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError>;
}

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Invalid(e.to_string()))?;
        Ok(Self { client })
    }

    fn headers(request: &TransportRequest) -> Result<HeaderMap, TransportError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| TransportError::Invalid(format!("header name {name:?}")))?;
            let mut value = HeaderValue::from_str(value.expose())
                .map_err(|_| TransportError::Invalid(format!("value of header {name}")))?;
            value.set_sensitive(true);
            headers.insert(name, value);
        }
        Ok(headers)
    }
}

fn map_reqwest(err: reqwest::Error) -> TransportError {
    // Strip the URL; only the failure kind is interesting.
    let err = err.without_url();
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else if err.is_builder() {
        TransportError::Invalid(err.to_string())
    } else {
        TransportError::Interrupted(err.to_string())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &'static str {
        "http"
    }

    #[instrument(skip_all, fields(request_id = %request.request_id, method = ?request.method))]
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let headers = Self::headers(&request)?;
        let builder = match request.method {
            Method::Post => self.client.post(&request.url).json(&request.body),
            Method::Get => self.client.get(&request.url),
        };
        let response = builder
            .headers(headers)
            .send()
            .await
            .map_err(map_reqwest)?;
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await.map_err(map_reqwest)?.to_vec();
        Ok(TransportResponse {
            status,
            retry_after,
            body,
        })
    }
}

/// Transport double that replays queued outcomes and records every request.
#[derive(Default)]
pub struct ScriptedTransport {
    queue: Mutex<VecDeque<Result<TransportResponse, TransportError>>>,
    fallback: Mutex<Option<Result<TransportResponse, TransportError>>>,
    sent: Mutex<Vec<(Instant, TransportRequest)>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one outcome.
    pub fn push(&self, outcome: Result<TransportResponse, TransportError>) -> &Self {
        lock(&self.queue).push_back(outcome);
        self
    }

    pub fn respond(&self, response: TransportResponse) -> &Self {
        self.push(Ok(response))
    }

    /// Outcome returned once the queue is drained.
    pub fn always(&self, outcome: Result<TransportResponse, TransportError>) -> &Self {
        *lock(&self.fallback) = Some(outcome);
        self
    }

    /// Requests sent so far, with their dispatch time.
    pub fn requests(&self) -> Vec<(Instant, TransportRequest)> {
        lock(&self.sent).clone()
    }

    pub fn calls(&self) -> usize {
        lock(&self.sent).len()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        lock(&self.sent).push((Instant::now(), request));
        let next = lock(&self.queue).pop_front();
        match next {
            Some(outcome) => outcome,
            None => lock(&self.fallback)
                .clone()
                .unwrap_or_else(|| Err(TransportError::Connect("script exhausted".into()))),
        }
    }
}
