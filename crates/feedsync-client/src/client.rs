use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feedsync_core::{
    auth::{AuthContext, ProbeOutcome, SessionProbe},
    bundle::DEFAULT_ORIGIN,
    cancel::Cancellation,
    clock::Clock,
    error::ErrorCategory,
    secret::SecretString,
    vault::CredentialVault,
};
use feedsync_session::{AuthError, SessionAuthenticator};
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{
    classify::{classify, classify_document, redacted_excerpt, Failure, Outcome},
    error::ClientError,
    feed,
    policy::{RecoveryAction, RetryPolicy},
    throttle::Throttle,
    transport::{Method, Transport, TransportRequest, TransportResponse},
};

/// GraphQL endpoint of the feed service.
pub const DEFAULT_ENDPOINT: &str = "https://app.daily.dev/api/graphql";

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub endpoint: String,
    /// Sent as `Origin`, and with a trailing slash as `Referer`.
    pub origin: String,
    pub policy: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            origin: DEFAULT_ORIGIN.to_string(),
            policy: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphqlRequest {
    #[serde(rename = "operationName", skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
    pub query: String,
    pub variables: serde_json::Value,
}

impl GraphqlRequest {
    pub fn new(operation_name: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            operation_name: Some(operation_name.into()),
            query: query.into(),
            variables: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn with_variables(mut self, variables: serde_json::Value) -> Self {
        self.variables = variables;
        self
    }

    fn name(&self) -> &str {
        self.operation_name.as_deref().unwrap_or("anonymous")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GraphqlResponse {
    pub data: serde_json::Value,
    pub attempts: u32,
    pub request_id: Uuid,
}

/// Body of a fetched page, such as an article.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub url: String,
    pub body: String,
    pub attempts: u32,
    pub request_id: Uuid,
}

/// Per-attempt counters since construction or the last reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RequestStats {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub rate_limited: u64,
    pub retried: u64,
}

impl RequestStats {
    /// Successful attempts as a percentage of all attempts.
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.successful as f64 / self.total as f64 * 100.0
        }
    }
}

/// Issues GraphQL queries through a throttle and recovers per the policy.
pub struct ResilientClient<T> {
    transport: T,
    throttle: Throttle,
    config: ClientConfig,
    stats: Mutex<RequestStats>,
}

impl<T: Transport> ResilientClient<T> {
    pub fn new(transport: T, throttle: Throttle, config: ClientConfig) -> Self {
        Self {
            transport,
            throttle,
            config,
            stats: Mutex::new(RequestStats::default()),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn stats(&self) -> RequestStats {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn reset_stats(&self) {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner) = RequestStats::default();
    }

    fn record(&self, update: impl FnOnce(&mut RequestStats)) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        update(&mut *stats);
    }

    /// Run `request` without session material.
    pub async fn execute(
        &self,
        request: &GraphqlRequest,
        cancel: &Cancellation,
    ) -> Result<GraphqlResponse, ClientError> {
        self.dispatch(request, None, cancel).await
    }

    /// Run `request` with an explicit session context.
    pub async fn execute_with(
        &self,
        request: &GraphqlRequest,
        context: &AuthContext,
        cancel: &Cancellation,
    ) -> Result<GraphqlResponse, ClientError> {
        self.dispatch(request, Some(context), cancel).await
    }

    /// Run `request` with the session's current context. An `AuthExpired`
    /// outcome expires that session.
    pub async fn execute_authenticated<V, C>(
        &self,
        session: &SessionAuthenticator<V, C>,
        request: &GraphqlRequest,
        cancel: &Cancellation,
    ) -> Result<GraphqlResponse, ClientError>
    where
        V: CredentialVault,
        C: Clock,
    {
        let context = session_context(session)?;
        let result = self.execute_with(request, &context, cancel).await;
        expire_on_rejection(session, &context, &result);
        result
    }

    /// GET `url` through the same throttle and recovery policy as queries.
    /// Session cookies and captured headers are sent only to the service's
    /// own site.
    pub async fn fetch_document(
        &self,
        url: &str,
        context: Option<&AuthContext>,
        cancel: &Cancellation,
    ) -> Result<Document, ClientError> {
        let parsed = reqwest::Url::parse(url).map_err(|e| invalid_url(url, e.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(invalid_url(url, format!("unsupported scheme {}", parsed.scheme())));
        }
        let context = context.filter(|_| self.same_site(&parsed));
        let request_id = Uuid::new_v4();
        let span = info_span!(
            "document",
            %request_id,
            host = parsed.host_str().unwrap_or_default(),
            transport = self.transport.name(),
        );
        let build = || TransportRequest {
            request_id,
            method: Method::Get,
            url: parsed.to_string(),
            headers: self.document_headers(context),
            body: serde_json::Value::Null,
        };
        let (body, attempts) = self
            .run_attempts(build, classify_document, cancel)
            .instrument(span)
            .await?;
        Ok(Document {
            url: parsed.to_string(),
            body,
            attempts,
            request_id,
        })
    }

    /// [`fetch_document`](Self::fetch_document) with the session's current
    /// context. An `AuthExpired` outcome expires that session.
    pub async fn fetch_document_authenticated<V, C>(
        &self,
        session: &SessionAuthenticator<V, C>,
        url: &str,
        cancel: &Cancellation,
    ) -> Result<Document, ClientError>
    where
        V: CredentialVault,
        C: Clock,
    {
        let context = session_context(session)?;
        let result = self.fetch_document(url, Some(&context), cancel).await;
        expire_on_rejection(session, &context, &result);
        result
    }

    async fn dispatch(
        &self,
        request: &GraphqlRequest,
        context: Option<&AuthContext>,
        cancel: &Cancellation,
    ) -> Result<GraphqlResponse, ClientError> {
        let body = serde_json::to_value(request).map_err(|e| ClientError::Request {
            category: ErrorCategory::Fatal,
            attempts: 0,
            status: None,
            detail: format!("request could not be encoded: {e}"),
        })?;
        let request_id = Uuid::new_v4();
        let span = info_span!(
            "graphql",
            %request_id,
            operation = request.name(),
            transport = self.transport.name(),
        );
        let build = || TransportRequest {
            request_id,
            method: Method::Post,
            url: self.config.endpoint.clone(),
            headers: self.headers(context),
            body: body.clone(),
        };
        let (data, attempts) = self
            .run_attempts(build, classify, cancel)
            .instrument(span)
            .await?;
        Ok(GraphqlResponse {
            data,
            attempts,
            request_id,
        })
    }

    /// Throttle, send, classify and recover until success or a terminal
    /// failure. Returns the success value and the attempt count.
    async fn run_attempts<R>(
        &self,
        build: impl Fn() -> TransportRequest,
        interpret: impl Fn(&TransportResponse, DateTime<Utc>) -> Outcome<R>,
        cancel: &Cancellation,
    ) -> Result<(R, u32), ClientError> {
        let mut attempts = 0u32;
        let mut failures: HashMap<ErrorCategory, u32> = HashMap::new();

        loop {
            self.throttle
                .acquire(cancel)
                .await
                .map_err(|_| ClientError::Cancelled { attempts })?;
            attempts += 1;
            self.record(|s| s.total += 1);
            debug!(attempt = attempts, "dispatching");

            let outcome = match cancel.run(self.transport.send(build())).await {
                Err(_) => return Err(ClientError::Cancelled { attempts }),
                Ok(Ok(response)) => interpret(&response, Utc::now()),
                Ok(Err(err)) => Outcome::Failure(Failure::from_transport(&err)),
            };

            let failure = match outcome {
                Outcome::Success(value) => {
                    self.record(|s| s.successful += 1);
                    info!(attempts, "request succeeded");
                    return Ok((value, attempts));
                }
                Outcome::Failure(failure) => failure,
            };

            self.record(|s| {
                s.failed += 1;
                if failure.category == ErrorCategory::RateLimited {
                    s.rate_limited += 1;
                }
            });
            let count = failures.entry(failure.category).or_insert(0);
            *count += 1;

            match self
                .config
                .policy
                .decide(failure.category, *count, failure.retry_after)
            {
                RecoveryAction::RetryAfter(delay) => {
                    warn!(
                        attempt = attempts,
                        category = %failure.category,
                        status = ?failure.status,
                        delay_ms = delay.as_millis() as u64,
                        "retrying after failure"
                    );
                    self.record(|s| s.retried += 1);
                    cancel
                        .sleep(delay)
                        .await
                        .map_err(|_| ClientError::Cancelled { attempts })?;
                }
                RecoveryAction::Reauthenticate | RecoveryAction::Surface => {
                    warn!(
                        attempts,
                        category = %failure.category,
                        status = ?failure.status,
                        detail = %failure.detail,
                        "request failed"
                    );
                    return Err(ClientError::Request {
                        category: failure.category,
                        attempts,
                        status: failure.status,
                        detail: failure.detail,
                    });
                }
            }
        }
    }

    /// Whether `url` belongs to the service: the origin's host, its parent
    /// domain or any subdomain of that parent.
    fn same_site(&self, url: &reqwest::Url) -> bool {
        let (Some(host), Ok(origin)) = (url.host_str(), reqwest::Url::parse(&self.config.origin))
        else {
            return false;
        };
        let Some(origin_host) = origin.host_str() else {
            return false;
        };
        let site = match origin_host.split_once('.') {
            Some((_, parent)) if parent.contains('.') => parent,
            _ => origin_host,
        };
        host.eq_ignore_ascii_case(site)
            || host
                .to_ascii_lowercase()
                .ends_with(&format!(".{}", site.to_ascii_lowercase()))
    }

    fn document_headers(&self, context: Option<&AuthContext>) -> Vec<(String, SecretString)> {
        let mut headers = self.headers(context);
        headers.retain(|(name, _)| {
            !name.eq_ignore_ascii_case("content-type")
                && !name.eq_ignore_ascii_case("accept")
                && !name.eq_ignore_ascii_case("origin")
        });
        headers.insert(
            0,
            (
                "Accept".into(),
                "text/html,application/xhtml+xml,*/*;q=0.8".into(),
            ),
        );
        headers
    }

    fn headers(&self, context: Option<&AuthContext>) -> Vec<(String, SecretString)> {
        let origin = self.config.origin.trim_end_matches('/');
        let mut headers: Vec<(String, SecretString)> = vec![
            ("Content-Type".into(), "application/json".into()),
            ("Accept".into(), "application/json".into()),
            ("Origin".into(), origin.into()),
            ("Referer".into(), format!("{origin}/").into()),
        ];
        let Some(context) = context else {
            return headers;
        };
        for (name, value) in context.headers() {
            let fixed = headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(name));
            if !fixed && !name.eq_ignore_ascii_case("cookie") {
                headers.push((name.clone(), value.clone()));
            }
        }
        headers.push(("User-Agent".into(), context.user_agent().into()));
        if !context.cookies().is_empty() {
            headers.push(("Cookie".into(), context.cookie_header()));
        }
        headers
    }
}

fn session_context<V, C>(session: &SessionAuthenticator<V, C>) -> Result<AuthContext, ClientError>
where
    V: CredentialVault,
    C: Clock,
{
    if !session.is_valid() {
        return Err(ClientError::NotAuthenticated {
            phase: session.status().phase,
        });
    }
    session.auth_context().map_err(|err| match err {
        AuthError::NotAuthenticated { phase } => ClientError::NotAuthenticated { phase },
        other => ClientError::Auth(other),
    })
}

fn expire_on_rejection<V, C, R>(
    session: &SessionAuthenticator<V, C>,
    context: &AuthContext,
    result: &Result<R, ClientError>,
) where
    V: CredentialVault,
    C: Clock,
{
    if matches!(result, Err(err) if err.category() == Some(ErrorCategory::AuthExpired)) {
        session.mark_expired(context.generation());
    }
}

fn invalid_url(url: &str, reason: String) -> ClientError {
    ClientError::Request {
        category: ErrorCategory::Fatal,
        attempts: 0,
        status: None,
        detail: format!("invalid document URL {}: {reason}", redacted_excerpt(url.as_bytes())),
    }
}

#[async_trait]
impl<T: Transport> SessionProbe for ResilientClient<T> {
    async fn probe(&self, context: &AuthContext, cancel: &Cancellation) -> ProbeOutcome {
        match self.execute_with(&feed::probe_request(), context, cancel).await {
            Ok(_) => ProbeOutcome::Accepted,
            Err(ClientError::Cancelled { .. }) => ProbeOutcome::Cancelled,
            Err(ClientError::Request {
                category, status, ..
            }) => {
                // Only an answer from the service can reject a session.
                if status.is_some() && !category.is_retryable() {
                    ProbeOutcome::Rejected { category, status }
                } else {
                    ProbeOutcome::Unreachable { category }
                }
            }
            Err(_) => ProbeOutcome::Unreachable {
                category: ErrorCategory::Fatal,
            },
        }
    }
}
