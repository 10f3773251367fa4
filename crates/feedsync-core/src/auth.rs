use std::{collections::BTreeMap, fmt};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    bundle::CredentialBundle, cancel::Cancellation, error::ErrorCategory, secret::SecretString,
};

/// Snapshot of the headers and cookies of one authenticated session.
///
/// Contexts are handed out by value; `generation` identifies the
/// authentication that produced them so stale rejections can be ignored.
#[derive(Clone)]
pub struct AuthContext {
    headers: BTreeMap<String, SecretString>,
    cookies: BTreeMap<String, SecretString>,
    user_agent: String,
    valid_until: DateTime<Utc>,
    generation: u64,
}

impl AuthContext {
    pub fn from_bundle(bundle: &CredentialBundle, valid_until: DateTime<Utc>, generation: u64) -> Self {
        Self {
            headers: bundle.headers.clone(),
            cookies: bundle.cookies.clone(),
            user_agent: bundle.user_agent.clone(),
            valid_until,
            generation,
        }
    }

    pub fn headers(&self) -> &BTreeMap<String, SecretString> {
        &self.headers
    }

    pub fn cookies(&self) -> &BTreeMap<String, SecretString> {
        &self.cookies
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn valid_until(&self) -> DateTime<Utc> {
        self.valid_until
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// All cookies folded into a single `Cookie` header value.
    pub fn cookie_header(&self) -> SecretString {
        let joined = self
            .cookies
            .iter()
            .map(|(name, value)| format!("{name}={}", value.expose()))
            .collect::<Vec<_>>()
            .join("; ");
        SecretString::from(joined)
    }
}

impl fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthContext")
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .field("cookies", &self.cookies.keys().collect::<Vec<_>>())
            .field("valid_until", &self.valid_until)
            .field("generation", &self.generation)
            .finish()
    }
}

/// What the remote service said about a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The service answered successfully with the captured tokens.
    Accepted,
    /// The service answered, but not with success.
    Rejected {
        category: ErrorCategory,
        status: Option<u16>,
    },
    /// No answer was obtained (network failure, retries exhausted).
    Unreachable { category: ErrorCategory },
    Cancelled,
}

/// Issues one lightweight authenticated request to confirm a session.
#[async_trait]
pub trait SessionProbe: Send + Sync {
    async fn probe(&self, context: &AuthContext, cancel: &Cancellation) -> ProbeOutcome;
}
