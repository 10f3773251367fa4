use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure categories for outbound API calls.
///
/// Every non-success outcome of a request is classified into exactly one
/// category; the recovery policy is keyed on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// HTTP 429 or a payload rate-limit code.
    RateLimited,
    /// HTTP 401/403 or a payload authentication code.
    AuthExpired,
    /// Timeouts, 5xx and dropped connections.
    Transient,
    /// The response could not be parsed or had an unexpected shape.
    Malformed,
    /// Any other client error; retrying cannot help.
    Fatal,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::RateLimited => "rate_limited",
            ErrorCategory::AuthExpired => "auth_expired",
            ErrorCategory::Transient => "transient",
            ErrorCategory::Malformed => "malformed",
            ErrorCategory::Fatal => "fatal",
        }
    }

    /// Whether the client retries this category on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCategory::RateLimited | ErrorCategory::Transient)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A wait was aborted by the caller's cancellation signal or deadline.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("operation cancelled")]
pub struct Cancelled;
