use feedsync_core::error::ErrorCategory;
use feedsync_session::{AuthError, SessionPhase};
use thiserror::Error;

/// Terminal failure of a client call. Retries have already been applied;
/// callers must not retry `Request` failures further.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("{category} failure after {attempts} attempt(s): {detail}")]
    Request {
        category: ErrorCategory,
        attempts: u32,
        status: Option<u16>,
        detail: String,
    },
    #[error("not authenticated (session is {phase})")]
    NotAuthenticated { phase: SessionPhase },
    #[error("cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },
    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl ClientError {
    /// Category of the last failed attempt, for request failures.
    pub fn category(&self) -> Option<ErrorCategory> {
        match self {
            ClientError::Request { category, .. } => Some(*category),
            _ => None,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            ClientError::Request { attempts, .. } | ClientError::Cancelled { attempts } => {
                *attempts
            }
            ClientError::NotAuthenticated { .. } | ClientError::Auth(_) => 0,
        }
    }

    /// The caller should authenticate again before retrying.
    pub fn needs_reauthentication(&self) -> bool {
        matches!(
            self,
            ClientError::NotAuthenticated { .. }
                | ClientError::Request {
                    category: ErrorCategory::AuthExpired,
                    ..
                }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_failure_reports_category_and_attempts() {
        let err = ClientError::Request {
            category: ErrorCategory::Transient,
            attempts: 3,
            status: Some(503),
            detail: "HTTP 503".into(),
        };
        assert_eq!(err.category(), Some(ErrorCategory::Transient));
        assert_eq!(err.attempts(), 3);
        assert_eq!(err.to_string(), "transient failure after 3 attempt(s): HTTP 503");
        assert!(!err.needs_reauthentication());
    }

    #[test]
    fn auth_failures_ask_for_reauthentication() {
        let expired = ClientError::Request {
            category: ErrorCategory::AuthExpired,
            attempts: 1,
            status: Some(401),
            detail: "HTTP 401".into(),
        };
        assert!(expired.needs_reauthentication());
        assert!(ClientError::NotAuthenticated {
            phase: SessionPhase::Expired
        }
        .needs_reauthentication());
    }
}
