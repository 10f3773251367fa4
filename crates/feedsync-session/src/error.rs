use feedsync_core::{
    bundle::BundleError,
    error::{Cancelled, ErrorCategory},
    vault::VaultError,
};
use thiserror::Error;

use crate::authenticator::SessionPhase;

/// Errors surfaced by the session authenticator. Messages never include
/// the password or any secret value.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("not authenticated (session is {phase})")]
    NotAuthenticated { phase: SessionPhase },
    #[error("stored credentials could not be decrypted")]
    DecryptionFailed,
    #[error("no credentials stored")]
    NoCredentialsStored,
    #[error("strong encryption is unavailable and weak fallback is disabled")]
    EncryptionUnavailable,
    #[error("stored credentials are unusable: {0}")]
    InvalidBundle(BundleError),
    #[error("unsupported credential record version {0}")]
    UnsupportedVersion(u32),
    #[error("session probe could not reach the service ({category})")]
    ProbeUnreachable { category: ErrorCategory },
    #[error("credential storage failure: {reason}")]
    Storage { reason: String },
    #[error("operation cancelled")]
    Cancelled,
}

impl AuthError {
    /// What the user should do next.
    pub fn remediation(&self) -> &'static str {
        match self {
            AuthError::NotAuthenticated { phase: SessionPhase::Expired } => {
                "the session expired; authenticate again with the vault password"
            }
            AuthError::NotAuthenticated { .. } => "authenticate with the vault password first",
            AuthError::DecryptionFailed => {
                "check the vault password; if it is lost, clear the vault and re-import the browser session"
            }
            AuthError::NoCredentialsStored => {
                "export the session cookies from a logged-in browser and import them"
            }
            AuthError::EncryptionUnavailable => {
                "install a build with AES support or explicitly allow the weak fallback"
            }
            AuthError::InvalidBundle(_) | AuthError::UnsupportedVersion(_) => {
                "re-import the browser session"
            }
            AuthError::ProbeUnreachable { .. } => "check connectivity and retry later",
            AuthError::Storage { .. } => "check permissions of the credential directory",
            AuthError::Cancelled => "retry the operation",
        }
    }
}

impl From<VaultError> for AuthError {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::EncryptionUnavailable => AuthError::EncryptionUnavailable,
            VaultError::DecryptionFailed => AuthError::DecryptionFailed,
            VaultError::NoCredentialsStored { .. } => AuthError::NoCredentialsStored,
            VaultError::InvalidBundle(inner) => AuthError::InvalidBundle(inner),
            VaultError::UnsupportedVersion { found } => AuthError::UnsupportedVersion(found),
            VaultError::Storage { reason } => AuthError::Storage { reason },
        }
    }
}

impl From<Cancelled> for AuthError {
    fn from(_: Cancelled) -> Self {
        AuthError::Cancelled
    }
}
