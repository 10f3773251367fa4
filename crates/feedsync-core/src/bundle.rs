use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::secret::SecretString;

/// User-Agent assumed when a browser export does not carry one.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Site the session cookies were captured from.
pub const DEFAULT_ORIGIN: &str = "https://app.daily.dev";

/// Reasons a bundle is unusable as session material.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BundleError {
    #[error("bundle carries no session cookies")]
    NoCookies,
    #[error("invalid cookie name: {0:?}")]
    InvalidCookieName(String),
    #[error("cookie {0:?} has a value that cannot be sent over HTTP")]
    InvalidCookieValue(String),
    #[error("invalid header name: {0:?}")]
    InvalidHeaderName(String),
    #[error("header {0:?} has a value that cannot be sent over HTTP")]
    InvalidHeaderValue(String),
    #[error("user agent cannot be sent over HTTP")]
    InvalidUserAgent,
}

/// Opaque session secrets exported from a logged-in browser.
///
/// The bundle only ever exists in memory; the vault persists its encrypted
/// form. Dropping it wipes every secret value.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialBundle {
    /// Named session cookies (session token, auth token, user id, ...).
    pub cookies: BTreeMap<String, SecretString>,
    /// Extra request headers captured alongside the cookies.
    #[serde(default)]
    pub headers: BTreeMap<String, SecretString>,
    /// Client identity the secrets were captured with.
    pub user_agent: String,
    pub captured_at: DateTime<Utc>,
}

impl CredentialBundle {
    /// Bundle with the given cookies, default user agent and no extra headers.
    pub fn new<K, V>(cookies: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<SecretString>,
    {
        Self {
            cookies: cookies
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            headers: BTreeMap::new(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            captured_at: Utc::now(),
        }
    }

    /// Build a bundle from a manual browser export.
    ///
    /// A `User-Agent` entry in `headers` becomes the bundle's client identity;
    /// missing browser headers are filled with the values a desktop browser
    /// would have sent to the feed site.
    pub fn from_browser_export(
        cookies: BTreeMap<String, String>,
        headers: BTreeMap<String, String>,
    ) -> Self {
        let mut user_agent = DEFAULT_USER_AGENT.to_string();
        let mut kept = BTreeMap::new();
        for (name, value) in headers {
            if name.eq_ignore_ascii_case("user-agent") {
                user_agent = value;
            } else {
                kept.insert(name, SecretString::from(value));
            }
        }

        let defaults = [
            ("Accept", "application/json, text/plain, */*".to_string()),
            ("Accept-Language", "en-US,en;q=0.9".to_string()),
            ("Referer", format!("{DEFAULT_ORIGIN}/")),
        ];
        for (name, value) in defaults {
            let present = kept.keys().any(|k| k.eq_ignore_ascii_case(name));
            if !present {
                kept.insert(name.to_string(), SecretString::from(value));
            }
        }

        Self {
            cookies: cookies
                .into_iter()
                .map(|(k, v)| (k, SecretString::from(v)))
                .collect(),
            headers: kept,
            user_agent,
            captured_at: Utc::now(),
        }
    }

    /// Check that the bundle can be turned into HTTP session material.
    pub fn validate(&self) -> Result<(), BundleError> {
        if self.cookies.is_empty() {
            return Err(BundleError::NoCookies);
        }
        for (name, value) in &self.cookies {
            if !is_token(name) {
                return Err(BundleError::InvalidCookieName(name.clone()));
            }
            if !value.expose().bytes().all(is_cookie_octet) {
                return Err(BundleError::InvalidCookieValue(name.clone()));
            }
        }
        for (name, value) in &self.headers {
            if !is_token(name) {
                return Err(BundleError::InvalidHeaderName(name.clone()));
            }
            if !is_header_value(value.expose()) {
                return Err(BundleError::InvalidHeaderValue(name.clone()));
            }
        }
        if !is_header_value(&self.user_agent) {
            return Err(BundleError::InvalidUserAgent);
        }
        Ok(())
    }
}

impl fmt::Debug for CredentialBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialBundle")
            .field("cookies", &self.cookies.keys().collect::<Vec<_>>())
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .field("user_agent", &self.user_agent)
            .field("captured_at", &self.captured_at)
            .finish()
    }
}

// RFC 7230 tchar.
fn is_token(s: &str) -> bool {
    !s.is_empty()
        && s.bytes().all(|b| {
            b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
        })
}

// RFC 6265 cookie-octet, relaxed to allow the spaces some sites emit.
fn is_cookie_octet(b: u8) -> bool {
    (b.is_ascii_graphic() && b != b';' && b != b'"' && b != b'\\') || b == b' '
}

fn is_header_value(s: &str) -> bool {
    s.bytes().all(|b| b == b'\t' || (b >= 0x20 && b != 0x7f))
}
