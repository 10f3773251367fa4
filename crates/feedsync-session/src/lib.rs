//! Session lifecycle on top of a credential vault.
//!
//! `Unauthenticated -> Authenticating -> Authenticated -> Expired -> Unauthenticated`.
//! Expiry is evaluated lazily whenever a caller asks for auth material;
//! there is no background timer.

mod authenticator;
mod error;

pub use authenticator::{SessionAuthenticator, SessionConfig, SessionPhase, SessionStatus};
pub use error::AuthError;
