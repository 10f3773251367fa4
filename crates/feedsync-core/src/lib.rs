//! Core contracts for feedsync: secret handling, the credential bundle,
//! the vault contract, session context and the feed model.
//! Kept small so the vault, session and client crates share one vocabulary.

pub mod auth;
pub mod bundle;
pub mod cancel;
pub mod clock;
pub mod error;
pub mod feed;
pub mod secret;
pub mod vault;
