//! Authenticated, rate-limited GraphQL client for the feed service.
//!
//! Requests pass through a [`Throttle`], are classified into an
//! [`ErrorCategory`](feedsync_core::error::ErrorCategory) and recovered per
//! the [`RetryPolicy`]. [`FeedService`] is the surface callers use.

pub mod classify;
pub mod client;
pub mod error;
pub mod feed;
pub mod policy;
pub mod service;
pub mod throttle;
pub mod transport;

pub use client::{
    ClientConfig, Document, GraphqlRequest, GraphqlResponse, RequestStats, ResilientClient,
};
pub use error::ClientError;
pub use policy::{Backoff, RecoveryAction, RetryPolicy};
pub use service::{FeedService, ServiceStatus};
pub use throttle::Throttle;
pub use transport::{
    HttpTransport, Method, ScriptedTransport, Transport, TransportError, TransportRequest,
    TransportResponse,
};
