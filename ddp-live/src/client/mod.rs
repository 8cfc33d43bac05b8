//! Live data client.
//!
//! Provides:
//! - Session handshake with version negotiation and session resume
//! - Method calls with optional latency-compensating stubs
//! - Subscriptions with readiness tracking
//! - A local replica kept consistent across reconnects
//!
//! [`LiveDataClient`] is the synchronous core; [`Connection`] runs it on a
//! task over a [`ConnectionStream`](crate::stream::ConnectionStream).

mod connection;
mod livedata;

pub use connection::Connection;
pub use livedata::LiveDataClient;

use crate::protocol::MethodError;
use crate::stream::{StatusSnapshot, StreamError};

/// Errors surfaced to client callers.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClientError {
    #[error("connection closed")]
    Closed,
    #[error("method failed: {0}")]
    Method(#[from] MethodError),
    #[error("subscription stopped{}", .0.as_ref().map(|e| format!(": {e}")).unwrap_or_default())]
    SubscriptionStopped(Option<MethodError>),
}

/// Events emitted by the client, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Transport status changed
    Status(StatusSnapshot),
    /// Handshake completed
    Connected { session: String },
    /// A subscription's initial data set is in the replica
    SubscriptionReady(String),
    /// The server ended a subscription
    SubscriptionStopped { id: String, error: Option<MethodError> },
    /// A method has its result and its writes are visible
    MethodQuiesced(String),
    /// The server rejected one of our messages
    ServerError {
        reason: String,
        offending_message: Option<serde_json::Value>,
    },
    /// No common protocol version; the connection is closed for good
    VersionNegotiationFailed(String),
}

/// Requests from the core to whoever drives the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamDirective {
    /// Drop the transport and reconnect right away
    Reconnect,
    /// Treat the transport as dead and retry with backoff
    Lost(StreamError),
    /// Stop for good
    Fail(String),
}
