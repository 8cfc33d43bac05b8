//! # ddp-live: Live data synchronization over WebSockets
//!
//! A client keeps a local replica of server collections in sync through
//! publications, and calls server methods with optional client-side stubs
//! whose effects are reconciled with the authoritative result.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐      WebSocket       ┌──────────────────┐
//! │ Connection       │ ◄──────────────────► │ SyncServer       │
//! │ (LiveDataClient) │     JSON frames      │ (Session per     │
//! └───────┬──────────┘                      │  socket)         │
//!         │                                 └───────┬──────────┘
//!         ▼                                         │
//! ┌──────────────────┐                      ┌───────┴──────────┐
//! │ Replica          │                      │ MergeBox         │
//! │ (ordered stores, │                      │ (per session)    │
//! │  observers)      │                      └───────┬──────────┘
//! └──────────────────┘                              │
//!                                           ┌───────┴──────────┐
//!                                           │ DocumentStore    │
//!                                           │ + ChangeFeed     │
//!                                           └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire messages and codec
//! - [`ejson`]: extended JSON values (dates, binary, custom types)
//! - [`stream`]: reconnecting transport with status and backoff
//! - [`heartbeat`]: application-level ping/pong liveness
//! - [`replica`]: ordered client-side collections with pause/resume diffs
//! - [`methods`]: outstanding calls, stubs and quiescence
//! - [`subscriptions`]: client subscription records and readiness
//! - [`client`]: the client core and its async [`Connection`] handle
//! - [`server`]: reference server with publications, methods and a merge box

pub mod client;
pub mod config;
pub mod ejson;
pub mod heartbeat;
pub mod methods;
pub mod protocol;
pub mod replica;
pub mod server;
pub mod stream;
pub mod subscriptions;

// Re-exports for convenience
pub use client::{ClientError, ClientEvent, Connection, LiveDataClient};
pub use config::{ClientConfig, ReconnectPolicy, ServerConfig, StreamConfig};
pub use ejson::{fields, FieldChanges, Fields, Value};
pub use methods::{CallOptions, MethodResult, MethodStub, StubContext};
pub use protocol::{ErrorCode, Message, MethodError, ProtocolError, SUPPORTED_VERSIONS};
pub use replica::{ChannelObserver, ObservedChange, ObserverId, Replica, ReplicaError, ReplicaObserver, ReplicaStore};
pub use server::{
    DocumentStore, MemoryStore, MethodContext, PublishContext, Query, ServerError, ServerStats, StoreChange,
    SyncServer,
};
pub use stream::{ConnectionStream, StatusSnapshot, StreamError, StreamStatus};
pub use subscriptions::{SubscriptionHandle, SubscriptionState};
