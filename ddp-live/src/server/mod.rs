//! Reference server: sessions, publications and methods over a document store.
//!
//! Architecture:
//! ```text
//! Client A ──┐                     ┌── MergeBox (A) ── subs ──┐
//!            ├── endpoint ── Session                          ├── DocumentStore
//! Client B ──┘   (routing)         └── MergeBox (B) ── subs ──┘       │
//!                                          ▲                          │
//!                                          └──────── ChangeFeed ◄─────┘
//! ```
//!
//! Each session:
//! - negotiates a protocol version and keeps a heartbeat
//! - runs registered methods, then fences their writes before `updated`
//! - runs registered publications and streams matching documents through
//!   its merge box, so overlapping subscriptions share documents

pub mod endpoint;
pub mod feed;
pub mod merge_box;
pub mod session;
pub mod store;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;

use crate::config::ServerConfig;
use crate::ejson::Value;
use crate::protocol::{MethodError, ProtocolError};

pub use endpoint::{rewrite_path, route_request, Route};
pub use feed::{ChangeFeed, FeedStats};
pub use merge_box::{MergeBox, SessionCollectionView, SessionDocumentView};
pub use session::Session;
pub use store::{matches, DocumentStore, MemoryStore, Query, Selector, StoreChange, StoreError};

/// Server-side failures. None of these reach clients directly.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("{0}")]
    Protocol(#[from] ProtocolError),
    #[error("{0}")]
    Store(#[from] StoreError),
    #[error("document {collection}/{id} is not in the session view")]
    UnknownDocument { collection: String, id: String },
}

/// What a method handler can reach.
pub struct MethodContext<'a> {
    pub session_id: &'a str,
    pub store: &'a dyn DocumentStore,
    pub random_seed: Option<&'a Value>,
}

/// Server implementation of a method.
pub trait MethodHandler: Send + Sync {
    fn call(&self, ctx: &MethodContext<'_>, params: &[Value]) -> Result<Value, MethodError>;
}

impl<F> MethodHandler for F
where
    F: Fn(&MethodContext<'_>, &[Value]) -> Result<Value, MethodError> + Send + Sync,
{
    fn call(&self, ctx: &MethodContext<'_>, params: &[Value]) -> Result<Value, MethodError> {
        self(ctx, params)
    }
}

pub struct PublishContext<'a> {
    pub session_id: &'a str,
    pub store: &'a dyn DocumentStore,
}

/// Turns subscription params into the queries whose results the client
/// should see.
pub trait Publication: Send + Sync {
    fn publish(&self, ctx: &PublishContext<'_>, params: &[Value]) -> Result<Vec<Query>, MethodError>;
}

impl<F> Publication for F
where
    F: Fn(&PublishContext<'_>, &[Value]) -> Result<Vec<Query>, MethodError> + Send + Sync,
{
    fn publish(&self, ctx: &PublishContext<'_>, params: &[Value]) -> Result<Vec<Query>, MethodError> {
        self(ctx, params)
    }
}

/// Registered methods and publications.
#[derive(Clone, Default)]
pub struct Registry {
    methods: HashMap<String, Arc<dyn MethodHandler>>,
    publications: HashMap<String, Arc<dyn Publication>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method(&mut self, name: impl Into<String>, handler: impl MethodHandler + 'static) -> &mut Self {
        self.methods.insert(name.into(), Arc::new(handler));
        self
    }

    pub fn publish(&mut self, name: impl Into<String>, publication: impl Publication + 'static) -> &mut Self {
        self.publications.insert(name.into(), Arc::new(publication));
        self
    }

    pub fn get_method(&self, name: &str) -> Option<Arc<dyn MethodHandler>> {
        self.methods.get(name).cloned()
    }

    pub fn get_publication(&self, name: &str) -> Option<Arc<dyn Publication>> {
        self.publications.get(name).cloned()
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub methods_called: u64,
}

/// Lock-free counters behind [`ServerStats`].
#[derive(Default)]
pub(crate) struct Counters {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    methods_called: AtomicU64,
}

impl Counters {
    pub(crate) fn message(&self) {
        self.total_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn method(&self) {
        self.methods_called.fetch_add(1, Ordering::Relaxed);
    }

    fn opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    fn closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ServerStats {
        ServerStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            total_messages: self.total_messages.load(Ordering::Relaxed),
            methods_called: self.methods_called.load(Ordering::Relaxed),
        }
    }
}

/// State every session shares.
pub struct Shared {
    pub config: ServerConfig,
    pub store: Arc<dyn DocumentStore>,
    pub registry: Registry,
    pub(crate) counters: Counters,
}

impl Shared {
    pub fn new(config: ServerConfig, store: Arc<dyn DocumentStore>, registry: Registry) -> Self {
        Self {
            config,
            store,
            registry,
            counters: Counters::default(),
        }
    }
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    store: Arc<dyn DocumentStore>,
    registry: Registry,
    shared: Option<Arc<Shared>>,
}

impl SyncServer {
    pub fn new(config: ServerConfig, store: Arc<dyn DocumentStore>) -> Self {
        Self {
            config,
            store,
            registry: Registry::new(),
            shared: None,
        }
    }

    /// Create with default configuration over an in-memory store.
    pub fn with_defaults() -> Self {
        let config = ServerConfig::default();
        let store = Arc::new(MemoryStore::new(config.broadcast_capacity));
        Self::new(config, store)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn DocumentStore> {
        self.store.clone()
    }

    /// Register a method. Takes effect for servers started afterwards.
    pub fn method(&mut self, name: impl Into<String>, handler: impl MethodHandler + 'static) -> &mut Self {
        self.registry.method(name, handler);
        self.shared = None;
        self
    }

    /// Register a publication. Takes effect for servers started afterwards.
    pub fn publish(&mut self, name: impl Into<String>, publication: impl Publication + 'static) -> &mut Self {
        self.registry.publish(name, publication);
        self.shared = None;
        self
    }

    pub fn stats(&self) -> ServerStats {
        self.shared
            .as_ref()
            .map(|shared| shared.counters.snapshot())
            .unwrap_or_default()
    }

    fn shared(&mut self) -> Arc<Shared> {
        self.shared
            .get_or_insert_with(|| {
                Arc::new(Shared::new(
                    self.config.clone(),
                    self.store.clone(),
                    self.registry.clone(),
                ))
            })
            .clone()
    }

    /// Bind `config.bind_addr` and serve until the listener fails.
    pub async fn run(&mut self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve sockets accepted on `listener`.
    pub async fn serve(&mut self, listener: TcpListener) -> Result<(), ServerError> {
        let shared = self.shared();
        log::info!(
            "Sync server listening on {} (prefix {})",
            listener.local_addr()?,
            shared.config.path_prefix
        );

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");
            let shared = shared.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, shared).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, shared: Arc<Shared>) -> Result<(), ServerError> {
    let prefix = shared.config.path_prefix.clone();
    let callback = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let path = request.uri().path_and_query().map(|p| p.as_str()).unwrap_or("/");
        match route_request(path, &prefix) {
            Route::Socket(rewritten) => {
                log::debug!("Accepting socket on {rewritten}");
                Ok(response)
            }
            Route::NotFound => {
                log::info!("No socket endpoint at {path}");
                let mut rejection = ErrorResponse::new(Some("Not found".to_string()));
                *rejection.status_mut() = StatusCode::NOT_FOUND;
                Err(rejection)
            }
        }
    };

    let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            log::debug!("Handshake with {addr} failed: {e}");
            return Ok(());
        }
    };

    log::info!("WebSocket connection established from {addr}");
    shared.counters.opened();
    let result = session::run_session(ws, shared.clone()).await;
    shared.counters.closed();
    log::info!("Connection from {addr} closed");
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lookup() {
        let mut registry = Registry::new();
        registry
            .method("echo", |_: &MethodContext<'_>, params: &[Value]| -> Result<Value, MethodError> {
                Ok(params.first().cloned().unwrap_or(Value::Null))
            })
            .publish("all", |_: &PublishContext<'_>, _: &[Value]| -> Result<Vec<Query>, MethodError> {
                Ok(vec![Query::new("items")])
            });

        let store = MemoryStore::default();
        let ctx = MethodContext {
            session_id: "s",
            store: &store,
            random_seed: None,
        };
        let echo = registry.get_method("echo").unwrap();
        assert_eq!(echo.call(&ctx, &[Value::from(5)]), Ok(Value::from(5)));
        assert!(registry.get_method("missing").is_none());
        assert!(registry.get_publication("all").is_some());
    }

    #[test]
    fn test_stats_start_empty() {
        let server = SyncServer::with_defaults();
        assert_eq!(server.stats(), ServerStats::default());
    }
}
