//! One client session on the server.
//!
//! `Session` is sans-IO: it consumes decoded frames, store changes and
//! timer ticks, and queues outbound messages. [`run_session`] drives it
//! over a WebSocket.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use indexmap::IndexMap;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use super::store::{DocumentStore, Query, StoreChange, StoreError};
use super::{MergeBox, MethodContext, PublishContext, ServerError, Shared};
use crate::ejson::{Fields, Value};
use crate::heartbeat::{Heartbeat, HeartbeatAction};
use crate::protocol::{Message, MethodError};
use crate::replica::make_changed_fields;
use crate::stream::sleep_until_opt;

type DocKey = (String, String);

struct ServerSubscription {
    name: String,
    queries: Vec<Query>,
    /// Documents this subscription currently publishes
    documents: BTreeSet<DocKey>,
}

impl ServerSubscription {
    /// What this subscription publishes of `doc`, or `None` when no query
    /// matches it.
    fn project(&self, collection: &str, doc: &Fields) -> Option<Fields> {
        let mut matched = false;
        let mut projected = Fields::new();
        for query in self.queries.iter().filter(|q| q.collection == collection) {
            if query.matches(doc) {
                matched = true;
                projected.extend(query.project(doc));
            }
        }
        matched.then_some(projected)
    }
}

/// Union of every query's results, keyed by document.
fn query_results(store: &dyn DocumentStore, queries: &[Query]) -> Result<IndexMap<DocKey, Fields>, StoreError> {
    let mut results: IndexMap<DocKey, Fields> = IndexMap::new();
    for query in queries {
        for (id, doc) in store.find(&query.collection, &query.selector)? {
            results
                .entry((query.collection.clone(), id))
                .or_default()
                .extend(query.project(&doc));
        }
    }
    Ok(results)
}

pub struct Session {
    id: String,
    shared: Arc<Shared>,
    feed: broadcast::Receiver<Arc<StoreChange>>,
    feed_open: bool,
    version: Option<String>,
    heartbeat: Option<Heartbeat>,
    subs: IndexMap<String, ServerSubscription>,
    merge_box: MergeBox,
    outbox: Vec<Message>,
    closing: bool,
}

impl Session {
    pub fn new(shared: Arc<Shared>) -> Self {
        let feed = shared.store.subscribe();
        Self {
            id: Uuid::new_v4().simple().to_string(),
            shared,
            feed,
            feed_open: true,
            version: None,
            heartbeat: None,
            subs: IndexMap::new(),
            merge_box: MergeBox::new(),
            outbox: Vec::new(),
            closing: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn is_connected(&self) -> bool {
        self.version.is_some()
    }

    /// The session should be torn down once its outbox is flushed.
    pub fn should_close(&self) -> bool {
        self.closing
    }

    pub fn merge_box(&self) -> &MergeBox {
        &self.merge_box
    }

    pub fn take_outbox(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.outbox)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.heartbeat.as_ref().map(Heartbeat::next_deadline)
    }

    pub fn on_timer(&mut self, now: Instant) {
        let Some(heartbeat) = self.heartbeat.as_mut() else {
            return;
        };
        match heartbeat.poll(now) {
            HeartbeatAction::SendPing => self.outbox.push(Message::Ping { id: None }),
            HeartbeatAction::TimedOut => {
                log::info!("Session {} missed its heartbeat, closing", self.id);
                self.closing = true;
            }
            HeartbeatAction::Idle => {}
        }
    }

    /// Handle one inbound text frame.
    pub fn on_text(&mut self, text: &str, now: Instant) {
        if let Some(heartbeat) = self.heartbeat.as_mut() {
            heartbeat.message_received(now);
        }
        let offending = match serde_json::from_str::<serde_json::Value>(text) {
            Ok(json) => json,
            Err(e) => {
                log::warn!("Session {}: discarding unparseable frame: {e}", self.id);
                self.send_error("Parse error", None);
                return;
            }
        };
        match Message::decode(text) {
            Ok(msg) => self.handle(msg, offending, now),
            Err(e) => {
                log::warn!("Session {}: bad request: {e}", self.id);
                self.send_error("Bad request", Some(offending));
            }
        }
    }

    fn handle(&mut self, msg: Message, offending: serde_json::Value, now: Instant) {
        if !self.is_connected() {
            match msg {
                Message::Connect { version, support, .. } => self.on_connect(version, support, now),
                _ => self.send_error("Must connect first", Some(offending)),
            }
            return;
        }

        match msg {
            Message::Connect { .. } => self.send_error("Already connected", Some(offending)),
            Message::Ping { id } => self.outbox.push(Message::Pong { id }),
            Message::Pong { .. } => {}
            Message::Method {
                method,
                params,
                id,
                random_seed,
            } => self.on_method(&method, &params, id, random_seed.as_ref()),
            Message::Sub { id, name, params } => self.on_sub(id, name, &params),
            Message::Unsub { id } => self.on_unsub(id),
            other => {
                log::debug!("Session {}: unexpected {} from client", self.id, other.kind());
                self.send_error("Bad request", Some(offending));
            }
        }
    }

    fn send_error(&mut self, reason: &str, offending_message: Option<serde_json::Value>) {
        self.outbox.push(Message::Error {
            reason: reason.to_string(),
            offending_message,
        });
    }

    fn on_connect(&mut self, version: String, support: Vec<String>, now: Instant) {
        let server_versions = &self.shared.config.supported_versions;
        let agreed = support.iter().find(|v| server_versions.contains(v)).cloned();

        let offered_ok = support.contains(&version);
        match agreed {
            Some(agreed) if offered_ok && agreed == version => {}
            other => {
                let suggestion = other
                    .filter(|_| offered_ok)
                    .or_else(|| server_versions.first().cloned());
                log::info!(
                    "Session {}: rejecting version {version}, suggesting {suggestion:?}",
                    self.id
                );
                self.outbox.push(Message::Failed { version: suggestion });
                self.closing = true;
                return;
            }
        }

        let config = &self.shared.config;
        if version != "pre1" && config.heartbeat_interval_ms > 0 {
            self.heartbeat = Some(Heartbeat::new(config.heartbeat_interval(), config.heartbeat_timeout(), now));
        }
        log::debug!("Session {} connected with version {version}", self.id);
        self.version = Some(version);
        self.outbox.push(Message::Connected {
            session: self.id.clone(),
        });
    }

    fn on_method(&mut self, name: &str, params: &[Value], id: String, random_seed: Option<&Value>) {
        self.shared.counters.method();
        let shared = self.shared.clone();
        let outcome = match shared.registry.get_method(name) {
            Some(handler) => {
                let ctx = MethodContext {
                    session_id: &self.id,
                    store: shared.store.as_ref(),
                    random_seed,
                };
                handler.call(&ctx, params)
            }
            None => Err(MethodError::new(404, format!("Method '{name}' not found"))),
        };

        // Every write the method made is already on the feed; publish it
        // before `updated` so the client sees its effects.
        self.drain_feed();

        let (result, error) = match outcome {
            Ok(value) => (Some(value), None),
            Err(e) => {
                log::debug!("Session {}: method {name} failed: {e}", self.id);
                (None, Some(e))
            }
        };
        self.outbox.push(Message::Result {
            id: id.clone(),
            result,
            error,
        });
        self.outbox.push(Message::Updated { methods: vec![id] });
    }

    fn on_sub(&mut self, id: String, name: String, params: &[Value]) {
        if self.subs.contains_key(&id) {
            log::debug!("Session {}: duplicate sub {id} ignored", self.id);
            return;
        }
        // The initial query sees the store as it is now; changes older than
        // that must not reach the new subscription afterwards.
        self.drain_feed();
        let shared = self.shared.clone();
        let Some(publication) = shared.registry.get_publication(&name) else {
            self.outbox.push(Message::Nosub {
                id,
                error: Some(MethodError::new(404, format!("Subscription '{name}' not found"))),
            });
            return;
        };

        let ctx = PublishContext {
            session_id: &self.id,
            store: shared.store.as_ref(),
        };
        let published = publication
            .publish(&ctx, params)
            .and_then(|queries| Ok((query_results(shared.store.as_ref(), &queries)?, queries)));
        let (initial, queries) = match published {
            Ok(published) => published,
            Err(error) => {
                log::debug!("Session {}: publication {name} failed: {error}", self.id);
                self.outbox.push(Message::Nosub { id, error: Some(error) });
                return;
            }
        };

        self.subs.insert(
            id.clone(),
            ServerSubscription {
                name,
                queries,
                documents: BTreeSet::new(),
            },
        );
        for ((collection, doc_id), fields) in initial {
            self.reconcile(&id, &collection, &doc_id, Some(fields));
        }
        self.outbox.push(Message::Ready { subs: vec![id] });
    }

    fn on_unsub(&mut self, id: String) {
        if let Some(sub) = self.subs.get(&id) {
            log::debug!("Session {}: stopping {} ({id})", self.id, sub.name);
            let documents: Vec<DocKey> = sub.documents.iter().cloned().collect();
            for (collection, doc_id) in documents {
                self.reconcile(&id, &collection, &doc_id, None);
            }
            self.subs.shift_remove(&id);
        }
        self.outbox.push(Message::Nosub { id, error: None });
    }

    /// Bring one subscription's view of one document to `target`.
    fn reconcile(&mut self, sub_id: &str, collection: &str, id: &str, target: Option<Fields>) {
        let Some(sub) = self.subs.get_mut(sub_id) else {
            return;
        };
        let key = (collection.to_string(), id.to_string());
        let published = sub.documents.contains(&key);
        let result = match (published, target) {
            (false, Some(fields)) => {
                sub.documents.insert(key);
                self.merge_box.added(sub_id, collection, id, fields, &mut self.outbox);
                Ok(())
            }
            (true, Some(fields)) => {
                let current = self
                    .merge_box
                    .document(collection, id)
                    .map(|view| view.fields_of(sub_id))
                    .unwrap_or_default();
                let changes = make_changed_fields(&fields, &current);
                if changes.is_empty() {
                    Ok(())
                } else {
                    self.merge_box.changed(sub_id, collection, id, &changes, &mut self.outbox)
                }
            }
            (true, None) => {
                sub.documents.remove(&key);
                self.merge_box.removed(sub_id, collection, id, &mut self.outbox)
            }
            (false, None) => Ok(()),
        };
        if let Err(e) = result {
            log::error!("Session {}: {e}", self.id);
        }
    }

    /// Route one committed store change to every subscription.
    pub fn apply_change(&mut self, change: &StoreChange) {
        let collection = change.collection();
        let id = change.id();
        let sub_ids: Vec<String> = self.subs.keys().cloned().collect();
        for sub_id in sub_ids {
            let target = match change {
                StoreChange::Removed { .. } => None,
                StoreChange::Added { fields, .. } | StoreChange::Changed { fields, .. } => {
                    self.subs.get(&sub_id).and_then(|sub| sub.project(collection, fields))
                }
            };
            self.reconcile(&sub_id, collection, id, target);
        }
    }

    /// Rebuild every subscription from a fresh query after missed changes.
    pub fn resync(&mut self) {
        let shared = self.shared.clone();
        let sub_ids: Vec<String> = self.subs.keys().cloned().collect();
        for sub_id in sub_ids {
            let Some(sub) = self.subs.get(&sub_id) else {
                continue;
            };
            let results = match query_results(shared.store.as_ref(), &sub.queries) {
                Ok(results) => results,
                Err(e) => {
                    log::error!("Session {}: resync of {sub_id} failed: {e}", self.id);
                    continue;
                }
            };
            let stale: Vec<DocKey> = sub
                .documents
                .iter()
                .filter(|key| !results.contains_key(*key))
                .cloned()
                .collect();
            for (collection, id) in stale {
                self.reconcile(&sub_id, &collection, &id, None);
            }
            for ((collection, id), fields) in results {
                self.reconcile(&sub_id, &collection, &id, Some(fields));
            }
        }
    }

    /// Process every change already waiting on the feed.
    pub fn drain_feed(&mut self) {
        loop {
            match self.feed.try_recv() {
                Ok(change) => self.apply_change(&change),
                Err(TryRecvError::Lagged(missed)) => {
                    log::warn!("Session {} missed {missed} store changes, resyncing", self.id);
                    self.resync();
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Closed) => {
                    self.feed_open = false;
                    break;
                }
            }
        }
    }

    async fn next_change(&mut self) -> Result<Arc<StoreChange>, RecvError> {
        self.feed.recv().await
    }

    fn on_feed(&mut self, change: Result<Arc<StoreChange>, RecvError>) {
        match change {
            Ok(change) => self.apply_change(&change),
            Err(RecvError::Lagged(missed)) => {
                log::warn!("Session {} missed {missed} store changes, resyncing", self.id);
                self.resync();
            }
            Err(RecvError::Closed) => {
                log::debug!("Session {}: store feed closed", self.id);
                self.feed_open = false;
            }
        }
    }
}

/// Drive a session over an accepted WebSocket until either side closes.
pub async fn run_session(ws: WebSocketStream<TcpStream>, shared: Arc<Shared>) -> Result<(), ServerError> {
    let (mut sink, mut source) = ws.split();
    let mut session = Session::new(shared.clone());

    loop {
        let deadline = session.next_deadline();
        let feed_open = session.feed_open;
        tokio::select! {
            frame = source.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    shared.counters.message();
                    log::trace!("recv {}", text.as_str());
                    session.on_text(text.as_str(), Instant::now());
                }
                Some(Ok(WsMessage::Ping(data))) => sink.send(WsMessage::Pong(data)).await?,
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::debug!("Session {} transport error: {e}", session.id());
                    break;
                }
            },
            change = session.next_change(), if feed_open => session.on_feed(change),
            _ = sleep_until_opt(deadline) => session.on_timer(Instant::now()),
        }

        for msg in session.take_outbox() {
            let text = msg.encode()?;
            log::trace!("send {text}");
            sink.send(WsMessage::Text(text.into())).await?;
        }
        if session.should_close() {
            let _ = sink.close().await;
            break;
        }
    }
    log::debug!("Session {} ended", session.id());
    Ok(())
}
