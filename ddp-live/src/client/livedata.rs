//! Synchronous client core.
//!
//! Owns the replica, method and subscription bookkeeping and turns inbound
//! messages into replica writes, outbound messages, events and stream
//! directives. Time is passed in explicitly; the caller drives timers via
//! [`LiveDataClient::next_deadline`] and [`LiveDataClient::on_timer`].
//!
//! After a reconnect the replica is not touched until every subscription
//! that was ready before and every method sent without a result has caught
//! up. Data received in between is held back and applied as one batch, so
//! observers only see the net difference between the old and new session.

use std::collections::HashSet;
use std::mem;

use log::{debug, error, info, warn};
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::{ClientEvent, StreamDirective};
use crate::config::ClientConfig;
use crate::ejson::{FieldChanges, Fields, Value};
use crate::heartbeat::{Heartbeat, HeartbeatAction};
use crate::methods::{AfterFlush, CallOptions, MethodManager, MethodResult, MethodStub};
use crate::protocol::{Message, MethodError};
use crate::replica::{apply_changes, DataUpdate, ObserverId, Replica, ReplicaObserver};
use crate::stream::StreamError;
use crate::subscriptions::{SubscriptionHandle, SubscriptionManager};

pub struct LiveDataClient {
    config: ClientConfig,
    replica: Replica,
    methods: MethodManager,
    subs: SubscriptionManager,
    heartbeat: Option<Heartbeat>,

    /// Version agreed in the last handshake
    version: Option<String>,
    /// Version to offer on the next connect
    version_suggestion: Option<String>,
    last_session_id: Option<String>,
    /// Replace the replica wholesale on the next flush
    reset_stores: bool,

    subs_being_revived: HashSet<String>,
    methods_blocking_quiescence: HashSet<String>,
    buffered_until_quiescence: Vec<Message>,

    buffered_writes: Vec<(String, DataUpdate)>,
    flush_at: Option<Instant>,
    flush_max_at: Option<Instant>,
    after_update: Vec<AfterFlush>,

    outbox: Vec<Message>,
    events: Vec<ClientEvent>,
    directives: Vec<StreamDirective>,
    closed: bool,
}

impl LiveDataClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            replica: Replica::new(),
            methods: MethodManager::new(),
            subs: SubscriptionManager::new(),
            heartbeat: None,
            version: None,
            version_suggestion: None,
            last_session_id: None,
            reset_stores: false,
            subs_being_revived: HashSet::new(),
            methods_blocking_quiescence: HashSet::new(),
            buffered_until_quiescence: Vec::new(),
            buffered_writes: Vec::new(),
            flush_at: None,
            flush_max_at: None,
            after_update: Vec::new(),
            outbox: Vec::new(),
            events: Vec::new(),
            directives: Vec::new(),
            closed: false,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.last_session_id.as_deref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_waiting_for_quiescence(&self) -> bool {
        !self.subs_being_revived.is_empty() || !self.methods_blocking_quiescence.is_empty()
    }

    pub fn outstanding_methods(&self) -> usize {
        self.methods.outstanding()
    }

    pub fn subscription_count(&self) -> usize {
        self.subs.len()
    }

    // ─── Caller operations ──────────────────────────────────────

    pub fn register_stub(&mut self, name: impl Into<String>, stub: Box<dyn MethodStub>) {
        self.methods.register_stub(name, stub);
    }

    /// Invoke a method. `reply` receives the result. Returns the method id,
    /// or `None` when the client is closed.
    pub fn call(
        &mut self,
        name: &str,
        params: Vec<Value>,
        options: CallOptions,
        reply: oneshot::Sender<MethodResult>,
    ) -> Option<String> {
        if self.closed {
            let _ = reply.send(Err(MethodError::disconnected()));
            return None;
        }
        // Stubs must see every server write received so far.
        if self.methods.has_stub(name) && !self.is_waiting_for_quiescence() {
            self.flush_buffered_writes();
        }
        let id = self
            .methods
            .call(name, params, options, reply, &mut self.replica, &mut self.outbox);
        Some(id)
    }

    pub fn subscribe(&mut self, name: &str, params: Vec<Value>) -> SubscriptionHandle {
        self.subs.subscribe(name, params, &mut self.outbox)
    }

    pub fn unsubscribe(&mut self, id: &str) -> bool {
        self.subs.unsubscribe(id, &mut self.outbox)
    }

    pub fn observe(&mut self, collection: &str, observer: Box<dyn ReplicaObserver>) -> ObserverId {
        self.replica.observe(collection, observer)
    }

    pub fn unobserve(&mut self, collection: &str, id: ObserverId) -> bool {
        self.replica.collection_mut(collection).unobserve(id)
    }

    /// Fail everything outstanding. Terminal.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.heartbeat = None;
        self.methods.close();
        self.subs.close();
        self.buffered_writes.clear();
        self.buffered_until_quiescence.clear();
        self.flush_at = None;
        self.flush_max_at = None;
    }

    // ─── Transport callbacks ────────────────────────────────────

    /// A fresh transport is open: handshake and resend everything live.
    /// Anything still queued was meant for the old transport and is
    /// regenerated below, so `connect` is always the first frame.
    pub fn on_reset(&mut self) {
        if self.closed {
            return;
        }
        self.outbox.clear();
        let version = self
            .version_suggestion
            .clone()
            .or_else(|| self.config.supported_versions.first().cloned())
            .unwrap_or_else(|| "1".to_string());
        self.version_suggestion = Some(version.clone());
        self.outbox.push(Message::Connect {
            version,
            support: self.config.supported_versions.clone(),
            session: self.last_session_id.clone(),
        });

        self.methods.on_reset(&mut self.outbox);
        for id in self.subs.on_reset(&mut self.outbox) {
            self.events.push(ClientEvent::SubscriptionStopped { id, error: None });
        }
        self.collect_quiesced();
    }

    pub fn on_disconnect(&mut self, error: Option<&StreamError>) {
        if let Some(e) = error {
            debug!("Transport lost: {e}");
        }
        self.heartbeat = None;
    }

    /// Decode and handle one inbound frame. Undecodable frames are dropped.
    pub fn on_message(&mut self, text: &str, now: Instant) {
        match Message::decode(text) {
            Ok(msg) => self.handle(msg, now),
            Err(e) => warn!("Discarding invalid message {text}: {e}"),
        }
    }

    pub fn handle(&mut self, msg: Message, now: Instant) {
        if self.closed {
            return;
        }
        if let Some(heartbeat) = self.heartbeat.as_mut() {
            heartbeat.message_received(now);
        }

        match msg {
            Message::Connected { session } => {
                self.version = self.version_suggestion.clone();
                self.on_connected(session.clone(), now);
                self.events.push(ClientEvent::Connected { session });
            }
            Message::Failed { version } => self.on_failed(version),
            Message::Ping { id } => {
                if self.config.respond_to_pings {
                    self.outbox.push(Message::Pong { id });
                }
            }
            Message::Pong { .. } => {}
            Message::Added { .. }
            | Message::AddedBefore { .. }
            | Message::Changed { .. }
            | Message::Removed { .. }
            | Message::MovedBefore { .. }
            | Message::Ready { .. }
            | Message::Updated { .. } => self.on_data(msg, now),
            Message::Nosub { id, error } => {
                self.on_data(
                    Message::Nosub {
                        id: id.clone(),
                        error: error.clone(),
                    },
                    now,
                );
                if self.subs.on_nosub(&id, error.clone()).is_some() {
                    self.events.push(ClientEvent::SubscriptionStopped { id, error });
                }
            }
            Message::Result { id, result, error } => {
                if !self.buffered_writes.is_empty() {
                    self.flush_buffered_writes();
                }
                self.methods.on_result(&id, result, error, &mut self.outbox);
            }
            Message::Error {
                reason,
                offending_message,
            } => {
                error!("Received error from server: {reason}");
                self.events.push(ClientEvent::ServerError {
                    reason,
                    offending_message,
                });
            }
            Message::ServerId(_) => {}
            other => debug!("Discarding unexpected {} message", other.kind()),
        }
        self.collect_quiesced();
    }

    // ─── Timers ─────────────────────────────────────────────────

    pub fn next_deadline(&self) -> Option<Instant> {
        let heartbeat = self.heartbeat.as_ref().map(Heartbeat::next_deadline);
        match (heartbeat, self.flush_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn on_timer(&mut self, now: Instant) {
        if self.flush_at.is_some_and(|at| at <= now) {
            self.flush_buffered_writes();
        }
        if let Some(heartbeat) = self.heartbeat.as_mut() {
            match heartbeat.poll(now) {
                HeartbeatAction::SendPing => self.outbox.push(Message::Ping { id: None }),
                HeartbeatAction::TimedOut => {
                    warn!("Heartbeat timed out");
                    self.heartbeat = None;
                    self.directives
                        .push(StreamDirective::Lost(StreamError::HeartbeatTimeout));
                }
                HeartbeatAction::Idle => {}
            }
        }
        self.collect_quiesced();
    }

    // ─── Output ─────────────────────────────────────────────────

    pub fn take_outbox(&mut self) -> Vec<Message> {
        mem::take(&mut self.outbox)
    }

    pub fn take_events(&mut self) -> Vec<ClientEvent> {
        mem::take(&mut self.events)
    }

    pub fn take_directives(&mut self) -> Vec<StreamDirective> {
        mem::take(&mut self.directives)
    }

    // ─── Handshake ──────────────────────────────────────────────

    fn on_connected(&mut self, session: String, now: Instant) {
        if self.version.as_deref() != Some("pre1") && !self.config.heartbeat_interval().is_zero() {
            self.heartbeat = Some(Heartbeat::new(
                self.config.heartbeat_interval(),
                self.config.heartbeat_timeout(),
                now,
            ));
        }

        if self.last_session_id.is_some() {
            self.reset_stores = true;
        }
        let resumed = self.last_session_id.as_deref() == Some(session.as_str());
        self.last_session_id = Some(session);
        if resumed {
            // Same session: the server kept our state, nothing to replay.
            return;
        }
        info!("Connected (protocol {})", self.version.as_deref().unwrap_or("?"));

        self.after_update.clear();
        if self.reset_stores {
            self.methods.forget_server_docs();
        }

        self.subs_being_revived = self.subs.ready_ids().into_iter().collect();
        self.methods_blocking_quiescence.clear();
        if self.reset_stores {
            for id in self.methods.with_result() {
                self.after_update.push(AfterFlush::MethodDataVisible(id));
            }
            self.methods_blocking_quiescence
                .extend(self.methods.sent_without_result());
        }

        self.buffered_until_quiescence.clear();
        if !self.is_waiting_for_quiescence() {
            if self.reset_stores {
                self.replica.pause_all();
                self.replica.clear_all();
                self.replica.resume_all();
                self.reset_stores = false;
            }
            self.run_after_update();
        }
    }

    fn on_failed(&mut self, version: Option<String>) {
        match version {
            Some(v) if self.config.supported_versions.contains(&v) => {
                info!("Server proposed protocol {v}, reconnecting");
                self.version_suggestion = Some(v);
                self.directives.push(StreamDirective::Reconnect);
            }
            other => {
                let description = format!(
                    "DDP version negotiation failed; server requested version {}",
                    other.as_deref().unwrap_or("(none)")
                );
                error!("{description}");
                self.directives.push(StreamDirective::Fail(description.clone()));
                self.events.push(ClientEvent::VersionNegotiationFailed(description));
            }
        }
    }

    // ─── Data ───────────────────────────────────────────────────

    fn on_data(&mut self, msg: Message, now: Instant) {
        let standard_write = matches!(
            msg,
            Message::Added { .. } | Message::Changed { .. } | Message::Removed { .. }
        );

        if self.is_waiting_for_quiescence() {
            match &msg {
                Message::Nosub { id, .. } => {
                    self.subs_being_revived.remove(id);
                }
                Message::Ready { subs } => {
                    for id in subs {
                        self.subs_being_revived.remove(id);
                    }
                }
                Message::Updated { methods } => {
                    for id in methods {
                        self.methods_blocking_quiescence.remove(id);
                    }
                }
                _ => {}
            }
            self.buffered_until_quiescence.push(msg);
            if self.is_waiting_for_quiescence() {
                return;
            }
            for buffered in mem::take(&mut self.buffered_until_quiescence) {
                self.process_data(buffered);
            }
        } else {
            self.process_data(msg);
        }

        let interval = self.config.buffered_writes_interval();
        if interval.is_zero() || !standard_write {
            self.flush_buffered_writes();
            return;
        }
        match self.flush_max_at {
            None => self.flush_max_at = Some(now + self.config.buffered_writes_max_age()),
            Some(max_at) if max_at < now => {
                self.flush_buffered_writes();
                return;
            }
            Some(_) => {}
        }
        self.flush_at = Some(now + interval);
    }

    fn process_data(&mut self, msg: Message) {
        match msg {
            Message::Added { collection, id, fields } => self.process_added(collection, id, fields, None),
            Message::AddedBefore {
                collection,
                id,
                fields,
                before,
            } => self.process_added(collection, id, fields, Some(before)),
            Message::Changed { collection, id, fields } => self.process_changed(collection, id, fields),
            Message::Removed { collection, id } => self.process_removed(collection, id),
            Message::MovedBefore { collection, id, before } => {
                // Buffered server docs track content only, not position.
                self.buffered_writes
                    .push((collection, DataUpdate::MovedBefore { id, before }));
            }
            Message::Ready { subs } => {
                for id in subs {
                    self.methods
                        .run_when_flushed(AfterFlush::SubReady(id), &mut self.after_update);
                }
            }
            Message::Updated { methods } => {
                for id in methods {
                    self.methods
                        .on_updated(&id, &mut self.buffered_writes, &mut self.after_update);
                }
            }
            // Only used to unblock quiescence; the record is handled by the caller.
            Message::Nosub { .. } => {}
            other => debug!("Not a data message: {}", other.kind()),
        }
    }

    fn process_added(&mut self, collection: String, id: String, fields: Fields, before: Option<Option<String>>) {
        if let Some(document) = self.methods.buffered_document_mut(&collection, &id) {
            let existing = document.is_some();
            *document = Some(fields.clone());
            if self.reset_stores {
                // Keep the stub-written version so it survives the reset.
                let current = self
                    .replica
                    .collection(&collection)
                    .and_then(|store| store.get(&id))
                    .cloned()
                    .unwrap_or(fields);
                self.buffered_writes
                    .push((collection, DataUpdate::Added { id, fields: current }));
            } else if existing {
                error!("Server sent add for existing id {collection}/{id}");
            }
            return;
        }
        let update = match before {
            Some(before) => DataUpdate::AddedBefore { id, fields, before },
            None => DataUpdate::Added { id, fields },
        };
        self.buffered_writes.push((collection, update));
    }

    fn process_changed(&mut self, collection: String, id: String, changes: FieldChanges) {
        match self.methods.buffered_document_mut(&collection, &id) {
            Some(Some(document)) => apply_changes(document, &changes),
            Some(None) => error!("Server sent changed for nonexisting id {collection}/{id}"),
            None => self
                .buffered_writes
                .push((collection, DataUpdate::Changed { id, changes })),
        }
    }

    fn process_removed(&mut self, collection: String, id: String) {
        match self.methods.buffered_document_mut(&collection, &id) {
            Some(document) => {
                if document.take().is_none() {
                    error!("Server sent removed for nonexisting id {collection}/{id}");
                }
            }
            None => self.buffered_writes.push((collection, DataUpdate::Removed { id })),
        }
    }

    fn flush_buffered_writes(&mut self) {
        self.flush_at = None;
        self.flush_max_at = None;
        let writes = mem::take(&mut self.buffered_writes);
        self.perform_writes(writes);
    }

    fn perform_writes(&mut self, writes: Vec<(String, DataUpdate)>) {
        if self.reset_stores || !writes.is_empty() {
            self.replica.pause_all();
            if self.reset_stores {
                self.replica.clear_all();
                self.reset_stores = false;
            }
            for (collection, update) in writes {
                let id = update.id().to_string();
                if let Err(e) = self.replica.update(&collection, update) {
                    error!("Applying server write to {collection}/{id}: {e}");
                }
            }
            self.replica.resume_all();
        }
        self.run_after_update();
    }

    fn run_after_update(&mut self) {
        for action in mem::take(&mut self.after_update) {
            match action {
                AfterFlush::SubReady(id) => {
                    if self.subs.mark_ready(&id) {
                        self.events.push(ClientEvent::SubscriptionReady(id));
                    }
                }
                AfterFlush::MethodDataVisible(id) => self.methods.data_visible(&id, &mut self.outbox),
            }
        }
    }

    fn collect_quiesced(&mut self) {
        for id in self.methods.take_quiesced() {
            self.events.push(ClientEvent::MethodQuiesced(id));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::ejson::fields;
    use crate::methods::StubContext;
    use crate::replica::{ChannelObserver, ReplicaEvent};

    fn immediate_config() -> ClientConfig {
        ClientConfig {
            buffered_writes_interval_ms: 0,
            ..ClientConfig::default()
        }
    }

    fn connected(config: ClientConfig, session: &str) -> (LiveDataClient, Instant) {
        let now = Instant::now();
        let mut client = LiveDataClient::new(config);
        client.on_reset();
        client.handle(
            Message::Connected {
                session: session.into(),
            },
            now,
        );
        client.take_outbox();
        client.take_events();
        (client, now)
    }

    fn added(collection: &str, id: &str, name: &str) -> Message {
        Message::Added {
            collection: collection.into(),
            id: id.into(),
            fields: fields([("name", name)]),
        }
    }

    fn doc_name(client: &LiveDataClient, collection: &str, id: &str) -> Option<String> {
        client
            .replica()
            .collection(collection)?
            .get(id)?
            .get("name")?
            .as_str()
            .map(str::to_string)
    }

    #[test]
    fn test_reset_sends_connect_first() {
        let mut client = LiveDataClient::new(ClientConfig::default());
        client.on_reset();
        let out = client.take_outbox();
        assert_eq!(
            out,
            vec![Message::Connect {
                version: "1".into(),
                support: vec!["1".into(), "pre2".into(), "pre1".into()],
                session: None,
            }]
        );
    }

    #[test]
    fn test_connected_records_session_and_version() {
        let mut client = LiveDataClient::new(ClientConfig::default());
        client.on_reset();
        client.handle(Message::Connected { session: "s1".into() }, Instant::now());
        assert_eq!(client.session_id(), Some("s1"));
        assert_eq!(client.version(), Some("1"));
        assert_eq!(
            client.take_events(),
            vec![ClientEvent::Connected { session: "s1".into() }]
        );
        client.take_outbox();

        client.on_disconnect(None);
        client.on_reset();
        match &client.take_outbox()[0] {
            Message::Connect { session, .. } => assert_eq!(session.as_deref(), Some("s1")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_requests_queued_before_reset_follow_connect() {
        let mut client = LiveDataClient::new(ClientConfig::default());
        let (tx, _rx) = oneshot::channel();
        let id = client.call("m", vec![], CallOptions::default(), tx).unwrap();
        let handle = client.subscribe("items", vec![]);
        // Still queued for a transport that never carried a handshake.
        assert_eq!(client.take_outbox().len(), 2);
        let (tx, _rx) = oneshot::channel();
        let second = client.call("m", vec![], CallOptions::default(), tx).unwrap();

        client.on_reset();
        let out = client.take_outbox();
        assert!(matches!(&out[0], Message::Connect { .. }));
        let methods: Vec<&str> = out
            .iter()
            .filter_map(|m| match m {
                Message::Method { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(methods, vec![id.as_str(), second.as_str()]);
        let subs = out.iter().filter(|m| matches!(m, Message::Sub { id, .. } if id == handle.id())).count();
        assert_eq!(subs, 1);
    }

    #[test]
    fn test_invalid_frames_are_discarded() {
        let (mut client, now) = connected(ClientConfig::default(), "s1");
        client.on_message("{not json", now);
        client.on_message(r#"{"msg":"bogus"}"#, now);
        client.on_message("[1,2]", now);
        assert!(client.take_outbox().is_empty());
        assert!(client.take_events().is_empty());
        assert_eq!(client.session_id(), Some("s1"));
    }

    #[test]
    fn test_ping_answered_with_pong() {
        let (mut client, now) = connected(ClientConfig::default(), "s1");
        client.handle(Message::Ping { id: Some("7".into()) }, now);
        assert_eq!(client.take_outbox(), vec![Message::Pong { id: Some("7".into()) }]);
    }

    #[test]
    fn test_failed_with_supported_version_renegotiates() {
        let mut client = LiveDataClient::new(ClientConfig::default());
        client.on_reset();
        client.take_outbox();
        client.handle(
            Message::Failed {
                version: Some("pre1".into()),
            },
            Instant::now(),
        );
        assert_eq!(client.take_directives(), vec![StreamDirective::Reconnect]);

        client.on_reset();
        match &client.take_outbox()[0] {
            Message::Connect { version, .. } => assert_eq!(version, "pre1"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_failed_with_unknown_version_gives_up() {
        let mut client = LiveDataClient::new(ClientConfig::default());
        client.on_reset();
        client.handle(
            Message::Failed {
                version: Some("42".into()),
            },
            Instant::now(),
        );
        assert!(matches!(client.take_directives().as_slice(), [StreamDirective::Fail(_)]));
        assert!(matches!(
            client.take_events().as_slice(),
            [ClientEvent::VersionNegotiationFailed(_)]
        ));
    }

    #[test]
    fn test_stub_write_survives_until_updated() {
        let (mut client, now) = connected(immediate_config(), "s1");
        client.handle(added("users", "u1", "Ann"), now);
        client.register_stub(
            "setName",
            Box::new(|ctx: &mut StubContext<'_>, params: &[Value]| -> MethodResult {
                let name = params.first().and_then(Value::as_str).unwrap_or_default().to_string();
                ctx.collection("users")
                    .update_fields("u1", &[("name".to_string(), Some(Value::from(name)))].into())
                    .map_err(|e| MethodError::new(500, e.to_string()))?;
                Ok(Value::Null)
            }),
        );

        let (tx, mut rx) = oneshot::channel();
        let id = client
            .call("setName", vec![Value::from("Bob")], CallOptions::default(), tx)
            .unwrap();
        assert_eq!(doc_name(&client, "users", "u1").as_deref(), Some("Bob"));

        client.handle(
            Message::Changed {
                collection: "users".into(),
                id: "u1".into(),
                fields: [("name".to_string(), Some(Value::from("Robert")))].into(),
            },
            now,
        );
        assert_eq!(doc_name(&client, "users", "u1").as_deref(), Some("Bob"));

        client.handle(
            Message::Result {
                id: id.clone(),
                result: Some(Value::from(1)),
                error: None,
            },
            now,
        );
        assert_eq!(rx.try_recv().unwrap(), Ok(Value::from(1)));
        assert_eq!(doc_name(&client, "users", "u1").as_deref(), Some("Bob"));

        client.handle(Message::Updated { methods: vec![id.clone()] }, now);
        assert_eq!(doc_name(&client, "users", "u1").as_deref(), Some("Robert"));
        assert_eq!(client.take_events(), vec![ClientEvent::MethodQuiesced(id)]);
        assert_eq!(client.outstanding_methods(), 0);
    }

    #[test]
    fn test_ready_waits_for_stub_writes() {
        let (mut client, now) = connected(immediate_config(), "s1");
        client.handle(added("users", "u1", "Ann"), now);
        client.register_stub(
            "touch",
            Box::new(|ctx: &mut StubContext<'_>, _: &[Value]| -> MethodResult {
                ctx.collection("users")
                    .replace("u1", fields([("name", "Touched")]))
                    .map_err(|e| MethodError::new(500, e.to_string()))?;
                Ok(Value::Null)
            }),
        );
        let handle = client.subscribe("users", vec![]);
        let (tx, _rx) = oneshot::channel();
        let id = client.call("touch", vec![], CallOptions::default(), tx).unwrap();

        client.handle(
            Message::Ready {
                subs: vec![handle.id().to_string()],
            },
            now,
        );
        assert!(!handle.is_ready());

        client.handle(Message::Updated { methods: vec![id] }, now);
        assert!(handle.is_ready());
        assert!(client
            .take_events()
            .contains(&ClientEvent::SubscriptionReady(handle.id().to_string())));
    }

    #[test]
    fn test_reconnect_applies_net_difference() {
        let (mut client, now) = connected(immediate_config(), "s1");
        let handle = client.subscribe("items", vec![]);
        let sub_id = handle.id().to_string();
        client.handle(added("items", "a", "A"), now);
        client.handle(added("items", "c", "C"), now);
        client.handle(Message::Ready { subs: vec![sub_id.clone()] }, now);
        assert!(handle.is_ready());

        let (observer, mut changes) = ChannelObserver::new();
        client.observe("items", Box::new(observer));
        client.take_outbox();

        client.on_disconnect(Some(&StreamError::Closed));
        client.on_reset();
        let out = client.take_outbox();
        assert!(matches!(&out[0], Message::Connect { session: Some(s), .. } if s == "s1"));
        assert!(out.contains(&Message::Sub {
            id: sub_id.clone(),
            name: "items".into(),
            params: vec![],
        }));

        client.handle(Message::Connected { session: "s2".into() }, now);
        assert!(client.is_waiting_for_quiescence());
        client.handle(added("items", "a", "A"), now);
        client.handle(added("items", "b", "B"), now);
        // Nothing applied while the subscription is being revived.
        assert_eq!(doc_name(&client, "items", "c").as_deref(), Some("C"));
        assert!(changes.try_recv().is_err());

        client.handle(Message::Ready { subs: vec![sub_id] }, now);
        assert!(!client.is_waiting_for_quiescence());
        let store = client.replica().collection("items").unwrap();
        assert_eq!(store.len(), 2);
        assert!(store.contains("a") && store.contains("b"));

        let mut seen = Vec::new();
        while let Ok(change) = changes.try_recv() {
            seen.push(change.event);
        }
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|e| e.id() != "a"));
        assert!(seen
            .iter()
            .any(|e| matches!(e, ReplicaEvent::Removed { id, .. } if id == "c")));
    }

    #[test]
    fn test_unsent_methods_do_not_block_quiescence() {
        let (mut client, now) = connected(immediate_config(), "s1");
        client.handle(added("items", "a", "A"), now);
        client.on_disconnect(None);
        client.on_reset();
        client.handle(Message::Connected { session: "s2".into() }, now);
        // No ready subs and no methods in flight: stores reset at once.
        assert!(!client.is_waiting_for_quiescence());
        assert!(client.replica().collection("items").unwrap().is_empty());
    }

    #[test]
    fn test_writes_coalesce_until_interval() {
        let (mut client, now) = connected(ClientConfig::default(), "s1");
        client.handle(added("items", "a", "A"), now);
        assert!(client.replica().collection("items").is_none());
        let deadline = client.next_deadline().unwrap();
        assert_eq!(deadline, now + Duration::from_millis(5));

        client.on_timer(deadline);
        assert_eq!(client.replica().collection("items").unwrap().len(), 1);
    }

    #[test]
    fn test_writes_flush_at_max_age() {
        let config = ClientConfig {
            buffered_writes_interval_ms: 5,
            buffered_writes_max_age_ms: 10,
            heartbeat_interval_ms: 0,
            ..ClientConfig::default()
        };
        let (mut client, t0) = connected(config, "s1");
        for (i, offset) in [0u64, 4, 8].iter().enumerate() {
            client.handle(added("items", &i.to_string(), "x"), t0 + Duration::from_millis(*offset));
        }
        assert!(client.replica().collection("items").is_none());
        client.handle(added("items", "3", "x"), t0 + Duration::from_millis(12));
        assert_eq!(client.replica().collection("items").unwrap().len(), 4);
        assert_eq!(client.next_deadline(), None);
    }

    #[test]
    fn test_result_flushes_pending_writes() {
        let (mut client, now) = connected(ClientConfig::default(), "s1");
        let (tx, _rx) = oneshot::channel();
        let id = client.call("m", vec![], CallOptions::default(), tx).unwrap();
        client.handle(added("items", "a", "A"), now);
        assert!(client.replica().collection("items").is_none());
        client.handle(
            Message::Result {
                id,
                result: None,
                error: None,
            },
            now,
        );
        assert_eq!(client.replica().collection("items").unwrap().len(), 1);
    }

    #[test]
    fn test_nosub_emits_stopped() {
        let (mut client, now) = connected(immediate_config(), "s1");
        let handle = client.subscribe("secret", vec![]);
        let error = MethodError::new(404, "Subscription 'secret' not found");
        client.handle(
            Message::Nosub {
                id: handle.id().to_string(),
                error: Some(error.clone()),
            },
            now,
        );
        assert_eq!(
            client.take_events(),
            vec![ClientEvent::SubscriptionStopped {
                id: handle.id().to_string(),
                error: Some(error),
            }]
        );
        assert_eq!(client.subscription_count(), 0);
    }

    #[test]
    fn test_heartbeat_ping_then_timeout() {
        let (mut client, t0) = connected(ClientConfig::default(), "s1");
        client.on_timer(t0 + Duration::from_secs(45));
        assert_eq!(client.take_outbox(), vec![Message::Ping { id: None }]);
        client.on_timer(t0 + Duration::from_secs(60));
        assert_eq!(
            client.take_directives(),
            vec![StreamDirective::Lost(StreamError::HeartbeatTimeout)]
        );
        assert_eq!(client.next_deadline(), None);
    }

    #[test]
    fn test_pre1_has_no_heartbeat() {
        let config = ClientConfig {
            supported_versions: vec!["pre1".into()],
            ..ClientConfig::default()
        };
        let (client, _) = connected(config, "s1");
        assert_eq!(client.version(), Some("pre1"));
        assert_eq!(client.next_deadline(), None);
    }

    #[test]
    fn test_close_fails_calls() {
        let (mut client, _) = connected(ClientConfig::default(), "s1");
        let (tx, mut rx) = oneshot::channel();
        client.call("m", vec![], CallOptions::default(), tx);
        client.close();
        assert!(rx.try_recv().unwrap().unwrap_err().is("disconnected"));

        let (tx, mut rx) = oneshot::channel();
        assert!(client.call("m", vec![], CallOptions::default(), tx).is_none());
        assert!(rx.try_recv().unwrap().is_err());
    }
}
