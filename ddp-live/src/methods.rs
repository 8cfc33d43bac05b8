//! Outstanding method calls and latency compensation.
//!
//! ```text
//! call ──► stub runs on replica (originals saved per touched doc)
//!            │
//!            ▼
//!      server doc buffer  ◄── data msgs for stub-written docs land here
//!            │
//! updated ───┘ writer set empty → Replace(replica doc ← buffered doc)
//! result  ───► caller resolved
//! result + data visible ──► quiesced ──► next block sent
//! ```
//!
//! Methods queue in blocks. A `wait` method gets a block of its own; only
//! the first block is ever on the wire, so a `wait` method runs alone and
//! everything after it waits for it to quiesce.

use std::collections::{HashMap, HashSet, VecDeque};

use tokio::sync::oneshot;

use crate::ejson::{Fields, Value};
use crate::protocol::{Message, MethodError};
use crate::replica::{DataUpdate, OriginalDoc, Replica, ReplicaStore};

pub type MethodResult = Result<Value, MethodError>;

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Run alone: wait for earlier methods, hold later ones
    pub wait: bool,
    /// Fail with `invocation-failed` instead of resending after a reconnect
    pub no_retry: bool,
    /// Seed forwarded to the server so stub and server agree on random ids
    pub random_seed: Option<Value>,
}

/// What a stub sees while it runs.
pub struct StubContext<'a> {
    pub replica: &'a mut Replica,
    pub method_id: &'a str,
    pub random_seed: Option<&'a Value>,
}

impl StubContext<'_> {
    pub fn collection(&mut self, name: &str) -> &mut ReplicaStore {
        self.replica.collection_mut(name)
    }
}

/// Client-side simulation of a server method.
pub trait MethodStub: Send {
    fn call(&mut self, ctx: &mut StubContext<'_>, params: &[Value]) -> MethodResult;
}

impl<F> MethodStub for F
where
    F: FnMut(&mut StubContext<'_>, &[Value]) -> MethodResult + Send,
{
    fn call(&mut self, ctx: &mut StubContext<'_>, params: &[Value]) -> MethodResult {
        self(ctx, params)
    }
}

/// Work deferred until buffered server documents are flushed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AfterFlush {
    SubReady(String),
    MethodDataVisible(String),
}

type DocKey = (String, String);

struct Invoker {
    name: String,
    params: Vec<Value>,
    random_seed: Option<Value>,
    no_retry: bool,
    sent: bool,
    got_result: bool,
    data_visible: bool,
    reply: Option<oneshot::Sender<MethodResult>>,
}

impl Invoker {
    fn resolve(&mut self, outcome: MethodResult) {
        if let Some(reply) = self.reply.take() {
            // The caller may have stopped waiting.
            let _ = reply.send(outcome);
        }
    }
}

#[derive(Debug)]
struct Block {
    wait: bool,
    methods: Vec<String>,
}

struct ServerDoc {
    /// The server's version; `None` when the server says it does not exist
    document: Option<Fields>,
    writers: HashSet<String>,
    fences: Vec<u64>,
}

struct Fence {
    remaining: usize,
    action: AfterFlush,
}

#[derive(Default)]
pub struct MethodManager {
    next_id: u64,
    invokers: HashMap<String, Invoker>,
    blocks: VecDeque<Block>,
    server_docs: HashMap<DocKey, ServerDoc>,
    docs_written_by_stub: HashMap<String, Vec<DocKey>>,
    fences: HashMap<u64, Fence>,
    next_fence: u64,
    stubs: HashMap<String, Box<dyn MethodStub>>,
    quiesced: Vec<String>,
}

impl MethodManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_stub(&mut self, name: impl Into<String>, stub: Box<dyn MethodStub>) {
        self.stubs.insert(name.into(), stub);
    }

    pub fn has_stub(&self, name: &str) -> bool {
        self.stubs.contains_key(name)
    }

    pub fn outstanding(&self) -> usize {
        self.invokers.len()
    }

    pub fn is_outstanding(&self, id: &str) -> bool {
        self.invokers.contains_key(id)
    }

    /// Start a call. Runs the stub (if any) against `replica`, queues the
    /// method and pushes it to `out` if its block is first. Returns the id.
    pub fn call(
        &mut self,
        name: &str,
        params: Vec<Value>,
        options: CallOptions,
        reply: oneshot::Sender<MethodResult>,
        replica: &mut Replica,
        out: &mut Vec<Message>,
    ) -> String {
        self.next_id += 1;
        let id = self.next_id.to_string();

        if let Some(stub) = self.stubs.get_mut(name) {
            match replica.save_originals() {
                Ok(()) => {
                    let mut ctx = StubContext {
                        replica: &mut *replica,
                        method_id: &id,
                        random_seed: options.random_seed.as_ref(),
                    };
                    if let Err(e) = stub.call(&mut ctx, &params) {
                        log::debug!("Exception while simulating the effect of invoking '{name}': {e}");
                    }
                    match replica.retrieve_originals() {
                        Ok(originals) => self.record_stub_writes(&id, originals),
                        Err(e) => log::error!("Lost stub originals for '{name}': {e}"),
                    }
                }
                Err(e) => log::error!("Cannot simulate '{name}': {e}"),
            }
        }

        self.invokers.insert(
            id.clone(),
            Invoker {
                name: name.to_string(),
                params,
                random_seed: options.random_seed,
                no_retry: options.no_retry,
                sent: false,
                got_result: false,
                data_visible: false,
                reply: Some(reply),
            },
        );

        let new_block = options.wait || self.blocks.back().map_or(true, |b| b.wait);
        if new_block {
            self.blocks.push_back(Block {
                wait: options.wait,
                methods: Vec::new(),
            });
        }
        if let Some(block) = self.blocks.back_mut() {
            block.methods.push(id.clone());
        }
        if self.blocks.len() == 1 {
            self.send_method(&id, out);
        }
        id
    }

    fn record_stub_writes(&mut self, method_id: &str, originals: Vec<OriginalDoc>) {
        if originals.is_empty() {
            return;
        }
        let mut written = Vec::with_capacity(originals.len());
        for doc in originals {
            let key = (doc.collection, doc.id);
            let server_doc = self.server_docs.entry(key.clone()).or_insert_with(|| ServerDoc {
                document: doc.original,
                writers: HashSet::new(),
                fences: Vec::new(),
            });
            server_doc.writers.insert(method_id.to_string());
            written.push(key);
        }
        self.docs_written_by_stub.insert(method_id.to_string(), written);
    }

    /// The buffered server version of a stub-written document, if any.
    pub fn buffered_document_mut(&mut self, collection: &str, id: &str) -> Option<&mut Option<Fields>> {
        self.server_docs
            .get_mut(&(collection.to_string(), id.to_string()))
            .map(|doc| &mut doc.document)
    }

    /// Handle `result`. Resolves the caller and may quiesce the method.
    pub fn on_result(
        &mut self,
        id: &str,
        result: Option<Value>,
        error: Option<MethodError>,
        out: &mut Vec<Message>,
    ) {
        let Some(block) = self.blocks.front_mut() else {
            log::warn!("Received method result but no methods outstanding");
            return;
        };
        let Some(pos) = block.methods.iter().position(|m| m == id) else {
            log::warn!("Can't match method response to original method call: {id}");
            return;
        };
        block.methods.remove(pos);

        let Some(invoker) = self.invokers.get_mut(id) else {
            log::warn!("No invoker for method {id}");
            return;
        };
        invoker.got_result = true;
        invoker.resolve(match error {
            Some(e) => Err(e),
            None => Ok(result.unwrap_or(Value::Null)),
        });
        if invoker.data_visible {
            self.finish(id, out);
        }
    }

    /// Handle one method id of an `updated` message. Documents whose last
    /// stub writer this was are queued as `Replace` updates.
    pub fn on_updated(
        &mut self,
        id: &str,
        updates: &mut Vec<(String, DataUpdate)>,
        after: &mut Vec<AfterFlush>,
    ) {
        for key in self.docs_written_by_stub.remove(id).unwrap_or_default() {
            let Some(server_doc) = self.server_docs.get_mut(&key) else {
                log::error!("Lost server doc for {key:?}");
                continue;
            };
            if !server_doc.writers.remove(id) {
                log::error!("Doc {key:?} not written by method {id}");
                continue;
            }
            if !server_doc.writers.is_empty() {
                continue;
            }
            let (collection, doc_id) = key.clone();
            updates.push((
                collection,
                DataUpdate::Replace {
                    id: doc_id,
                    fields: server_doc.document.clone(),
                },
            ));
            let fences = std::mem::take(&mut server_doc.fences);
            self.server_docs.remove(&key);
            for fence_id in fences {
                self.release_fence(fence_id, after);
            }
        }

        if self.invokers.contains_key(id) {
            self.run_when_flushed(AfterFlush::MethodDataVisible(id.to_string()), after);
        } else {
            log::warn!("Updated for unknown method {id}");
        }
    }

    /// Run `action` once every buffered document written by a sent method
    /// has been flushed. Immediate when nothing is pending.
    pub fn run_when_flushed(&mut self, action: AfterFlush, after: &mut Vec<AfterFlush>) {
        let fence_id = self.next_fence;
        let mut pending = 0;
        for server_doc in self.server_docs.values_mut() {
            let blocked = server_doc
                .writers
                .iter()
                .any(|m| self.invokers.get(m).is_some_and(|i| i.sent));
            if blocked {
                pending += 1;
                server_doc.fences.push(fence_id);
            }
        }
        if pending == 0 {
            after.push(action);
        } else {
            self.next_fence += 1;
            self.fences.insert(
                fence_id,
                Fence {
                    remaining: pending,
                    action,
                },
            );
        }
    }

    fn release_fence(&mut self, fence_id: u64, after: &mut Vec<AfterFlush>) {
        let Some(fence) = self.fences.get_mut(&fence_id) else {
            return;
        };
        fence.remaining -= 1;
        if fence.remaining == 0 {
            if let Some(fence) = self.fences.remove(&fence_id) {
                after.push(fence.action);
            }
        }
    }

    /// The method's writes are now reflected in the replica.
    pub fn data_visible(&mut self, id: &str, out: &mut Vec<Message>) {
        let Some(invoker) = self.invokers.get_mut(id) else {
            return;
        };
        invoker.data_visible = true;
        if invoker.got_result {
            self.finish(id, out);
        }
    }

    fn finish(&mut self, id: &str, out: &mut Vec<Message>) {
        if let Some(invoker) = self.invokers.remove(id) {
            log::trace!("Method {id} ({}) quiesced", invoker.name);
        }
        self.quiesced.push(id.to_string());
        self.outstanding_method_finished(out);
    }

    fn outstanding_method_finished(&mut self, out: &mut Vec<Message>) {
        if self.invokers.values().any(|i| i.sent) {
            return;
        }
        if let Some(first) = self.blocks.pop_front() {
            if !first.methods.is_empty() {
                log::error!("No methods outstanding but nonempty block: {:?}", first.methods);
            }
        }
        self.send_first_block(out);
    }

    fn send_first_block(&mut self, out: &mut Vec<Message>) {
        let ids = match self.blocks.front() {
            Some(block) => block.methods.clone(),
            None => return,
        };
        for id in ids {
            self.send_method(&id, out);
        }
    }

    fn send_method(&mut self, id: &str, out: &mut Vec<Message>) {
        let Some(invoker) = self.invokers.get_mut(id) else {
            return;
        };
        invoker.sent = true;
        out.push(Message::Method {
            method: invoker.name.clone(),
            params: invoker.params.clone(),
            id: id.to_string(),
            random_seed: invoker.random_seed.clone(),
        });
    }

    /// A new transport opened. Fails sent `no_retry` methods, marks the
    /// rest unsent and resends the first block with the same ids.
    pub fn on_reset(&mut self, out: &mut Vec<Message>) {
        if let Some(block) = self.blocks.front_mut() {
            let invokers = &mut self.invokers;
            block.methods.retain(|id| {
                let Some(invoker) = invokers.get_mut(id) else {
                    return false;
                };
                if invoker.sent && invoker.no_retry {
                    invoker.got_result = true;
                    invoker.resolve(Err(MethodError::invocation_failed()));
                    return false;
                }
                true
            });
        }
        if self.blocks.front().is_some_and(|b| b.methods.is_empty()) {
            self.blocks.pop_front();
        }
        for invoker in self.invokers.values_mut() {
            invoker.sent = false;
        }
        self.send_first_block(out);
    }

    /// Methods sent on the current connection that have no result yet.
    pub fn sent_without_result(&self) -> Vec<String> {
        self.invokers
            .iter()
            .filter(|(_, i)| i.sent && !i.got_result)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Methods that already have their result.
    pub fn with_result(&self) -> Vec<String> {
        self.invokers
            .iter()
            .filter(|(_, i)| i.got_result)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Forget all buffered server documents; the stores are about to be
    /// rebuilt from the server.
    pub fn forget_server_docs(&mut self) {
        self.server_docs.clear();
        self.docs_written_by_stub.clear();
        self.fences.clear();
    }

    pub fn take_quiesced(&mut self) -> Vec<String> {
        std::mem::take(&mut self.quiesced)
    }

    /// Fail everything outstanding; the connection is gone for good.
    pub fn close(&mut self) {
        for (_, mut invoker) in self.invokers.drain() {
            invoker.resolve(Err(MethodError::disconnected()));
        }
        self.blocks.clear();
        self.forget_server_docs();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ejson::fields;

    fn sent_ids(out: &[Message]) -> Vec<String> {
        out.iter()
            .filter_map(|m| match m {
                Message::Method { id, .. } => Some(id.clone()),
                _ => None,
            })
            .collect()
    }

    fn call(
        manager: &mut MethodManager,
        name: &str,
        options: CallOptions,
        replica: &mut Replica,
        out: &mut Vec<Message>,
    ) -> (String, oneshot::Receiver<MethodResult>) {
        let (tx, rx) = oneshot::channel();
        let id = manager.call(name, vec![], options, tx, replica, out);
        (id, rx)
    }

    fn set_name_stub() -> Box<dyn MethodStub> {
        Box::new(|ctx: &mut StubContext<'_>, _params: &[Value]| -> MethodResult {
            let users = ctx.collection("users");
            users.replace("u1", fields([("name", "Bob")])).map_err(|e| MethodError::new(500, e.to_string()))?;
            Ok(Value::Null)
        })
    }

    #[test]
    fn test_ids_are_monotonic() {
        let mut manager = MethodManager::new();
        let mut replica = Replica::new();
        let mut out = Vec::new();
        let (a, _) = call(&mut manager, "m", CallOptions::default(), &mut replica, &mut out);
        let (b, _) = call(&mut manager, "m", CallOptions::default(), &mut replica, &mut out);
        assert_eq!((a.as_str(), b.as_str()), ("1", "2"));
        assert_eq!(sent_ids(&out), vec!["1", "2"]);
    }

    #[test]
    fn test_wait_method_blocks_followers() {
        let mut manager = MethodManager::new();
        let mut replica = Replica::new();
        let mut out = Vec::new();
        let (a, _) = call(&mut manager, "m", CallOptions::default(), &mut replica, &mut out);
        let wait = CallOptions {
            wait: true,
            ..CallOptions::default()
        };
        let (b, _) = call(&mut manager, "m", wait, &mut replica, &mut out);
        let (c, _) = call(&mut manager, "m", CallOptions::default(), &mut replica, &mut out);
        assert_eq!(sent_ids(&out), vec![a.clone()]);

        out.clear();
        let mut after = Vec::new();
        let mut updates = Vec::new();
        manager.on_result(&a, None, None, &mut out);
        manager.on_updated(&a, &mut updates, &mut after);
        assert_eq!(after, vec![AfterFlush::MethodDataVisible(a.clone())]);
        manager.data_visible(&a, &mut out);
        assert_eq!(sent_ids(&out), vec![b.clone()]);

        out.clear();
        manager.on_result(&b, None, None, &mut out);
        manager.on_updated(&b, &mut updates, &mut after);
        manager.data_visible(&b, &mut out);
        assert_eq!(sent_ids(&out), vec![c]);
        assert_eq!(manager.take_quiesced(), vec![a, b]);
    }

    #[test]
    fn test_result_resolves_caller() {
        let mut manager = MethodManager::new();
        let mut replica = Replica::new();
        let mut out = Vec::new();
        let (id, mut rx) = call(&mut manager, "m", CallOptions::default(), &mut replica, &mut out);
        manager.on_result(&id, Some(Value::from(3)), None, &mut out);
        assert_eq!(rx.try_recv().unwrap(), Ok(Value::from(3)));
        // Not quiesced until data is visible.
        assert!(manager.is_outstanding(&id));
    }

    #[test]
    fn test_unmatched_result_is_dropped() {
        let mut manager = MethodManager::new();
        let mut out = Vec::new();
        manager.on_result("99", None, None, &mut out);
        assert!(out.is_empty());
        assert_eq!(manager.outstanding(), 0);
    }

    #[test]
    fn test_stub_writes_are_buffered_then_replaced() {
        let mut manager = MethodManager::new();
        manager.register_stub("setName", set_name_stub());
        let mut replica = Replica::new();
        replica.collection_mut("users").insert("u1", fields([("name", "Ann")])).unwrap();
        let mut out = Vec::new();

        let (id, _rx) = call(&mut manager, "setName", CallOptions::default(), &mut replica, &mut out);
        assert_eq!(replica.collection("users").unwrap().get("u1"), Some(&fields([("name", "Bob")])));

        // Server change lands in the buffer, not the replica.
        let buffered = manager.buffered_document_mut("users", "u1").unwrap();
        assert_eq!(*buffered, Some(fields([("name", "Ann")])));
        *buffered = Some(fields([("name", "Robert")]));

        let mut updates = Vec::new();
        let mut after = Vec::new();
        manager.on_updated(&id, &mut updates, &mut after);
        assert_eq!(
            updates,
            vec![(
                "users".to_string(),
                DataUpdate::Replace {
                    id: "u1".into(),
                    fields: Some(fields([("name", "Robert")])),
                }
            )]
        );
        assert!(manager.buffered_document_mut("users", "u1").is_none());
    }

    #[test]
    fn test_ready_fenced_behind_sent_stub() {
        let mut manager = MethodManager::new();
        manager.register_stub("setName", set_name_stub());
        let mut replica = Replica::new();
        replica.collection_mut("users").insert("u1", Fields::new()).unwrap();
        let mut out = Vec::new();
        let (id, _rx) = call(&mut manager, "setName", CallOptions::default(), &mut replica, &mut out);

        let mut after = Vec::new();
        manager.run_when_flushed(AfterFlush::SubReady("s1".into()), &mut after);
        assert!(after.is_empty());

        let mut updates = Vec::new();
        manager.on_updated(&id, &mut updates, &mut after);
        assert_eq!(
            after,
            vec![
                AfterFlush::SubReady("s1".into()),
                AfterFlush::MethodDataVisible(id)
            ]
        );
    }

    #[test]
    fn test_reset_resends_with_same_id() {
        let mut manager = MethodManager::new();
        let mut replica = Replica::new();
        let mut out = Vec::new();
        let (id, _rx) = call(&mut manager, "m", CallOptions::default(), &mut replica, &mut out);
        out.clear();
        manager.on_reset(&mut out);
        assert_eq!(sent_ids(&out), vec![id]);
    }

    #[test]
    fn test_no_retry_fails_on_reset() {
        let mut manager = MethodManager::new();
        let mut replica = Replica::new();
        let mut out = Vec::new();
        let no_retry = CallOptions {
            no_retry: true,
            ..CallOptions::default()
        };
        let (a, mut rx) = call(&mut manager, "m", no_retry, &mut replica, &mut out);
        let (b, _) = call(&mut manager, "m", CallOptions::default(), &mut replica, &mut out);
        out.clear();

        manager.on_reset(&mut out);
        let err = rx.try_recv().unwrap().unwrap_err();
        assert!(err.is("invocation-failed"));
        assert_eq!(sent_ids(&out), vec![b]);
        assert_eq!(manager.with_result(), vec![a]);
    }

    #[test]
    fn test_close_fails_everything() {
        let mut manager = MethodManager::new();
        let mut replica = Replica::new();
        let mut out = Vec::new();
        let (_, mut rx) = call(&mut manager, "m", CallOptions::default(), &mut replica, &mut out);
        manager.close();
        assert!(rx.try_recv().unwrap().unwrap_err().is("disconnected"));
        assert_eq!(manager.outstanding(), 0);
    }

    #[test]
    fn test_failing_stub_still_sends() {
        let mut manager = MethodManager::new();
        manager.register_stub(
            "boom",
            Box::new(|_: &mut StubContext<'_>, _: &[Value]| -> MethodResult { Err(MethodError::new(500, "boom")) }),
        );
        let mut replica = Replica::new();
        let mut out = Vec::new();
        let (id, _) = call(&mut manager, "boom", CallOptions::default(), &mut replica, &mut out);
        assert_eq!(sent_ids(&out), vec![id]);
    }
}
