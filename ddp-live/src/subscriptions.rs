//! Client-side subscription records.
//!
//! A record lives from `subscribe` until the server's `nosub`. Readiness is
//! published through a `watch` channel so any number of handles can await it.
//! Document attribution is the server's job; the client only tracks which
//! subscriptions exist and whether they are ready.

use indexmap::IndexMap;
use tokio::sync::watch;
use uuid::Uuid;

use crate::client::ClientError;
use crate::ejson::Value;
use crate::protocol::{Message, MethodError};

#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionState {
    Pending,
    Ready,
    /// Ended by `nosub`, with the server's error if it reported one
    Stopped(Option<MethodError>),
}

/// Caller's view of one subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    id: String,
    name: String,
    state: watch::Receiver<SubscriptionState>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SubscriptionState {
        self.state.borrow().clone()
    }

    pub fn is_ready(&self) -> bool {
        *self.state.borrow() == SubscriptionState::Ready
    }

    /// Wait until the initial data set is complete.
    pub async fn ready(&mut self) -> Result<(), ClientError> {
        let state = self
            .state
            .wait_for(|s| *s != SubscriptionState::Pending)
            .await
            .map_err(|_| ClientError::Closed)?;
        match &*state {
            SubscriptionState::Stopped(error) => Err(ClientError::SubscriptionStopped(error.clone())),
            _ => Ok(()),
        }
    }

    /// Wait until the server ends the subscription.
    pub async fn stopped(&mut self) -> Option<MethodError> {
        let state = self
            .state
            .wait_for(|s| matches!(s, SubscriptionState::Stopped(_)))
            .await
            .ok()?;
        match &*state {
            SubscriptionState::Stopped(error) => error.clone(),
            _ => None,
        }
    }
}

struct Record {
    name: String,
    params: Vec<Value>,
    ready: bool,
    /// `unsub` sent, waiting for `nosub`
    stopping: bool,
    state: watch::Sender<SubscriptionState>,
}

impl Record {
    fn sub_message(&self, id: &str) -> Message {
        Message::Sub {
            id: id.to_string(),
            name: self.name.clone(),
            params: self.params.clone(),
        }
    }
}

#[derive(Default)]
pub struct SubscriptionManager {
    records: IndexMap<String, Record>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    pub fn subscribe(&mut self, name: &str, params: Vec<Value>, out: &mut Vec<Message>) -> SubscriptionHandle {
        let id = Uuid::new_v4().simple().to_string();
        let (state, state_rx) = watch::channel(SubscriptionState::Pending);
        let record = Record {
            name: name.to_string(),
            params,
            ready: false,
            stopping: false,
            state,
        };
        out.push(record.sub_message(&id));
        self.records.insert(id.clone(), record);
        SubscriptionHandle {
            id,
            name: name.to_string(),
            state: state_rx,
        }
    }

    /// Ask the server to stop. The record stays until `nosub`.
    pub fn unsubscribe(&mut self, id: &str, out: &mut Vec<Message>) -> bool {
        match self.records.get_mut(id) {
            Some(record) if !record.stopping => {
                record.stopping = true;
                out.push(Message::Unsub { id: id.to_string() });
                true
            }
            _ => false,
        }
    }

    /// Flip ready once. Returns true when this call made it ready.
    pub fn mark_ready(&mut self, id: &str) -> bool {
        let Some(record) = self.records.get_mut(id) else {
            return false;
        };
        if record.ready || record.stopping {
            return false;
        }
        record.ready = true;
        record.state.send_replace(SubscriptionState::Ready);
        true
    }

    /// Server ended the subscription. Returns the record's name if known.
    pub fn on_nosub(&mut self, id: &str, error: Option<MethodError>) -> Option<String> {
        let record = self.records.shift_remove(id)?;
        if let Some(e) = &error {
            log::warn!("Subscription {} ({id}) stopped: {e}", record.name);
        }
        record.state.send_replace(SubscriptionState::Stopped(error));
        Some(record.name)
    }

    /// Resend every live subscription on a fresh transport. Subscriptions
    /// waiting for `nosub` are dropped: the new session never had them.
    pub fn on_reset(&mut self, out: &mut Vec<Message>) -> Vec<String> {
        let stopped: Vec<String> = self
            .records
            .iter()
            .filter(|(_, r)| r.stopping)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stopped {
            if let Some(record) = self.records.shift_remove(id) {
                record.state.send_replace(SubscriptionState::Stopped(None));
            }
        }
        for (id, record) in &self.records {
            out.push(record.sub_message(id));
        }
        stopped
    }

    /// Subscriptions that were ready before the transport dropped.
    pub fn ready_ids(&self) -> Vec<String> {
        self.records
            .iter()
            .filter(|(_, r)| r.ready)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn close(&mut self) {
        for (_, record) in self.records.drain(..) {
            record.state.send_replace(SubscriptionState::Stopped(None));
        }
    }
}
