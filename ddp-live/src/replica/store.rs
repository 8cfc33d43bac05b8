//! One replicated collection: ordered documents plus change observers.
//!
//! Two batching tools sit on top of the plain mutations:
//!
//! - **pause/resume**: while paused nothing is emitted; on resume the
//!   observers get the ordered diff between the pre-pause state and now,
//!   so a burst of writes collapses to one notification per net change.
//! - **saved originals**: while saving, the first write to each document
//!   records its prior value (or absence) so speculative writes can be
//!   reconciled later.

use std::collections::HashMap;

use tokio::sync::mpsc;

use crate::ejson::{FieldChanges, Fields};

use super::diff::{apply_changes, diff_ordered, make_changed_fields};
use super::ordered::OrderedDict;
use super::{ReplicaError, ReplicaEvent};

/// Receives change notifications from a [`ReplicaStore`].
pub trait ReplicaObserver: Send {
    fn added_before(&mut self, _collection: &str, _id: &str, _fields: &Fields, _before: Option<&str>) {}
    fn changed(&mut self, _collection: &str, _id: &str, _changes: &FieldChanges, _previous: &Fields) {}
    fn moved_before(&mut self, _collection: &str, _id: &str, _before: Option<&str>) {}
    fn removed(&mut self, _collection: &str, _id: &str, _previous: &Fields) {}
}

/// A change tagged with its collection, as delivered by [`ChannelObserver`].
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedChange {
    pub collection: String,
    pub event: ReplicaEvent,
}

/// Forwards every notification as an [`ObservedChange`] over a channel.
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<ObservedChange>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ObservedChange>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, collection: &str, event: ReplicaEvent) {
        let _ = self.tx.send(ObservedChange {
            collection: collection.to_string(),
            event,
        });
    }
}

impl ReplicaObserver for ChannelObserver {
    fn added_before(&mut self, collection: &str, id: &str, fields: &Fields, before: Option<&str>) {
        self.forward(
            collection,
            ReplicaEvent::Added {
                id: id.to_string(),
                fields: fields.clone(),
                before: before.map(str::to_string),
            },
        );
    }

    fn changed(&mut self, collection: &str, id: &str, changes: &FieldChanges, previous: &Fields) {
        self.forward(
            collection,
            ReplicaEvent::Changed {
                id: id.to_string(),
                changes: changes.clone(),
                previous: previous.clone(),
            },
        );
    }

    fn moved_before(&mut self, collection: &str, id: &str, before: Option<&str>) {
        self.forward(
            collection,
            ReplicaEvent::MovedBefore {
                id: id.to_string(),
                before: before.map(str::to_string),
            },
        );
    }

    fn removed(&mut self, collection: &str, id: &str, previous: &Fields) {
        self.forward(
            collection,
            ReplicaEvent::Removed {
                id: id.to_string(),
                previous: previous.clone(),
            },
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// A server-originated write to one collection.
#[derive(Debug, Clone, PartialEq)]
pub enum DataUpdate {
    Added { id: String, fields: Fields },
    AddedBefore { id: String, fields: Fields, before: Option<String> },
    Changed { id: String, changes: FieldChanges },
    MovedBefore { id: String, before: Option<String> },
    Removed { id: String },
    /// Overwrite with the server's version; `None` means it does not exist.
    Replace { id: String, fields: Option<Fields> },
}

impl DataUpdate {
    pub fn id(&self) -> &str {
        match self {
            Self::Added { id, .. }
            | Self::AddedBefore { id, .. }
            | Self::Changed { id, .. }
            | Self::MovedBefore { id, .. }
            | Self::Removed { id }
            | Self::Replace { id, .. } => id,
        }
    }
}

/// Ordered copy of a collection's documents.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReplicaSnapshot {
    entries: Vec<(String, Fields)>,
}

impl ReplicaSnapshot {
    pub fn entries(&self) -> &[(String, Fields)] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<(String, Fields)> {
        self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub struct ReplicaStore {
    name: String,
    docs: OrderedDict<String, Fields>,
    observers: Vec<(ObserverId, Box<dyn ReplicaObserver>)>,
    next_observer: u64,
    paused: Option<ReplicaSnapshot>,
    originals: Option<HashMap<String, Option<Fields>>>,
}

impl ReplicaStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            docs: OrderedDict::new(),
            observers: Vec::new(),
            next_observer: 0,
            paused: None,
            originals: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.docs.contains(&id.to_string())
    }

    pub fn get(&self, id: &str) -> Option<&Fields> {
        self.docs.get(&id.to_string())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Fields)> {
        self.docs.iter()
    }

    pub fn for_each(&self, mut f: impl FnMut(&str, &Fields)) {
        for (id, fields) in self.docs.iter() {
            f(id, fields);
        }
    }

    /// Register an observer for subsequent changes.
    pub fn observe(&mut self, observer: Box<dyn ReplicaObserver>) -> ObserverId {
        let id = ObserverId(self.next_observer);
        self.next_observer += 1;
        self.observers.push((id, observer));
        id
    }

    pub fn unobserve(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(oid, _)| *oid != id);
        self.observers.len() != before
    }

    pub fn insert(&mut self, id: &str, fields: Fields) -> Result<(), ReplicaError> {
        self.put_before(id, fields, None)
    }

    pub fn put_before(&mut self, id: &str, fields: Fields, before: Option<&str>) -> Result<(), ReplicaError> {
        let key = id.to_string();
        let before_key = before.map(str::to_string);
        if self.docs.contains(&key) {
            return Err(ReplicaError::DuplicateKey(key));
        }
        self.save_original(id);
        self.docs.put_before(key.clone(), fields.clone(), before_key.as_ref())?;
        self.emit(ReplicaEvent::Added {
            id: key,
            fields,
            before: before_key,
        });
        Ok(())
    }

    pub fn move_before(&mut self, id: &str, before: Option<&str>) -> Result<(), ReplicaError> {
        let key = id.to_string();
        let before_key = before.map(str::to_string);
        if self.docs.next(&key) == before_key.as_ref() && self.docs.contains(&key) {
            return Ok(());
        }
        self.docs.move_before(&key, before_key.as_ref())?;
        self.emit(ReplicaEvent::MovedBefore {
            id: key,
            before: before_key,
        });
        Ok(())
    }

    /// Apply field changes to an existing document.
    pub fn update_fields(&mut self, id: &str, changes: &FieldChanges) -> Result<(), ReplicaError> {
        let key = id.to_string();
        if !self.docs.contains(&key) {
            return Err(ReplicaError::MissingKey(key));
        }
        self.save_original(id);
        let Some(doc) = self.docs.get_mut(&key) else {
            return Err(ReplicaError::MissingKey(key));
        };
        let previous = doc.clone();
        apply_changes(doc, changes);
        let effective = make_changed_fields(doc, &previous);
        if !effective.is_empty() {
            self.emit(ReplicaEvent::Changed {
                id: key,
                changes: effective,
                previous,
            });
        }
        Ok(())
    }

    /// Overwrite an existing document's fields.
    pub fn replace(&mut self, id: &str, fields: Fields) -> Result<(), ReplicaError> {
        let key = id.to_string();
        if !self.docs.contains(&key) {
            return Err(ReplicaError::MissingKey(key));
        }
        self.save_original(id);
        let Some(doc) = self.docs.get_mut(&key) else {
            return Err(ReplicaError::MissingKey(key));
        };
        let previous = std::mem::replace(doc, fields);
        let changes = make_changed_fields(doc, &previous);
        if !changes.is_empty() {
            self.emit(ReplicaEvent::Changed {
                id: key,
                changes,
                previous,
            });
        }
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> Result<Fields, ReplicaError> {
        let key = id.to_string();
        if !self.docs.contains(&key) {
            return Err(ReplicaError::MissingKey(key));
        }
        self.save_original(id);
        let previous = self.docs.remove(&key)?;
        self.emit(ReplicaEvent::Removed {
            id: key,
            previous: previous.clone(),
        });
        Ok(previous)
    }

    /// Remove every document, notifying each removal.
    pub fn clear(&mut self) {
        let ids: Vec<String> = self.docs.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.remove(&id) {
                log::error!("Clearing {}: {e}", self.name);
            }
        }
    }

    /// Apply a server write.
    pub fn update(&mut self, update: DataUpdate) -> Result<(), ReplicaError> {
        match update {
            DataUpdate::Added { id, fields } => self.insert(&id, fields),
            DataUpdate::AddedBefore { id, fields, before } => self.put_before(&id, fields, before.as_deref()),
            DataUpdate::Changed { id, changes } => self.update_fields(&id, &changes),
            DataUpdate::MovedBefore { id, before } => self.move_before(&id, before.as_deref()),
            DataUpdate::Removed { id } => self.remove(&id).map(|_| ()),
            DataUpdate::Replace { id, fields } => match (fields, self.contains(&id)) {
                (Some(fields), true) => self.replace(&id, fields),
                (Some(fields), false) => self.insert(&id, fields),
                (None, true) => self.remove(&id).map(|_| ()),
                (None, false) => Ok(()),
            },
        }
    }

    pub fn snapshot(&self) -> ReplicaSnapshot {
        ReplicaSnapshot {
            entries: self.docs.iter().map(|(id, f)| (id.clone(), f.clone())).collect(),
        }
    }

    /// Reset to `snapshot`, notifying observers of the net difference.
    pub fn restore(&mut self, snapshot: ReplicaSnapshot) -> Result<(), ReplicaError> {
        let events = if self.paused.is_some() {
            Vec::new()
        } else {
            diff_ordered(self.snapshot().entries(), snapshot.entries())
        };
        let mut docs = OrderedDict::new();
        for (id, fields) in snapshot.entries {
            docs.append(id, fields)?;
        }
        self.docs = docs;
        for event in events {
            self.emit(event);
        }
        Ok(())
    }

    pub fn is_paused(&self) -> bool {
        self.paused.is_some()
    }

    /// Stop emitting; remember the current state. Nested calls are no-ops.
    pub fn pause_observers(&mut self) {
        if self.paused.is_none() {
            self.paused = Some(self.snapshot());
        }
    }

    /// Emit the net diff since `pause_observers`.
    pub fn resume_observers(&mut self) {
        let Some(before) = self.paused.take() else {
            return;
        };
        if self.observers.is_empty() {
            return;
        }
        let events = diff_ordered(before.entries(), self.snapshot().entries());
        log::trace!("{}: resume emits {} notifications", self.name, events.len());
        for event in events {
            self.emit(event);
        }
    }

    pub fn save_originals(&mut self) -> Result<(), ReplicaError> {
        if self.originals.is_some() {
            return Err(ReplicaError::OriginalsAlreadySaved);
        }
        self.originals = Some(HashMap::new());
        Ok(())
    }

    pub fn retrieve_originals(&mut self) -> Result<HashMap<String, Option<Fields>>, ReplicaError> {
        self.originals.take().ok_or(ReplicaError::OriginalsNotSaved)
    }

    fn save_original(&mut self, id: &str) {
        if let Some(originals) = self.originals.as_mut() {
            if !originals.contains_key(id) {
                originals.insert(id.to_string(), self.docs.get(&id.to_string()).cloned());
            }
        }
    }

    fn emit(&mut self, event: ReplicaEvent) {
        if self.paused.is_some() {
            return;
        }
        for (_, observer) in self.observers.iter_mut() {
            dispatch(observer.as_mut(), &self.name, &event);
        }
    }
}

fn dispatch(observer: &mut dyn ReplicaObserver, collection: &str, event: &ReplicaEvent) {
    match event {
        ReplicaEvent::Added { id, fields, before } => observer.added_before(collection, id, fields, before.as_deref()),
        ReplicaEvent::Changed { id, changes, previous } => observer.changed(collection, id, changes, previous),
        ReplicaEvent::MovedBefore { id, before } => observer.moved_before(collection, id, before.as_deref()),
        ReplicaEvent::Removed { id, previous } => observer.removed(collection, id, previous),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ejson::{fields, Value};

    fn observed(store: &mut ReplicaStore) -> mpsc::UnboundedReceiver<ObservedChange> {
        let (observer, rx) = ChannelObserver::new();
        store.observe(Box::new(observer));
        rx
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ObservedChange>) -> Vec<ReplicaEvent> {
        let mut events = Vec::new();
        while let Ok(change) = rx.try_recv() {
            events.push(change.event);
        }
        events
    }

    fn ids(store: &ReplicaStore) -> Vec<String> {
        store.iter().map(|(id, _)| id.clone()).collect()
    }

    #[test]
    fn test_mutations_notify() {
        let mut store = ReplicaStore::new("users");
        let mut rx = observed(&mut store);

        store.insert("u1", fields([("name", "Ann")])).unwrap();
        store.put_before("u0", fields([("name", "Zed")]), Some("u1")).unwrap();
        store.move_before("u0", None).unwrap();
        store.update_fields("u1", &[("name".to_string(), Some(Value::from("Anne")))].into()).unwrap();
        store.remove("u0").unwrap();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 5);
        assert!(matches!(&events[1], ReplicaEvent::Added { before: Some(b), .. } if b == "u1"));
        assert!(matches!(&events[3], ReplicaEvent::Changed { previous, .. } if previous["name"] == Value::from("Ann")));
        assert_eq!(ids(&store), vec!["u1"]);
    }

    #[test]
    fn test_observer_gets_collection_name() {
        let mut store = ReplicaStore::new("posts");
        let mut rx = observed(&mut store);
        store.insert("p1", Fields::new()).unwrap();
        assert_eq!(rx.try_recv().unwrap().collection, "posts");
    }

    #[test]
    fn test_noop_change_is_silent() {
        let mut store = ReplicaStore::new("c");
        store.insert("a", fields([("x", 1)])).unwrap();
        let mut rx = observed(&mut store);
        store.replace("a", fields([("x", 1)])).unwrap();
        store.update_fields("a", &[("x".to_string(), Some(Value::from(1)))].into()).unwrap();
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_pause_resume_collapses_writes() {
        let mut store = ReplicaStore::new("c");
        store.insert("a", fields([("x", 1)])).unwrap();
        store.insert("b", fields([("x", 2)])).unwrap();
        let mut rx = observed(&mut store);

        store.pause_observers();
        store.replace("a", fields([("x", 10)])).unwrap();
        store.replace("a", fields([("x", 1)])).unwrap();
        store.remove("b").unwrap();
        store.insert("b", fields([("x", 2)])).unwrap();
        store.insert("c", fields([("x", 3)])).unwrap();
        store.remove("c").unwrap();
        assert!(drain(&mut rx).is_empty());
        store.resume_observers();

        // Net no-op.
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_resume_emits_net_changes() {
        let mut store = ReplicaStore::new("c");
        store.insert("a", fields([("x", 1)])).unwrap();
        let mut rx = observed(&mut store);

        store.pause_observers();
        store.replace("a", fields([("x", 5)])).unwrap();
        store.replace("a", fields([("x", 6)])).unwrap();
        store.insert("b", Fields::new()).unwrap();
        store.resume_observers();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], ReplicaEvent::Changed { changes, .. } if changes["x"] == Some(Value::from(6))));
        assert!(matches!(&events[1], ReplicaEvent::Added { id, .. } if id == "b"));
    }

    #[test]
    fn test_snapshot_restore() {
        let mut store = ReplicaStore::new("c");
        store.insert("a", fields([("x", 1)])).unwrap();
        store.insert("b", fields([("x", 2)])).unwrap();
        let snapshot = store.snapshot();
        let mut rx = observed(&mut store);

        store.remove("a").unwrap();
        store.insert("z", Fields::new()).unwrap();
        drain(&mut rx);

        store.restore(snapshot.clone()).unwrap();
        assert_eq!(store.snapshot(), snapshot);
        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_saved_originals_keep_first_value() {
        let mut store = ReplicaStore::new("c");
        store.insert("a", fields([("x", 1)])).unwrap();
        store.save_originals().unwrap();
        assert_eq!(store.save_originals(), Err(ReplicaError::OriginalsAlreadySaved));

        store.replace("a", fields([("x", 2)])).unwrap();
        store.replace("a", fields([("x", 3)])).unwrap();
        store.insert("b", Fields::new()).unwrap();

        let originals = store.retrieve_originals().unwrap();
        assert_eq!(originals["a"], Some(fields([("x", 1)])));
        assert_eq!(originals["b"], None);
    }

    #[test]
    fn test_server_updates() {
        let mut store = ReplicaStore::new("c");
        store
            .update(DataUpdate::Added {
                id: "a".into(),
                fields: fields([("x", 1)]),
            })
            .unwrap();
        store
            .update(DataUpdate::AddedBefore {
                id: "b".into(),
                fields: Fields::new(),
                before: Some("a".into()),
            })
            .unwrap();
        assert_eq!(ids(&store), vec!["b", "a"]);

        store
            .update(DataUpdate::Replace {
                id: "a".into(),
                fields: None,
            })
            .unwrap();
        store
            .update(DataUpdate::Replace {
                id: "n".into(),
                fields: Some(fields([("y", 2)])),
            })
            .unwrap();
        assert_eq!(ids(&store), vec!["b", "n"]);

        let err = store
            .update(DataUpdate::Changed {
                id: "ghost".into(),
                changes: FieldChanges::new(),
            })
            .unwrap_err();
        assert_eq!(err, ReplicaError::MissingKey("ghost".into()));
        assert!(matches!(
            store.update(DataUpdate::Added {
                id: "b".into(),
                fields: Fields::new()
            }),
            Err(ReplicaError::DuplicateKey(_))
        ));
    }

    #[test]
    fn test_unobserve() {
        let mut store = ReplicaStore::new("c");
        let (observer, mut rx) = ChannelObserver::new();
        let id = store.observe(Box::new(observer));
        assert!(store.unobserve(id));
        store.insert("a", Fields::new()).unwrap();
        assert!(rx.try_recv().is_err());
    }
}
