//! Per-session merge of documents published by several subscriptions.
//!
//! ```text
//! sub A: users/u1 {name: "Ann", age: 3}  ─┐
//!                                         ├─► client sees {name: "Ann", age: 3, role: "x"}
//! sub B: users/u1 {name: "Ann2", role: "x"} ┘   (A's name wins: it was first)
//! ```
//!
//! Each field keeps a precedence list of (subscription, value); the head is
//! what the client sees. A document stays on the client while at least one
//! subscription publishes it.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::ServerError;
use crate::ejson::{FieldChanges, Fields, Value};
use crate::protocol::Message;

#[derive(Debug, Clone)]
struct Precedence {
    sub_id: String,
    value: Value,
}

/// One document as seen by one session.
#[derive(Debug, Default)]
pub struct SessionDocumentView {
    exists_in: BTreeSet<String>,
    data_by_key: BTreeMap<String, Vec<Precedence>>,
}

impl SessionDocumentView {
    /// Fields as the client currently sees them.
    pub fn fields(&self) -> Fields {
        self.data_by_key
            .iter()
            .filter_map(|(key, list)| list.first().map(|p| (key.clone(), p.value.clone())))
            .collect()
    }

    /// Fields as published by one subscription.
    pub fn fields_of(&self, sub_id: &str) -> Fields {
        self.data_by_key
            .iter()
            .filter_map(|(key, list)| {
                list.iter()
                    .find(|p| p.sub_id == sub_id)
                    .map(|p| (key.clone(), p.value.clone()))
            })
            .collect()
    }

    pub fn exists_in(&self, sub_id: &str) -> bool {
        self.exists_in.contains(sub_id)
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &str> {
        self.exists_in.iter().map(String::as_str)
    }

    fn clear_field(&mut self, sub_id: &str, key: &str, changes: &mut FieldChanges) {
        let Some(list) = self.data_by_key.get_mut(key) else {
            return;
        };
        let mut removed_head = None;
        if let Some(pos) = list.iter().position(|p| p.sub_id == sub_id) {
            let removed = list.remove(pos);
            if pos == 0 {
                removed_head = Some(removed.value);
            }
        }
        match list.first() {
            None => {
                self.data_by_key.remove(key);
                changes.insert(key.to_string(), None);
            }
            Some(head) => {
                if removed_head.is_some_and(|old| old != head.value) {
                    changes.insert(key.to_string(), Some(head.value.clone()));
                }
            }
        }
    }

    fn change_field(&mut self, sub_id: &str, key: &str, value: Value, changes: &mut FieldChanges, is_add: bool) {
        let Some(list) = self.data_by_key.get_mut(key) else {
            changes.insert(key.to_string(), Some(value.clone()));
            self.data_by_key.insert(
                key.to_string(),
                vec![Precedence {
                    sub_id: sub_id.to_string(),
                    value,
                }],
            );
            return;
        };
        let existing = if is_add {
            None
        } else {
            list.iter().position(|p| p.sub_id == sub_id)
        };
        match existing {
            Some(pos) => {
                if pos == 0 && list[0].value != value {
                    changes.insert(key.to_string(), Some(value.clone()));
                }
                list[pos].value = value;
            }
            None => list.push(Precedence {
                sub_id: sub_id.to_string(),
                value,
            }),
        }
    }
}

/// All documents of one collection as seen by one session.
#[derive(Debug)]
pub struct SessionCollectionView {
    name: String,
    documents: HashMap<String, SessionDocumentView>,
}

impl SessionCollectionView {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            documents: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn document(&self, id: &str) -> Option<&SessionDocumentView> {
        self.documents.get(id)
    }

    pub fn added(&mut self, sub_id: &str, id: &str, fields: Fields, out: &mut Vec<Message>) {
        let is_new = !self.documents.contains_key(id);
        let view = self.documents.entry(id.to_string()).or_default();
        view.exists_in.insert(sub_id.to_string());
        let mut changes = FieldChanges::new();
        for (key, value) in fields {
            view.change_field(sub_id, &key, value, &mut changes, true);
        }
        if is_new {
            out.push(Message::Added {
                collection: self.name.clone(),
                id: id.to_string(),
                fields: changes.into_iter().filter_map(|(k, v)| v.map(|v| (k, v))).collect(),
            });
        } else {
            self.send_changed(id, changes, out);
        }
    }

    pub fn changed(
        &mut self,
        sub_id: &str,
        id: &str,
        changed: &FieldChanges,
        out: &mut Vec<Message>,
    ) -> Result<(), ServerError> {
        let view = self.documents.get_mut(id).ok_or_else(|| unknown(&self.name, id))?;
        let mut changes = FieldChanges::new();
        for (key, value) in changed {
            match value {
                Some(value) => view.change_field(sub_id, key, value.clone(), &mut changes, false),
                None => view.clear_field(sub_id, key, &mut changes),
            }
        }
        self.send_changed(id, changes, out);
        Ok(())
    }

    pub fn removed(&mut self, sub_id: &str, id: &str, out: &mut Vec<Message>) -> Result<(), ServerError> {
        let view = self.documents.get_mut(id).ok_or_else(|| unknown(&self.name, id))?;
        view.exists_in.remove(sub_id);
        if view.exists_in.is_empty() {
            self.documents.remove(id);
            out.push(Message::Removed {
                collection: self.name.clone(),
                id: id.to_string(),
            });
            return Ok(());
        }
        let mut changes = FieldChanges::new();
        let keys: Vec<String> = view.data_by_key.keys().cloned().collect();
        for key in keys {
            view.clear_field(sub_id, &key, &mut changes);
        }
        self.send_changed(id, changes, out);
        Ok(())
    }

    fn send_changed(&self, id: &str, changes: FieldChanges, out: &mut Vec<Message>) {
        if changes.is_empty() {
            return;
        }
        out.push(Message::Changed {
            collection: self.name.clone(),
            id: id.to_string(),
            fields: changes,
        });
    }
}

fn unknown(collection: &str, id: &str) -> ServerError {
    ServerError::UnknownDocument {
        collection: collection.to_string(),
        id: id.to_string(),
    }
}

/// Every collection view of one session.
#[derive(Debug, Default)]
pub struct MergeBox {
    collections: HashMap<String, SessionCollectionView>,
}

impl MergeBox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collection(&self, name: &str) -> Option<&SessionCollectionView> {
        self.collections.get(name)
    }

    pub fn document(&self, collection: &str, id: &str) -> Option<&SessionDocumentView> {
        self.collections.get(collection)?.document(id)
    }

    /// Documents across all collections.
    pub fn len(&self) -> usize {
        self.collections.values().map(SessionCollectionView::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn added(&mut self, sub_id: &str, collection: &str, id: &str, fields: Fields, out: &mut Vec<Message>) {
        self.collections
            .entry(collection.to_string())
            .or_insert_with(|| SessionCollectionView::new(collection))
            .added(sub_id, id, fields, out);
    }

    pub fn changed(
        &mut self,
        sub_id: &str,
        collection: &str,
        id: &str,
        changes: &FieldChanges,
        out: &mut Vec<Message>,
    ) -> Result<(), ServerError> {
        match self.collections.get_mut(collection) {
            Some(view) => view.changed(sub_id, id, changes, out),
            None => Err(unknown(collection, id)),
        }
    }

    pub fn removed(&mut self, sub_id: &str, collection: &str, id: &str, out: &mut Vec<Message>) -> Result<(), ServerError> {
        let Some(view) = self.collections.get_mut(collection) else {
            return Err(unknown(collection, id));
        };
        view.removed(sub_id, id, out)?;
        if view.is_empty() {
            self.collections.remove(collection);
        }
        Ok(())
    }
}
