//! Client-side replica of server collections.
//!
//! ```text
//! Replica
//!   ├── "users" ── ReplicaStore ── OrderedDict<id, Fields> ── observers
//!   ├── "posts" ── ReplicaStore ── ...
//!   └── ...           (created on first use)
//! ```
//!
//! Stores are owned by the connection task and mutated only from there;
//! observers receive cloned values.

pub mod diff;
pub mod ordered;
pub mod store;

use std::collections::HashMap;

use crate::ejson::{FieldChanges, Fields};

pub use diff::{apply_changes, diff_maps, diff_ordered, make_changed_fields};
pub use ordered::OrderedDict;
pub use store::{
    ChannelObserver, DataUpdate, ObservedChange, ObserverId, ReplicaObserver, ReplicaSnapshot, ReplicaStore,
};

/// Replica consistency errors. These indicate a protocol or programming
/// bug and are surfaced immediately.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplicaError {
    #[error("duplicate key {0}")]
    DuplicateKey(String),
    #[error("missing key {0}")]
    MissingKey(String),
    #[error("already saving originals")]
    OriginalsAlreadySaved,
    #[error("not saving originals")]
    OriginalsNotSaved,
}

/// One structural change to a collection, with cloned values.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicaEvent {
    Added {
        id: String,
        fields: Fields,
        /// Placed before this id, or at the end
        before: Option<String>,
    },
    Changed {
        id: String,
        changes: FieldChanges,
        previous: Fields,
    },
    MovedBefore {
        id: String,
        before: Option<String>,
    },
    Removed {
        id: String,
        previous: Fields,
    },
}

impl ReplicaEvent {
    pub fn id(&self) -> &str {
        match self {
            Self::Added { id, .. }
            | Self::Changed { id, .. }
            | Self::MovedBefore { id, .. }
            | Self::Removed { id, .. } => id,
        }
    }
}

/// Pre-stub value of a document touched while originals were being saved.
/// `original` is `None` when the document did not exist.
#[derive(Debug, Clone, PartialEq)]
pub struct OriginalDoc {
    pub collection: String,
    pub id: String,
    pub original: Option<Fields>,
}

/// All collections of one connection.
#[derive(Default)]
pub struct Replica {
    stores: HashMap<String, ReplicaStore>,
    saving_originals: bool,
}

impl Replica {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collection(&self, name: &str) -> Option<&ReplicaStore> {
        self.stores.get(name)
    }

    /// Get a collection, creating it on first use.
    pub fn collection_mut(&mut self, name: &str) -> &mut ReplicaStore {
        let saving = self.saving_originals;
        self.stores.entry(name.to_string()).or_insert_with(|| {
            let mut store = ReplicaStore::new(name);
            if saving {
                // A fresh store cannot already be saving.
                let _ = store.save_originals();
            }
            store
        })
    }

    pub fn collection_names(&self) -> impl Iterator<Item = &str> {
        self.stores.keys().map(String::as_str)
    }

    /// Apply a server data update to one collection.
    pub fn update(&mut self, collection: &str, update: DataUpdate) -> Result<(), ReplicaError> {
        self.collection_mut(collection).update(update)
    }

    pub fn observe(&mut self, collection: &str, observer: Box<dyn ReplicaObserver>) -> ObserverId {
        self.collection_mut(collection).observe(observer)
    }

    pub fn pause_all(&mut self) {
        for store in self.stores.values_mut() {
            store.pause_observers();
        }
    }

    pub fn resume_all(&mut self) {
        for store in self.stores.values_mut() {
            store.resume_observers();
        }
    }

    /// Drop every document in every collection (session reset).
    pub fn clear_all(&mut self) {
        for store in self.stores.values_mut() {
            store.clear();
        }
    }

    pub fn save_originals(&mut self) -> Result<(), ReplicaError> {
        if self.saving_originals {
            return Err(ReplicaError::OriginalsAlreadySaved);
        }
        self.saving_originals = true;
        for store in self.stores.values_mut() {
            store.save_originals()?;
        }
        Ok(())
    }

    pub fn retrieve_originals(&mut self) -> Result<Vec<OriginalDoc>, ReplicaError> {
        if !self.saving_originals {
            return Err(ReplicaError::OriginalsNotSaved);
        }
        self.saving_originals = false;
        let mut docs = Vec::new();
        for (name, store) in self.stores.iter_mut() {
            for (id, original) in store.retrieve_originals()? {
                docs.push(OriginalDoc {
                    collection: name.clone(),
                    id,
                    original,
                });
            }
        }
        Ok(docs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ejson::{fields, Value};

    #[test]
    fn test_collections_created_on_demand() {
        let mut replica = Replica::new();
        assert!(replica.collection("users").is_none());
        replica
            .update(
                "users",
                DataUpdate::Added {
                    id: "u1".into(),
                    fields: fields([("name", "Ann")]),
                },
            )
            .unwrap();
        assert_eq!(replica.collection("users").unwrap().len(), 1);
    }

    #[test]
    fn test_originals_cover_new_collections() {
        let mut replica = Replica::new();
        replica.collection_mut("a").insert("x", fields([("v", 1)])).unwrap();
        replica.save_originals().unwrap();
        replica.collection_mut("a").remove("x").unwrap();
        replica.collection_mut("b").insert("y", fields([("v", 2)])).unwrap();

        let mut originals = replica.retrieve_originals().unwrap();
        originals.sort_by(|l, r| l.collection.cmp(&r.collection));
        assert_eq!(originals.len(), 2);
        assert_eq!(originals[0].original, Some(fields([("v", Value::from(1))])));
        assert_eq!(originals[1].original, None);
        assert!(matches!(replica.retrieve_originals(), Err(ReplicaError::OriginalsNotSaved)));
    }

    #[test]
    fn test_clear_all() {
        let mut replica = Replica::new();
        replica.collection_mut("a").insert("x", Fields::new()).unwrap();
        replica.collection_mut("b").insert("y", Fields::new()).unwrap();
        replica.clear_all();
        assert!(replica.collection("a").unwrap().is_empty());
        assert!(replica.collection("b").unwrap().is_empty());
    }
}
