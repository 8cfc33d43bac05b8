//! Server-side document storage.
//!
//! ```text
//! method handler ──► DocumentStore::insert/update/remove
//!                          │ (under the write lock)
//!                          ▼
//!                     ChangeFeed ──► every session's receiver
//! ```
//!
//! Changes are published while the write lock is held, so every receiver
//! sees them in commit order.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use indexmap::IndexMap;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::feed::ChangeFeed;
use crate::ejson::{FieldChanges, Fields, Value};
use crate::protocol::MethodError;
use crate::replica::apply_changes;

/// Storage errors.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    /// Insert with an id that is already taken
    DuplicateId { collection: String, id: String },
    /// Update or remove of a missing document
    NotFound { collection: String, id: String },
    /// A writer panicked while holding the lock
    Poisoned,
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DuplicateId { collection, id } => write!(f, "Duplicate id {id} in {collection}"),
            StoreError::NotFound { collection, id } => write!(f, "Document not found: {collection}/{id}"),
            StoreError::Poisoned => write!(f, "Store lock poisoned"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<StoreError> for MethodError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { .. } => MethodError::new(404, e.to_string()),
            StoreError::DuplicateId { .. } => MethodError::new(409, e.to_string()),
            StoreError::Poisoned => {
                log::error!("{e}");
                MethodError::new(500, "Internal server error")
            }
        }
    }
}

/// One committed write.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreChange {
    Added {
        collection: String,
        id: String,
        fields: Fields,
    },
    Changed {
        collection: String,
        id: String,
        changes: FieldChanges,
        /// Whole document after the change
        fields: Fields,
    },
    Removed {
        collection: String,
        id: String,
    },
}

impl StoreChange {
    pub fn collection(&self) -> &str {
        match self {
            Self::Added { collection, .. } | Self::Changed { collection, .. } | Self::Removed { collection, .. } => {
                collection
            }
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Added { id, .. } | Self::Changed { id, .. } | Self::Removed { id, .. } => id,
        }
    }
}

/// Top-level field equality. An empty selector matches everything.
pub type Selector = Fields;

pub fn matches(selector: &Selector, doc: &Fields) -> bool {
    selector.iter().all(|(key, value)| doc.get(key) == Some(value))
}

/// A cursor a publication exposes: documents of one collection matching
/// a selector, optionally restricted to some fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: String,
    pub selector: Selector,
    pub fields: Option<BTreeSet<String>>,
}

impl Query {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            selector: Selector::new(),
            fields: None,
        }
    }

    pub fn filter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.selector.insert(key.into(), value.into());
        self
    }

    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn matches(&self, doc: &Fields) -> bool {
        matches(&self.selector, doc)
    }

    pub fn project(&self, doc: &Fields) -> Fields {
        match &self.fields {
            Some(keep) => doc
                .iter()
                .filter(|(k, _)| keep.contains(*k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            None => doc.clone(),
        }
    }
}

/// Storage backend used by the server.
pub trait DocumentStore: Send + Sync {
    /// Matching documents in insertion order.
    fn find(&self, collection: &str, selector: &Selector) -> Result<Vec<(String, Fields)>, StoreError>;

    fn get(&self, collection: &str, id: &str) -> Result<Option<Fields>, StoreError>;

    /// Insert a document. A fresh id is generated when `id` is `None`.
    fn insert(&self, collection: &str, id: Option<String>, fields: Fields) -> Result<String, StoreError>;

    /// Apply field changes; `None` values clear the field.
    fn update(&self, collection: &str, id: &str, changes: &FieldChanges) -> Result<(), StoreError>;

    fn remove(&self, collection: &str, id: &str) -> Result<(), StoreError>;

    /// Receive every change committed after this call.
    fn subscribe(&self) -> broadcast::Receiver<Arc<StoreChange>>;
}

/// In-memory store.
pub struct MemoryStore {
    collections: RwLock<HashMap<String, IndexMap<String, Fields>>>,
    feed: ChangeFeed,
}

impl MemoryStore {
    pub fn new(feed_capacity: usize) -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            feed: ChangeFeed::new(feed_capacity),
        }
    }

    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl DocumentStore for MemoryStore {
    fn find(&self, collection: &str, selector: &Selector) -> Result<Vec<(String, Fields)>, StoreError> {
        let collections = self.collections.read().map_err(|_| StoreError::Poisoned)?;
        Ok(collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .filter(|(_, doc)| matches(selector, doc))
                    .map(|(id, doc)| (id.clone(), doc.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn get(&self, collection: &str, id: &str) -> Result<Option<Fields>, StoreError> {
        let collections = self.collections.read().map_err(|_| StoreError::Poisoned)?;
        Ok(collections.get(collection).and_then(|docs| docs.get(id)).cloned())
    }

    fn insert(&self, collection: &str, id: Option<String>, fields: Fields) -> Result<String, StoreError> {
        let mut collections = self.collections.write().map_err(|_| StoreError::Poisoned)?;
        let docs = collections.entry(collection.to_string()).or_default();
        let id = id.unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        if docs.contains_key(&id) {
            return Err(StoreError::DuplicateId {
                collection: collection.to_string(),
                id,
            });
        }
        docs.insert(id.clone(), fields.clone());
        self.feed.publish(StoreChange::Added {
            collection: collection.to_string(),
            id: id.clone(),
            fields,
        });
        Ok(id)
    }

    fn update(&self, collection: &str, id: &str, changes: &FieldChanges) -> Result<(), StoreError> {
        let mut collections = self.collections.write().map_err(|_| StoreError::Poisoned)?;
        let Some(doc) = collections.get_mut(collection).and_then(|docs| docs.get_mut(id)) else {
            return Err(StoreError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        };
        // Only report fields whose value actually moved.
        let effective: FieldChanges = changes
            .iter()
            .filter(|(key, value)| doc.get(*key) != value.as_ref())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if effective.is_empty() {
            return Ok(());
        }
        apply_changes(doc, &effective);
        let fields = doc.clone();
        self.feed.publish(StoreChange::Changed {
            collection: collection.to_string(),
            id: id.to_string(),
            changes: effective,
            fields,
        });
        Ok(())
    }

    fn remove(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        let mut collections = self.collections.write().map_err(|_| StoreError::Poisoned)?;
        let removed = collections
            .get_mut(collection)
            .and_then(|docs| docs.shift_remove(id));
        if removed.is_none() {
            return Err(StoreError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        }
        self.feed.publish(StoreChange::Removed {
            collection: collection.to_string(),
            id: id.to_string(),
        });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Arc<StoreChange>> {
        self.feed.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ejson::fields;

    #[test]
    fn test_insert_find_in_order() {
        let store = MemoryStore::default();
        store.insert("items", Some("b".into()), fields([("n", 2)])).unwrap();
        store.insert("items", Some("a".into()), fields([("n", 1)])).unwrap();
        let ids: Vec<String> = store
            .find("items", &Selector::new())
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let store = MemoryStore::default();
        let a = store.insert("items", None, Fields::new()).unwrap();
        let b = store.insert("items", None, Fields::new()).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let store = MemoryStore::default();
        store.insert("items", Some("a".into()), Fields::new()).unwrap();
        let err = store.insert("items", Some("a".into()), Fields::new()).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateId { .. }));
        assert!(MethodError::from(err).reason.unwrap().contains("Duplicate"));
    }

    #[test]
    fn test_selector_matching() {
        let store = MemoryStore::default();
        store.insert("items", Some("a".into()), fields([("owner", "ann")])).unwrap();
        store.insert("items", Some("b".into()), fields([("owner", "bob")])).unwrap();
        let query = Query::new("items").filter("owner", "bob");
        let found = store.find("items", &query.selector).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, "b");
    }

    #[test]
    fn test_projection() {
        let query = Query::new("users").fields(["name"]);
        let doc = fields([("name", "Ann"), ("secret", "x")]);
        assert_eq!(query.project(&doc), fields([("name", "Ann")]));
    }

    #[tokio::test]
    async fn test_changes_published_in_order() {
        let store = MemoryStore::default();
        let mut rx = store.subscribe();
        store.insert("items", Some("a".into()), fields([("n", 1)])).unwrap();
        store
            .update("items", "a", &[("n".to_string(), Some(Value::from(2)))].into())
            .unwrap();
        // No-op update publishes nothing.
        store
            .update("items", "a", &[("n".to_string(), Some(Value::from(2)))].into())
            .unwrap();
        store.remove("items", "a").unwrap();

        assert!(matches!(&*rx.recv().await.unwrap(), StoreChange::Added { id, .. } if id == "a"));
        match &*rx.recv().await.unwrap() {
            StoreChange::Changed { changes, fields, .. } => {
                assert_eq!(changes.len(), 1);
                assert_eq!(fields.get("n"), Some(&Value::from(2)));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(&*rx.recv().await.unwrap(), StoreChange::Removed { .. }));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_missing_document_errors() {
        let store = MemoryStore::default();
        assert!(matches!(store.remove("items", "x"), Err(StoreError::NotFound { .. })));
        assert!(matches!(
            store.update("items", "x", &FieldChanges::new()),
            Err(StoreError::NotFound { .. })
        ));
    }
}
