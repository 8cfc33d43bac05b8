//! Insertion-ordered dictionary with O(1) positional edits.
//!
//! A doubly linked list threaded through a hash map: each node stores its
//! neighbours' keys instead of pointers.
//!
//! ```text
//! head ─► [a] ⇄ [b] ⇄ [c] ◄─ tail        index: {a, b, c} → node
//! ```
//!
//! Invariant: every key in the index has exactly one node in the sequence,
//! and walking `next` from `head` visits each node once.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

use super::ReplicaError;

#[derive(Debug, Clone)]
struct Node<K, V> {
    value: V,
    prev: Option<K>,
    next: Option<K>,
}

#[derive(Debug, Clone)]
pub struct OrderedDict<K, V> {
    nodes: HashMap<K, Node<K, V>>,
    head: Option<K>,
    tail: Option<K>,
}

impl<K, V> Default for OrderedDict<K, V> {
    fn default() -> Self {
        Self {
            nodes: HashMap::new(),
            head: None,
            tail: None,
        }
    }
}

impl<K, V> OrderedDict<K, V>
where
    K: Clone + Eq + Hash + Debug,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.nodes.contains_key(key)
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.nodes.get(key).map(|n| &n.value)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.nodes.get_mut(key).map(|n| &mut n.value)
    }

    pub fn first(&self) -> Option<&K> {
        self.head.as_ref()
    }

    pub fn last(&self) -> Option<&K> {
        self.tail.as_ref()
    }

    pub fn next(&self, key: &K) -> Option<&K> {
        self.nodes.get(key).and_then(|n| n.next.as_ref())
    }

    pub fn prev(&self, key: &K) -> Option<&K> {
        self.nodes.get(key).and_then(|n| n.prev.as_ref())
    }

    /// Append at the end.
    pub fn append(&mut self, key: K, value: V) -> Result<(), ReplicaError> {
        self.put_before(key, value, None)
    }

    /// Insert `key` before `before`, or at the end when `before` is `None`.
    pub fn put_before(&mut self, key: K, value: V, before: Option<&K>) -> Result<(), ReplicaError> {
        if self.nodes.contains_key(&key) {
            return Err(ReplicaError::DuplicateKey(format!("{key:?}")));
        }
        if let Some(b) = before {
            if !self.nodes.contains_key(b) {
                return Err(ReplicaError::MissingKey(format!("{b:?}")));
            }
        }
        let node = Node {
            value,
            prev: None,
            next: None,
        };
        self.nodes.insert(key.clone(), node);
        self.link(key, before.cloned());
        Ok(())
    }

    /// Move an existing key before `before` (or to the end).
    pub fn move_before(&mut self, key: &K, before: Option<&K>) -> Result<(), ReplicaError> {
        if !self.nodes.contains_key(key) {
            return Err(ReplicaError::MissingKey(format!("{key:?}")));
        }
        if let Some(b) = before {
            if !self.nodes.contains_key(b) {
                return Err(ReplicaError::MissingKey(format!("{b:?}")));
            }
            if b == key {
                return Ok(());
            }
        }
        let current_next = self.nodes.get(key).and_then(|n| n.next.clone());
        if current_next.as_ref() == before {
            return Ok(());
        }
        self.unlink(key);
        self.link(key.clone(), before.cloned());
        Ok(())
    }

    pub fn remove(&mut self, key: &K) -> Result<V, ReplicaError> {
        if !self.nodes.contains_key(key) {
            return Err(ReplicaError::MissingKey(format!("{key:?}")));
        }
        self.unlink(key);
        self.nodes
            .remove(key)
            .map(|n| n.value)
            .ok_or_else(|| ReplicaError::MissingKey(format!("{key:?}")))
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.head = None;
        self.tail = None;
    }

    /// Walk in sequence order.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            dict: self,
            cursor: self.head.as_ref(),
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.iter().map(|(k, _)| k)
    }

    /// Splice an already-inserted, unlinked node in before `before`.
    fn link(&mut self, key: K, before: Option<K>) {
        let prev = match &before {
            Some(b) => self.nodes.get(b).and_then(|n| n.prev.clone()),
            None => self.tail.clone(),
        };

        if let Some(node) = self.nodes.get_mut(&key) {
            node.prev = prev.clone();
            node.next = before.clone();
        }
        match &prev {
            Some(p) => {
                if let Some(node) = self.nodes.get_mut(p) {
                    node.next = Some(key.clone());
                }
            }
            None => self.head = Some(key.clone()),
        }
        match &before {
            Some(b) => {
                if let Some(node) = self.nodes.get_mut(b) {
                    node.prev = Some(key);
                }
            }
            None => self.tail = Some(key),
        }
    }

    fn unlink(&mut self, key: &K) {
        let (prev, next) = match self.nodes.get_mut(key) {
            Some(node) => (node.prev.take(), node.next.take()),
            None => return,
        };
        match &prev {
            Some(p) => {
                if let Some(node) = self.nodes.get_mut(p) {
                    node.next = next.clone();
                }
            }
            None => self.head = next.clone(),
        }
        match &next {
            Some(n) => {
                if let Some(node) = self.nodes.get_mut(n) {
                    node.prev = prev;
                }
            }
            None => self.tail = prev,
        }
    }
}

pub struct Iter<'a, K, V> {
    dict: &'a OrderedDict<K, V>,
    cursor: Option<&'a K>,
}

impl<'a, K, V> Iterator for Iter<'a, K, V>
where
    K: Eq + Hash,
{
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let key = self.cursor?;
        let (stored_key, node) = self.dict.nodes.get_key_value(key)?;
        self.cursor = node.next.as_ref();
        Some((stored_key, &node.value))
    }
}
