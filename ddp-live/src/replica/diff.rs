//! Structural diffing between two states of a collection.
//!
//! `diff_maps` compares unordered id → document maps. `diff_ordered`
//! compares two ordered sequences and keeps the longest run of documents
//! whose relative order survived (a longest increasing subsequence over
//! old positions), so only documents outside that run get `MovedBefore`.
//!
//! Reference: Hunt & Szymanski, A Fast Algorithm for Computing Longest
//! Common Subsequences (1977)

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::ejson::{FieldChanges, Fields};

use super::ReplicaEvent;

/// Field-level difference taking `old` to `new`.
pub fn make_changed_fields(new: &Fields, old: &Fields) -> FieldChanges {
    let mut changes = FieldChanges::new();
    for (key, value) in new {
        if old.get(key) != Some(value) {
            changes.insert(key.clone(), Some(value.clone()));
        }
    }
    for key in old.keys() {
        if !new.contains_key(key) {
            changes.insert(key.clone(), None);
        }
    }
    changes
}

/// Apply field changes in place. `None` clears the field.
pub fn apply_changes(doc: &mut Fields, changes: &FieldChanges) {
    for (key, value) in changes {
        match value {
            Some(v) => {
                doc.insert(key.clone(), v.clone());
            }
            None => {
                doc.remove(key);
            }
        }
    }
}

/// Unordered diff: removed, added, then changed, each in key order.
pub fn diff_maps(old: &BTreeMap<String, Fields>, new: &BTreeMap<String, Fields>) -> Vec<ReplicaEvent> {
    let mut events = Vec::new();
    for (id, previous) in old {
        if !new.contains_key(id) {
            events.push(ReplicaEvent::Removed {
                id: id.clone(),
                previous: previous.clone(),
            });
        }
    }
    for (id, fields) in new {
        match old.get(id) {
            None => events.push(ReplicaEvent::Added {
                id: id.clone(),
                fields: fields.clone(),
                before: None,
            }),
            Some(previous) if previous != fields => events.push(ReplicaEvent::Changed {
                id: id.clone(),
                changes: make_changed_fields(fields, previous),
                previous: previous.clone(),
            }),
            Some(_) => {}
        }
    }
    events
}

/// Ordered diff taking the `old` sequence to the `new` one.
///
/// Applying the events in order to `old` yields `new`: removals first,
/// then, group by group between unmoved anchors, additions and moves placed
/// before the next anchor, with field changes alongside.
pub fn diff_ordered(old: &[(String, Fields)], new: &[(String, Fields)]) -> Vec<ReplicaEvent> {
    let old_index: HashMap<&str, usize> = old
        .iter()
        .enumerate()
        .map(|(i, (id, _))| (id.as_str(), i))
        .collect();
    let new_ids: HashSet<&str> = new.iter().map(|(id, _)| id.as_str()).collect();

    // Longest increasing subsequence of old positions, in new order.
    // seq_ends[j] is the new-index ending the best run of length j + 1.
    let mut seq_ends: Vec<usize> = Vec::new();
    let mut back: Vec<Option<usize>> = vec![None; new.len()];
    for (i, (id, _)) in new.iter().enumerate() {
        let Some(&old_pos) = old_index.get(id.as_str()) else {
            continue;
        };
        let mut j = seq_ends.len();
        while j > 0 {
            let tail_pos = old_index[new[seq_ends[j - 1]].0.as_str()];
            if tail_pos < old_pos {
                break;
            }
            j -= 1;
        }
        back[i] = if j == 0 { None } else { Some(seq_ends[j - 1]) };
        if j == seq_ends.len() {
            seq_ends.push(i);
        } else {
            seq_ends[j] = i;
        }
    }

    let mut unmoved = Vec::with_capacity(seq_ends.len() + 1);
    let mut cursor = seq_ends.last().copied();
    while let Some(i) = cursor {
        unmoved.push(i);
        cursor = back[i];
    }
    unmoved.reverse();
    unmoved.push(new.len());

    let mut events = Vec::new();
    for (id, previous) in old {
        if !new_ids.contains(id.as_str()) {
            events.push(ReplicaEvent::Removed {
                id: id.clone(),
                previous: previous.clone(),
            });
        }
    }

    let mut start = 0;
    for end in unmoved {
        let anchor = new.get(end).map(|(id, _)| id.clone());
        for (id, fields) in &new[start..end] {
            match old_index.get(id.as_str()) {
                None => events.push(ReplicaEvent::Added {
                    id: id.clone(),
                    fields: fields.clone(),
                    before: anchor.clone(),
                }),
                Some(&old_pos) => {
                    let previous = &old[old_pos].1;
                    push_changed(&mut events, id, fields, previous);
                    events.push(ReplicaEvent::MovedBefore {
                        id: id.clone(),
                        before: anchor.clone(),
                    });
                }
            }
        }
        if let Some((id, fields)) = new.get(end) {
            if let Some(&old_pos) = old_index.get(id.as_str()) {
                push_changed(&mut events, id, fields, &old[old_pos].1);
            }
        }
        start = end + 1;
    }
    events
}

fn push_changed(events: &mut Vec<ReplicaEvent>, id: &str, fields: &Fields, previous: &Fields) {
    let changes = make_changed_fields(fields, previous);
    if !changes.is_empty() {
        events.push(ReplicaEvent::Changed {
            id: id.to_string(),
            changes,
            previous: previous.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ejson::{fields, Value};

    fn doc(n: i64) -> Fields {
        fields([("n", Value::from(n))])
    }

    fn seq(items: &[(&str, i64)]) -> Vec<(String, Fields)> {
        items.iter().map(|(id, n)| (id.to_string(), doc(*n))).collect()
    }

    #[test]
    fn test_make_changed_fields() {
        let old = fields([("a", Value::from(1)), ("b", Value::from(2))]);
        let new = fields([("a", Value::from(1)), ("b", Value::from(3)), ("c", Value::from(4))]);
        let changes = make_changed_fields(&new, &old);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes["b"], Some(Value::from(3)));
        assert_eq!(changes["c"], Some(Value::from(4)));

        let cleared = make_changed_fields(&fields([("a", Value::from(1))]), &old);
        assert_eq!(cleared["b"], None);
    }

    #[test]
    fn test_apply_changes_inverts_make() {
        let mut old = fields([("a", Value::from(1)), ("b", Value::from(2))]);
        let new = fields([("a", Value::from("x")), ("z", Value::Null)]);
        let changes = make_changed_fields(&new, &old);
        apply_changes(&mut old, &changes);
        assert_eq!(old, new);
    }

    #[test]
    fn test_diff_maps() {
        let old: BTreeMap<_, _> = [("a".to_string(), doc(1)), ("b".to_string(), doc(2))].into();
        let new: BTreeMap<_, _> = [("b".to_string(), doc(3)), ("c".to_string(), doc(4))].into();
        let events = diff_maps(&old, &new);
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], ReplicaEvent::Removed { id, .. } if id == "a"));
        assert!(matches!(&events[1], ReplicaEvent::Changed { id, previous, .. } if id == "b" && *previous == doc(2)));
        assert!(matches!(&events[2], ReplicaEvent::Added { id, .. } if id == "c"));
    }

    #[test]
    fn test_diff_ordered_identity_is_empty() {
        let s = seq(&[("a", 1), ("b", 2), ("c", 3)]);
        assert!(diff_ordered(&s, &s).is_empty());
    }

    #[test]
    fn test_diff_ordered_single_move() {
        let old = seq(&[("a", 1), ("b", 2), ("c", 3), ("d", 4)]);
        let new = seq(&[("d", 4), ("a", 1), ("b", 2), ("c", 3)]);
        let events = diff_ordered(&old, &new);
        assert_eq!(
            events,
            vec![ReplicaEvent::MovedBefore {
                id: "d".into(),
                before: Some("a".into())
            }]
        );
    }

    #[test]
    fn test_diff_ordered_add_remove_change() {
        let old = seq(&[("a", 1), ("b", 2), ("c", 3)]);
        let new = seq(&[("a", 1), ("x", 9), ("c", 30)]);
        let events = diff_ordered(&old, &new);
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], ReplicaEvent::Removed { id, .. } if id == "b"));
        assert!(matches!(&events[1], ReplicaEvent::Added { id, before, .. }
            if id == "x" && before.as_deref() == Some("c")));
        assert!(matches!(&events[2], ReplicaEvent::Changed { id, .. } if id == "c"));
    }

    #[test]
    fn test_diff_ordered_append_at_end() {
        let old = seq(&[("a", 1)]);
        let new = seq(&[("a", 1), ("b", 2)]);
        let events = diff_ordered(&old, &new);
        assert_eq!(
            events,
            vec![ReplicaEvent::Added {
                id: "b".into(),
                fields: doc(2),
                before: None
            }]
        );
    }
}
