//! Deep Mirror
//!
//! Updates an observable in place so that it matches a JSON source, keeping
//! the identity of every nested store that survives the update.
//!
//! Effects track fields of specific stores. Replacing a nested store with an
//! equal-looking copy would rerun every effect reading it, so mirroring
//! instead edits the existing stores field by field:
//!
//! - Scalars are written only when they differ.
//! - Records: each source key is recursed into or assigned; target keys that
//!   are missing from the source are deleted.
//! - Lists: records are matched by identity (an `id` field by default).
//!   Unmatched target records are removed, unmatched source records are
//!   inserted at their index, and matched records that sit at the wrong index
//!   are moved rather than replaced. Items without identity are written
//!   positionally. The list is finally cut to the source's length.
//!
//! Mirroring a list onto a record or the other way round is an error.

use std::collections::{HashMap, HashSet};

use serde_json::{Map, Value as Json};
use tracing::trace;

use crate::error::ReactiveError;
use crate::reactive::{json_kind_name, untrack, Observable, Value};

/// Identity of a list item.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ItemId {
    Str(String),
    Num(String),
}

impl ItemId {
    fn from_json(json: &Json) -> Option<Self> {
        match json {
            Json::String(s) => Some(ItemId::Str(s.clone())),
            Json::Number(n) => Some(ItemId::Num(n.to_string())),
            _ => None,
        }
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(ItemId::Str(s.to_string())),
            Value::Number(n) => Some(ItemId::Num(n.to_string())),
            _ => None,
        }
    }
}

/// Extracts the identity of list items on both sides of a mirror.
pub trait Identify {
    fn source_id(&self, item: &Map<String, Json>) -> Option<ItemId>;
    fn target_id(&self, item: &Observable) -> Option<ItemId>;
}

/// Identity taken from a string or number field.
#[derive(Debug, Clone, Copy)]
pub struct IdField<'a>(pub &'a str);

impl Default for IdField<'_> {
    fn default() -> Self {
        IdField("id")
    }
}

impl Identify for IdField<'_> {
    fn source_id(&self, item: &Map<String, Json>) -> Option<ItemId> {
        item.get(self.0).and_then(ItemId::from_json)
    }

    fn target_id(&self, item: &Observable) -> Option<ItemId> {
        if !item.is_record() {
            return None;
        }
        ItemId::from_value(&item.get_untracked(self.0))
    }
}

/// Mirror `source` onto `target`, matching list items by their `id` field.
pub fn mirror(source: &Json, target: &Observable) -> Result<(), ReactiveError> {
    mirror_with(source, target, &IdField::default())
}

/// Mirror `source` onto `target` using a custom identity extractor.
pub fn mirror_with(source: &Json, target: &Observable, ids: &dyn Identify) -> Result<(), ReactiveError> {
    untrack("mirror", || mirror_at(target.name(), source, target, ids))
}

fn target_kind(target: &Observable) -> &'static str {
    if target.is_list() {
        "array"
    } else {
        "object"
    }
}

fn mirror_at(path: &str, source: &Json, target: &Observable, ids: &dyn Identify) -> Result<(), ReactiveError> {
    trace!(path, kind = json_kind_name(source), "mirror");
    match source {
        Json::Object(map) if target.is_record() => mirror_record(path, map, target, ids),
        Json::Array(items) if target.is_list() => mirror_list(path, items, target, ids),
        _ => Err(ReactiveError::MirrorShapeMismatch {
            path: path.to_string(),
            source_kind: json_kind_name(source),
            target_kind: target_kind(target),
        }),
    }
}

/// The nested store to recurse into, if `target_value` has the same structure as `source`.
fn matching_store(source: &Json, target_value: &Value) -> Option<Observable> {
    let store = target_value.as_store()?;
    match source {
        Json::Object(_) if store.is_record() => Some(store.clone()),
        Json::Array(_) if store.is_list() => Some(store.clone()),
        _ => None,
    }
}

fn mirror_record(
    path: &str,
    source: &Map<String, Json>,
    target: &Observable,
    ids: &dyn Identify,
) -> Result<(), ReactiveError> {
    for (key, source_value) in source {
        let child_path = format!("{path}.{key}");
        let current = target.get(key.as_str());
        match matching_store(source_value, &current) {
            Some(store) => mirror_at(&child_path, source_value, &store, ids)?,
            None => target.set(key.as_str(), Value::from_json(&child_path, source_value)),
        }
    }

    for field in target.keys() {
        if !source.contains_key(&field.to_string()) {
            target.delete(field);
        }
    }
    Ok(())
}

fn mirror_list(path: &str, source: &[Json], target: &Observable, ids: &dyn Identify) -> Result<(), ReactiveError> {
    let source_ids: HashSet<ItemId> = source
        .iter()
        .filter_map(|item| item.as_object().and_then(|map| ids.source_id(map)))
        .collect();

    // Drop identified records the source no longer has.
    let mut index = 0;
    while index < target.len() {
        let stale = target
            .get(index)
            .as_store()
            .and_then(|item| ids.target_id(item))
            .is_some_and(|id| !source_ids.contains(&id));
        if stale {
            target.remove(index);
        } else {
            index += 1;
        }
    }

    let by_id: HashMap<ItemId, Observable> = target
        .values()
        .into_iter()
        .filter_map(|item| {
            let store = item.as_store()?.clone();
            ids.target_id(&store).map(|id| (id, store))
        })
        .collect();

    // An identified record still waiting to be matched must not be overwritten.
    let is_claimed = |value: &Value| {
        value
            .as_store()
            .and_then(|item| ids.target_id(item))
            .is_some_and(|id| source_ids.contains(&id))
    };

    for (index, source_item) in source.iter().enumerate() {
        let child_path = format!("{path}.{index}");
        let current = target.get(index);
        let wanted = source_item
            .as_object()
            .and_then(|map| ids.source_id(map))
            .map(|id| by_id.get(&id).cloned());

        match wanted {
            // Identified and already present in the target.
            Some(Some(existing)) => {
                if !current.as_store().is_some_and(|item| item.ptr_eq(&existing)) {
                    match position_after(target, &existing, index + 1) {
                        Some(old_index) => {
                            trace!(path, from = old_index, to = index, "move item");
                            target.remove(old_index);
                            target.insert(index, existing.clone());
                        }
                        None => {
                            // Duplicate id in the source: the record was used already.
                            target.insert(index, Value::from_json(&child_path, source_item));
                            continue;
                        }
                    }
                }
                mirror_at(&child_path, source_item, &existing, ids)?;
            }
            // Identified but new.
            Some(None) => target.insert(index, Value::from_json(&child_path, source_item)),
            // No identity: positional.
            None => {
                let replacement = Value::from_json(&child_path, source_item);
                if is_claimed(&current) {
                    target.insert(index, replacement);
                } else {
                    target.set(index, replacement);
                }
            }
        }
    }

    target.truncate(source.len());
    Ok(())
}

fn position_after(target: &Observable, item: &Observable, start: usize) -> Option<usize> {
    (start..target.len()).find(|&i| target.get(i).as_store().is_some_and(|candidate| candidate.ptr_eq(item)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::{flush_effects, Scope};
    use serde_json::json;
    use std::cell::Cell;
    use std::rc::Rc;

    fn store(json: Json) -> Observable {
        Observable::from_json("t", &json).unwrap()
    }

    fn item(list: &Observable, index: usize) -> Observable {
        list.get_untracked(index).as_store().cloned().unwrap()
    }

    #[test]
    fn record_update_keeps_identity() {
        let target = store(json!({ "id": 1, "v": "b" }));
        let before = target.clone();

        mirror(&json!({ "id": 1, "v": "a" }), &target).unwrap();
        assert!(before.ptr_eq(&target));
        assert_eq!(target.to_json(), json!({ "id": 1, "v": "a" }));
    }

    #[test]
    fn reversed_list_is_reordered_not_replaced() {
        let target = store(json!([{ "id": 2, "v": "b" }, { "id": 1, "v": "a" }]));
        let two = item(&target, 0);
        let one = item(&target, 1);

        mirror(&json!([{ "id": 1, "v": "a" }, { "id": 2, "v": "b" }]), &target).unwrap();

        assert!(item(&target, 0).ptr_eq(&one));
        assert!(item(&target, 1).ptr_eq(&two));
        assert_eq!(target.len(), 2);
    }

    #[test]
    fn unmatched_items_are_removed_and_inserted() {
        let target = store(json!([{ "id": 1 }, { "id": 2 }, { "id": 3 }]));
        let three = item(&target, 2);

        mirror(&json!([{ "id": 3 }, { "id": 4 }]), &target).unwrap();

        assert_eq!(target.to_json(), json!([{ "id": 3 }, { "id": 4 }]));
        assert!(item(&target, 0).ptr_eq(&three));
    }

    #[test]
    fn stale_keys_are_deleted() {
        let target = store(json!({ "a": 1, "b": 2 }));
        mirror(&json!({ "a": 1 }), &target).unwrap();
        assert_eq!(target.to_json(), json!({ "a": 1 }));
    }

    #[test]
    fn primitive_lists_are_written_positionally() {
        let target = store(json!([1, 2, 3, 4]));
        mirror(&json!([1, 5]), &target).unwrap();
        assert_eq!(target.to_json(), json!([1, 5]));

        mirror(&json!([1, 5, 6]), &target).unwrap();
        assert_eq!(target.to_json(), json!([1, 5, 6]));
    }

    #[test]
    fn nested_structures_keep_identity() {
        let target = store(json!({ "user": { "name": "ada", "tags": ["x"] } }));
        let user = target.get_untracked("user").as_store().cloned().unwrap();

        mirror(&json!({ "user": { "name": "grace", "tags": ["x", "y"] } }), &target).unwrap();

        assert!(target.get_untracked("user").as_store().unwrap().ptr_eq(&user));
        assert_eq!(user.to_json(), json!({ "name": "grace", "tags": ["x", "y"] }));
    }

    #[test]
    fn shape_mismatch_is_an_error() {
        let target = store(json!({ "a": 1 }));
        let err = mirror(&json!([1]), &target).unwrap_err();
        assert_eq!(
            err,
            ReactiveError::MirrorShapeMismatch {
                path: "t".into(),
                source_kind: "array",
                target_kind: "object",
            }
        );
    }

    #[test]
    fn nested_kind_change_is_assigned() {
        let target = store(json!({ "a": { "b": 1 } }));
        mirror(&json!({ "a": [1] }), &target).unwrap();
        assert_eq!(target.to_json(), json!({ "a": [1] }));
    }

    #[test]
    fn unchanged_fields_do_not_rerun_effects() {
        let scope = Scope::root("test");
        let target = store(json!({ "a": 1, "b": 1 }));
        let runs = Rc::new(Cell::new(0));
        {
            let (target, runs) = (target.clone(), Rc::clone(&runs));
            scope
                .effect("reads-a", move || {
                    target.get("a");
                    runs.set(runs.get() + 1);
                    Ok(())
                })
                .unwrap();
        }

        mirror(&json!({ "a": 1, "b": 2 }), &target).unwrap();
        flush_effects();
        assert_eq!(runs.get(), 1);

        mirror(&json!({ "a": 2, "b": 2 }), &target).unwrap();
        flush_effects();
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn custom_identity_field() {
        let target = store(json!([{ "key": "b" }, { "key": "a" }]));
        let a = item(&target, 1);

        mirror_with(&json!([{ "key": "a" }]), &target, &IdField("key")).unwrap();
        assert_eq!(target.len(), 1);
        assert!(item(&target, 0).ptr_eq(&a));
    }
}
