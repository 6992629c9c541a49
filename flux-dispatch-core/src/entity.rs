//! Normalized collection CRUD over an `ids`/`entities` structure.
//!
//! The adapter operates on drafts of the JSON shape
//! `{ "ids": [...], "entities": { "<id>": entity } }` so its operations
//! compose with case reducers. After every operation `ids` is exactly the
//! key set of `entities`, with no duplicates; order is insertion order
//! unless a sort comparator is configured, in which case `ids` stays sorted
//! with a stable tie-break.

use std::cmp::Ordering;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::selector::{create_selector, input, Selector, SelectorFn};

/// An entity key: a JSON string or integer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityId {
    Num(i64),
    Str(String),
}

impl EntityId {
    /// Extract an id from a JSON value (string or integer).
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(EntityId::Str(s.clone())),
            Value::Number(n) => n.as_i64().map(EntityId::Num),
            _ => None,
        }
    }

    /// The key used in the `entities` map.
    pub fn as_key(&self) -> String {
        match self {
            EntityId::Num(n) => n.to_string(),
            EntityId::Str(s) => s.clone(),
        }
    }

    /// The representation stored in the `ids` array.
    pub fn to_value(&self) -> Value {
        match self {
            EntityId::Num(n) => json!(n),
            EntityId::Str(s) => json!(s),
        }
    }
}

impl From<i64> for EntityId {
    fn from(n: i64) -> Self {
        EntityId::Num(n)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        EntityId::Str(s.to_string())
    }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self {
        EntityId::Str(s)
    }
}

/// An `{id, changes}` pair for the update operations.
#[derive(Debug, Clone)]
pub struct EntityUpdate {
    pub id: EntityId,
    pub changes: Value,
}

type SelectIdFn = Arc<dyn Fn(&Value) -> Option<EntityId> + Send + Sync>;
type SortComparer = Arc<dyn Fn(&Value, &Value) -> Ordering + Send + Sync>;

/// CRUD operations over a normalized entity collection.
#[derive(Clone)]
pub struct EntityAdapter {
    select_id: SelectIdFn,
    sort_comparer: Option<SortComparer>,
}

impl Default for EntityAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityAdapter {
    /// An adapter reading the id from the entity's `id` field.
    pub fn new() -> Self {
        Self {
            select_id: Arc::new(|entity| EntityId::from_value(&entity["id"])),
            sort_comparer: None,
        }
    }

    /// Replace how ids are derived from entities.
    pub fn with_select_id<F>(mut self, select_id: F) -> Self
    where
        F: Fn(&Value) -> Option<EntityId> + Send + Sync + 'static,
    {
        self.select_id = Arc::new(select_id);
        self
    }

    /// Keep `ids` sorted by comparing entities; ties keep their prior order.
    pub fn with_sort_comparer<F>(mut self, comparer: F) -> Self
    where
        F: Fn(&Value, &Value) -> Ordering + Send + Sync + 'static,
    {
        self.sort_comparer = Some(Arc::new(comparer));
        self
    }

    pub fn initial_state(&self) -> Value {
        json!({"ids": [], "entities": {}})
    }

    /// Insert if absent; an existing id is left untouched.
    pub fn add_one(&self, state: &mut Value, entity: Value) {
        self.add_many(state, vec![entity]);
    }

    pub fn add_many(&self, state: &mut Value, entities: Vec<Value>) {
        self.mutate(state, |ids, map, select_id| {
            for entity in entities {
                let Some(id) = select_id(&entity) else { continue };
                let key = id.as_key();
                if !map.contains_key(&key) {
                    ids.push(id);
                    map.insert(key, entity);
                }
            }
        });
    }

    /// Insert or replace wholesale.
    pub fn set_one(&self, state: &mut Value, entity: Value) {
        self.set_many(state, vec![entity]);
    }

    pub fn set_many(&self, state: &mut Value, entities: Vec<Value>) {
        self.mutate(state, |ids, map, select_id| {
            for entity in entities {
                let Some(id) = select_id(&entity) else { continue };
                let key = id.as_key();
                if !map.contains_key(&key) {
                    ids.push(id);
                }
                map.insert(key, entity);
            }
        });
    }

    /// Replace the whole collection.
    pub fn set_all(&self, state: &mut Value, entities: Vec<Value>) {
        *state = self.initial_state();
        self.set_many(state, entities);
    }

    /// Shallow-merge `changes` into the entity with `id`; a changed id
    /// re-keys the entity in place.
    pub fn update_one(&self, state: &mut Value, update: EntityUpdate) {
        self.update_many(state, vec![update]);
    }

    pub fn update_many(&self, state: &mut Value, updates: Vec<EntityUpdate>) {
        self.mutate(state, |ids, map, select_id| {
            for update in updates {
                let key = update.id.as_key();
                let Some(mut entity) = map.remove(&key) else { continue };
                merge_shallow(&mut entity, &update.changes);
                let next_id = select_id(&entity).unwrap_or(update.id.clone());
                let next_key = next_id.as_key();
                if next_key != key {
                    if let Some(slot) = ids.iter_mut().find(|id| **id == update.id) {
                        *slot = next_id;
                    }
                }
                map.insert(next_key, entity);
            }
        });
    }

    /// Merge if present, insert otherwise.
    pub fn upsert_one(&self, state: &mut Value, entity: Value) {
        self.upsert_many(state, vec![entity]);
    }

    pub fn upsert_many(&self, state: &mut Value, entities: Vec<Value>) {
        self.mutate(state, |ids, map, select_id| {
            for entity in entities {
                let Some(id) = select_id(&entity) else { continue };
                let key = id.as_key();
                match map.get_mut(&key) {
                    Some(existing) => merge_shallow(existing, &entity),
                    None => {
                        ids.push(id);
                        map.insert(key, entity);
                    }
                }
            }
        });
    }

    pub fn remove_one(&self, state: &mut Value, id: EntityId) {
        self.remove_many(state, vec![id]);
    }

    pub fn remove_many(&self, state: &mut Value, remove: Vec<EntityId>) {
        self.mutate(state, |ids, map, _select_id| {
            for id in remove {
                map.remove(&id.as_key());
                ids.retain(|existing| *existing != id);
            }
        });
    }

    pub fn remove_all(&self, state: &mut Value) {
        *state = self.initial_state();
    }

    /// Memoized selectors over a slice locator for the entity state.
    pub fn selectors(&self, slice: SelectorFn) -> EntitySelectors {
        EntitySelectors::new(slice)
    }

    fn mutate<F>(&self, state: &mut Value, op: F)
    where
        F: FnOnce(&mut Vec<EntityId>, &mut Map<String, Value>, &SelectIdFn),
    {
        let (mut ids, mut map) = decompose(state);
        op(&mut ids, &mut map, &self.select_id);
        if let Some(comparer) = &self.sort_comparer {
            ids.sort_by(|a, b| {
                let left = map.get(&a.as_key());
                let right = map.get(&b.as_key());
                match (left, right) {
                    (Some(left), Some(right)) => comparer(left, right),
                    _ => Ordering::Equal,
                }
            });
        }
        *state = json!({
            "ids": ids.iter().map(EntityId::to_value).collect::<Vec<_>>(),
            "entities": Value::Object(map),
        });
    }
}

fn decompose(state: &Value) -> (Vec<EntityId>, Map<String, Value>) {
    let ids = state["ids"]
        .as_array()
        .map(|ids| ids.iter().filter_map(EntityId::from_value).collect())
        .unwrap_or_default();
    let map = state["entities"].as_object().cloned().unwrap_or_default();
    (ids, map)
}

fn merge_shallow(target: &mut Value, changes: &Value) {
    match (target.as_object_mut(), changes.as_object()) {
        (Some(target), Some(changes)) => {
            for (key, value) in changes {
                target.insert(key.clone(), value.clone());
            }
        }
        _ => *target = changes.clone(),
    }
}

/// Memoized derived selectors for one entity collection.
pub struct EntitySelectors {
    slice: SelectorFn,
    pub select_ids: Arc<Selector>,
    pub select_entities: Arc<Selector>,
    pub select_all: Arc<Selector>,
    pub select_total: Arc<Selector>,
}

impl EntitySelectors {
    fn new(slice: SelectorFn) -> Self {
        let ids = {
            let slice = slice.clone();
            create_selector(
                vec![Arc::new(move |state: &crate::store::StateRef| {
                    Arc::new(slice(state)["ids"].clone())
                }) as SelectorFn],
                |inputs| inputs[0].as_ref().clone(),
            )
        };
        let entities = {
            let slice = slice.clone();
            create_selector(
                vec![Arc::new(move |state: &crate::store::StateRef| {
                    Arc::new(slice(state)["entities"].clone())
                }) as SelectorFn],
                |inputs| inputs[0].as_ref().clone(),
            )
        };
        let all = create_selector(
            vec![ids.as_input(), entities.as_input()],
            |inputs: &[Arc<Value>]| {
                let ids = inputs[0].as_array().cloned().unwrap_or_default();
                let entities = inputs[1].as_object().cloned().unwrap_or_default();
                Value::Array(
                    ids.iter()
                        .filter_map(EntityId::from_value)
                        .filter_map(|id| entities.get(&id.as_key()).cloned())
                        .collect(),
                )
            },
        );
        let total = create_selector(vec![ids.as_input()], |inputs: &[Arc<Value>]| {
            json!(inputs[0].as_array().map_or(0, Vec::len))
        });

        Self {
            slice,
            select_ids: ids,
            select_entities: entities,
            select_all: all,
            select_total: total,
        }
    }

    /// A memoized selector for one entity by id.
    pub fn select_by_id(&self, id: EntityId) -> Arc<Selector> {
        let slice = self.slice.clone();
        let key = id.as_key();
        create_selector(
            vec![Arc::new(move |state: &crate::store::StateRef| {
                Arc::new(slice(state)["entities"].clone())
            }) as SelectorFn],
            move |inputs: &[Arc<Value>]| inputs[0].get(&key).cloned().unwrap_or(Value::Null),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn adapter() -> EntityAdapter {
        EntityAdapter::new()
    }

    fn ids_match_entities(state: &Value) {
        let ids: Vec<String> = state["ids"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(EntityId::from_value)
            .map(|id| id.as_key())
            .collect();
        let keys: BTreeSet<&String> = state["entities"].as_object().unwrap().keys().collect();
        assert_eq!(ids.len(), keys.len(), "duplicate or missing ids");
        for id in &ids {
            assert!(keys.contains(id), "id {id} missing from entities");
        }
    }

    #[test]
    fn add_one_ignores_existing_id() {
        let adapter = adapter();
        let mut state = adapter.initial_state();
        adapter.add_one(&mut state, json!({"id": 1, "name": "a"}));
        adapter.add_one(&mut state, json!({"id": 1, "name": "changed"}));

        assert_eq!(state["entities"]["1"]["name"], json!("a"));
        assert_eq!(state["ids"], json!([1]));
        ids_match_entities(&state);
    }

    #[test]
    fn set_one_replaces_wholesale() {
        let adapter = adapter();
        let mut state = adapter.initial_state();
        adapter.add_one(&mut state, json!({"id": 1, "name": "a", "extra": true}));
        adapter.set_one(&mut state, json!({"id": 1, "name": "b"}));

        assert_eq!(state["entities"]["1"], json!({"id": 1, "name": "b"}));
        ids_match_entities(&state);
    }

    #[test]
    fn update_one_merges_by_id() {
        let adapter = adapter();
        let mut state = adapter.initial_state();
        adapter.add_one(&mut state, json!({"id": 1, "name": "a", "done": false}));
        adapter.update_one(
            &mut state,
            EntityUpdate {
                id: 1.into(),
                changes: json!({"done": true}),
            },
        );

        assert_eq!(
            state["entities"]["1"],
            json!({"id": 1, "name": "a", "done": true})
        );
        ids_match_entities(&state);
    }

    #[test]
    fn update_one_rekeys_on_id_change() {
        let adapter = adapter();
        let mut state = adapter.initial_state();
        adapter.add_many(
            &mut state,
            vec![json!({"id": 1, "name": "a"}), json!({"id": 2, "name": "b"})],
        );
        adapter.update_one(
            &mut state,
            EntityUpdate {
                id: 1.into(),
                changes: json!({"id": 9}),
            },
        );

        assert_eq!(state["ids"], json!([9, 2]));
        assert_eq!(state["entities"]["9"]["name"], json!("a"));
        ids_match_entities(&state);
    }

    #[test]
    fn upsert_many_is_idempotent() {
        let adapter = adapter();
        let mut state = adapter.initial_state();
        adapter.upsert_many(&mut state, vec![json!({"id": 1, "name": "a"})]);
        let once = state.clone();
        adapter.upsert_many(&mut state, vec![json!({"id": 1, "name": "a"})]);

        assert_eq!(state, once);
        ids_match_entities(&state);
    }

    #[test]
    fn remove_operations_keep_invariants() {
        let adapter = adapter();
        let mut state = adapter.initial_state();
        adapter.add_many(
            &mut state,
            vec![
                json!({"id": 1}),
                json!({"id": 2}),
                json!({"id": 3}),
            ],
        );

        adapter.remove_one(&mut state, 2.into());
        assert_eq!(state["ids"], json!([1, 3]));
        ids_match_entities(&state);

        adapter.remove_all(&mut state);
        assert_eq!(state, adapter.initial_state());
    }

    #[test]
    fn sort_comparer_keeps_ids_sorted_with_stable_ties() {
        let adapter = EntityAdapter::new().with_sort_comparer(|a, b| {
            a["rank"]
                .as_i64()
                .unwrap_or(0)
                .cmp(&b["rank"].as_i64().unwrap_or(0))
        });
        let mut state = adapter.initial_state();
        adapter.add_many(
            &mut state,
            vec![
                json!({"id": "b", "rank": 2}),
                json!({"id": "a", "rank": 1}),
                json!({"id": "c", "rank": 2}),
            ],
        );

        // b precedes c: equal ranks keep insertion order.
        assert_eq!(state["ids"], json!(["a", "b", "c"]));

        adapter.add_one(&mut state, json!({"id": "d", "rank": 0}));
        assert_eq!(state["ids"], json!(["d", "a", "b", "c"]));
        ids_match_entities(&state);
    }

    #[test]
    fn selectors_memoize_over_slice() {
        let adapter = adapter();
        let mut slice = adapter.initial_state();
        adapter.add_many(&mut slice, vec![json!({"id": 1}), json!({"id": 2})]);

        let selectors = adapter.selectors(input(|state| state["todos"].clone()));
        let state = Arc::new(json!({"todos": slice}));

        let all_first = selectors.select_all.select(&state);
        let all_second = selectors.select_all.select(&state);
        assert!(Arc::ptr_eq(&all_first, &all_second));
        assert_eq!(*selectors.select_total.select(&state), json!(2));
        assert_eq!(
            *selectors.select_by_id(1.into()).select(&state),
            json!({"id": 1})
        );
    }
}
