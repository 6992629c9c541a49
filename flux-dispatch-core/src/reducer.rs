//! Reducer combinators: `combine_reducers`, `create_reducer`, and slices.
//!
//! Case reducers have draft semantics: they receive a mutable draft of the
//! current state and either mutate it in place or return a replacement
//! value. Either way the engine commits an equivalent next state, and the
//! store preserves state identity when nothing changed.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::action::Action;
use crate::store::RootReducer;

/// A reducer over one state slice: `(slice | None, action) -> slice`.
pub type SliceReducer = Arc<dyn Fn(Option<&Value>, &Action) -> Value + Send + Sync>;

/// A draft-mutating case reducer. Mutate the draft, or return `Some`
/// replacement to swap the slice wholesale.
pub type CaseReducer = Arc<dyn Fn(&mut Value, &Action) -> Option<Value> + Send + Sync>;

/// Predicate used by `add_matcher` entries.
pub type ActionMatcher = Arc<dyn Fn(&Action) -> bool + Send + Sync>;

enum CaseSelector {
    Type(String),
    Matcher(ActionMatcher),
}

impl CaseSelector {
    fn matches(&self, action: &Action) -> bool {
        match self {
            CaseSelector::Type(kind) => action.kind == *kind,
            CaseSelector::Matcher(pred) => pred(action),
        }
    }
}

/// Builder collecting case reducers for [`create_reducer`] and slice
/// `extra_reducers`. The first matching entry wins; the default case runs
/// only when nothing matched.
#[derive(Default)]
pub struct ReducerBuilder {
    cases: Vec<(CaseSelector, CaseReducer)>,
    default_case: Option<CaseReducer>,
}

impl ReducerBuilder {
    /// Handle actions of an exact `type`.
    pub fn add_case<F>(&mut self, kind: impl Into<String>, case: F) -> &mut Self
    where
        F: Fn(&mut Value, &Action) -> Option<Value> + Send + Sync + 'static,
    {
        self.cases
            .push((CaseSelector::Type(kind.into()), Arc::new(case)));
        self
    }

    /// Handle actions matched by a predicate.
    pub fn add_matcher<P, F>(&mut self, pred: P, case: F) -> &mut Self
    where
        P: Fn(&Action) -> bool + Send + Sync + 'static,
        F: Fn(&mut Value, &Action) -> Option<Value> + Send + Sync + 'static,
    {
        self.cases
            .push((CaseSelector::Matcher(Arc::new(pred)), Arc::new(case)));
        self
    }

    /// Handle any action nothing else matched.
    pub fn add_default_case<F>(&mut self, case: F) -> &mut Self
    where
        F: Fn(&mut Value, &Action) -> Option<Value> + Send + Sync + 'static,
    {
        self.default_case = Some(Arc::new(case));
        self
    }

    pub(crate) fn select(&self, action: &Action) -> Option<&CaseReducer> {
        self.cases
            .iter()
            .find(|(selector, _)| selector.matches(action))
            .map(|(_, case)| case)
            .or(self.default_case.as_ref())
    }

    fn reduce(&self, state: Option<&Value>, initial: &Value, action: &Action) -> Value {
        let mut draft = state.cloned().unwrap_or_else(|| initial.clone());
        if let Some(case) = self.select(action) {
            if let Some(replacement) = case(&mut draft, action) {
                return replacement;
            }
        }
        draft
    }
}

/// Build a slice reducer from an initial state and case reducers.
///
/// # Example
///
/// ```ignore
/// let reducer = create_reducer(json!({"count": 0}), |builder| {
///     builder.add_case("counter/increment", |draft, _| {
///         draft["count"] = json!(draft["count"].as_i64().unwrap_or(0) + 1);
///         None
///     });
/// });
/// ```
pub fn create_reducer(initial: Value, build: impl FnOnce(&mut ReducerBuilder)) -> SliceReducer {
    let mut builder = ReducerBuilder::default();
    build(&mut builder);
    Arc::new(move |state, action| builder.reduce(state, &initial, action))
}

/// Run each child reducer against its keyed slice of the root object.
///
/// The combined output reuses the prior root value when no child produced a
/// distinct slice, so the store keeps the prior state identity.
pub fn combine_reducers<K: Into<String>>(children: Vec<(K, SliceReducer)>) -> RootReducer {
    let children: Vec<(String, SliceReducer)> = children
        .into_iter()
        .map(|(key, reducer)| (key.into(), reducer))
        .collect();

    Arc::new(move |state, action| {
        let prior = state.and_then(Value::as_object);
        let mut next = Map::with_capacity(children.len());
        let mut changed = prior.is_none();

        for (key, child) in &children {
            let slice = prior.and_then(|map| map.get(key));
            let next_slice = child(slice, action);
            if slice != Some(&next_slice) {
                changed = true;
            }
            next.insert(key.clone(), next_slice);
        }

        if changed {
            Value::Object(next)
        } else {
            // Reuse the prior root so the store preserves identity.
            state.cloned().unwrap_or(Value::Object(next))
        }
    })
}

/// A named slice: reducer plus generated `{name}/{key}` action creators.
pub struct Slice {
    name: String,
    initial: Value,
    cases: Vec<(String, CaseReducer)>,
    extra: ReducerBuilder,
}

impl Slice {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The generated action type for a case key: `{name}/{key}`.
    pub fn action_type(&self, key: &str) -> String {
        format!("{}/{key}", self.name)
    }

    /// Build an action targeting one of the slice's case reducers.
    pub fn action(&self, key: &str, payload: Option<Value>) -> Action {
        let mut action = Action::new(self.action_type(key));
        if let Some(payload) = payload {
            action = action.with_payload(payload);
        }
        action
    }

    /// The slice reducer: own cases win over `extra_reducers` entries.
    pub fn reducer(self: &Arc<Self>) -> SliceReducer {
        let slice = self.clone();
        Arc::new(move |state, action| {
            let mut draft = state.cloned().unwrap_or_else(|| slice.initial.clone());
            let own = action
                .kind
                .strip_prefix(&slice.name)
                .and_then(|rest| rest.strip_prefix('/'))
                .and_then(|key| {
                    slice
                        .cases
                        .iter()
                        .find(|(case_key, _)| case_key == key)
                        .map(|(_, case)| case)
                });
            let case = match own {
                Some(case) => Some(case),
                None => slice.extra.select(action),
            };
            if let Some(case) = case {
                if let Some(replacement) = case(&mut draft, action) {
                    return replacement;
                }
            }
            draft
        })
    }
}

/// Builder for [`Slice`].
pub struct SliceBuilder {
    name: String,
    initial: Value,
    cases: Vec<(String, CaseReducer)>,
    extra: ReducerBuilder,
}

impl SliceBuilder {
    pub fn new(name: impl Into<String>, initial: Value) -> Self {
        Self {
            name: name.into(),
            initial,
            cases: Vec::new(),
            extra: ReducerBuilder::default(),
        }
    }

    /// Register a case reducer; its action type becomes `{name}/{key}`.
    pub fn case<F>(mut self, key: impl Into<String>, case: F) -> Self
    where
        F: Fn(&mut Value, &Action) -> Option<Value> + Send + Sync + 'static,
    {
        self.cases.push((key.into(), Arc::new(case)));
        self
    }

    /// Respond to actions generated elsewhere (thunk lifecycles, other
    /// slices).
    pub fn extra_reducers(mut self, build: impl FnOnce(&mut ReducerBuilder)) -> Self {
        build(&mut self.extra);
        self
    }

    pub fn build(self) -> Arc<Slice> {
        Arc::new(Slice {
            name: self.name,
            initial: self.initial,
            cases: self.cases,
            extra: self.extra,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::is_fulfilled;
    use crate::store::create_store;
    use serde_json::json;

    #[test]
    fn create_reducer_draft_mutation_and_replacement() {
        let reducer = create_reducer(json!({"count": 0}), |builder| {
            builder.add_case("counter/increment", |draft, _| {
                draft["count"] = json!(draft["count"].as_i64().unwrap_or(0) + 1);
                None
            });
            builder.add_case("counter/reset", |_, _| Some(json!({"count": 0})));
        });

        let s1 = reducer(None, &Action::new("counter/increment"));
        assert_eq!(s1, json!({"count": 1}));
        let s2 = reducer(Some(&s1), &Action::new("counter/reset"));
        assert_eq!(s2, json!({"count": 0}));
    }

    #[test]
    fn first_matching_case_wins() {
        let reducer = create_reducer(json!(0), |builder| {
            builder.add_matcher(|_| true, |_, _| Some(json!("first")));
            builder.add_matcher(|_| true, |_, _| Some(json!("second")));
        });
        assert_eq!(reducer(None, &Action::new("anything")), json!("first"));
    }

    #[test]
    fn default_case_runs_when_nothing_matched() {
        let reducer = create_reducer(json!(0), |builder| {
            builder.add_case("known", |_, _| Some(json!(1)));
            builder.add_default_case(|_, _| Some(json!("fallback")));
        });
        assert_eq!(reducer(None, &Action::new("unknown")), json!("fallback"));
        assert_eq!(reducer(None, &Action::new("known")), json!(1));
    }

    #[test]
    fn combine_reducers_routes_slices_and_preserves_identity() {
        let counter = create_reducer(json!(0), |builder| {
            builder.add_case("counter/increment", |draft, _| {
                Some(json!(draft.as_i64().unwrap_or(0) + 1))
            });
        });
        let text = create_reducer(json!(""), |builder| {
            builder.add_case("text/set", |_, action| action.payload.clone());
        });

        let root = combine_reducers(vec![("counter", counter), ("text", text)]);
        let store = create_store(root, None);
        assert_eq!(*store.get_state(), json!({"counter": 0, "text": ""}));

        store.dispatch(Action::new("counter/increment")).unwrap();
        assert_eq!(*store.get_state(), json!({"counter": 1, "text": ""}));

        // An unrelated action changes no slice, so identity is preserved.
        let before = store.get_state();
        store.dispatch(Action::new("noop")).unwrap();
        assert!(Arc::ptr_eq(&before, &store.get_state()));
    }

    #[test]
    fn slice_generates_prefixed_action_types() {
        let slice = SliceBuilder::new("todos", json!([]))
            .case("add", |draft, action| {
                if let (Value::Array(items), Some(payload)) = (draft, &action.payload) {
                    items.push(payload.clone());
                }
                None
            })
            .build();

        assert_eq!(slice.action_type("add"), "todos/add");

        let reducer = slice.reducer();
        let action = slice.action("add", Some(json!({"id": 1})));
        let state = reducer(None, &action);
        assert_eq!(state, json!([{"id": 1}]));
    }

    #[test]
    fn slice_extra_reducers_see_foreign_actions() {
        let slice = SliceBuilder::new("users", json!({"loaded": false}))
            .extra_reducers(|builder| {
                builder.add_matcher(is_fulfilled, |draft, _| {
                    draft["loaded"] = json!(true);
                    None
                });
            })
            .build();

        let reducer = slice.reducer();
        let state = reducer(None, &Action::new("users/fetch/fulfilled"));
        assert_eq!(state, json!({"loaded": true}));
    }
}
