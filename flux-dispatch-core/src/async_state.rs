//! Async request state and reducer helpers over the thunk lifecycle.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::action::Action;
use crate::reducer::{CaseReducer, ReducerBuilder, SliceReducer};
use crate::thunk::AsyncThunk;

/// Milliseconds since the unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

/// The tracked state of one async request slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncState {
    pub data: Value,
    pub loading: bool,
    pub error: Value,
    #[serde(rename = "lastFetch")]
    pub last_fetch: Option<i64>,
    #[serde(rename = "requestId")]
    pub request_id: Option<String>,
}

impl Default for AsyncState {
    fn default() -> Self {
        Self {
            data: Value::Null,
            loading: false,
            error: Value::Null,
            last_fetch: None,
            request_id: None,
        }
    }
}

impl AsyncState {
    pub fn initial() -> Value {
        serde_json::to_value(Self::default()).unwrap_or(Value::Null)
    }

    fn from_slice(slice: &Value) -> Self {
        serde_json::from_value(slice.clone()).unwrap_or_default()
    }

    fn write_to(&self, slice: &mut Value) {
        if let Ok(next) = serde_json::to_value(self) {
            *slice = next;
        }
    }
}

/// Apply the thunk lifecycle transition for `action` to an [`AsyncState`]
/// slice. Returns whether the action belonged to the thunk.
pub fn apply_async_transition(thunk: &AsyncThunk, slice: &mut Value, action: &Action) -> bool {
    if thunk.is_pending(action) {
        let mut state = AsyncState::from_slice(slice);
        state.loading = true;
        state.error = Value::Null;
        state.write_to(slice);
        true
    } else if thunk.is_fulfilled(action) {
        let mut state = AsyncState::from_slice(slice);
        state.loading = false;
        state.data = action.payload.clone().unwrap_or(Value::Null);
        state.error = Value::Null;
        state.last_fetch = Some(now_millis());
        state.request_id = action.request_id().map(str::to_string);
        state.write_to(slice);
        true
    } else if thunk.is_rejected(action) {
        let mut state = AsyncState::from_slice(slice);
        state.loading = false;
        state.error = if action
            .meta
            .as_ref()
            .is_some_and(|meta| meta.rejected_with_value)
        {
            action.payload.clone().unwrap_or(Value::Null)
        } else {
            action
                .error
                .as_ref()
                .and_then(|err| serde_json::to_value(err).ok())
                .unwrap_or(Value::Null)
        };
        state.request_id = action.request_id().map(str::to_string);
        state.write_to(slice);
        true
    } else {
        false
    }
}

/// Optional per-phase overrides layered on top of the built-in transitions.
#[derive(Default)]
pub struct AsyncReducerHandlers {
    pub on_pending: Option<CaseReducer>,
    pub on_fulfilled: Option<CaseReducer>,
    pub on_rejected: Option<CaseReducer>,
}

/// Build a reducer managing an [`AsyncState`] slice for one thunk.
pub fn create_async_reducer(thunk: &AsyncThunk, handlers: AsyncReducerHandlers) -> SliceReducer {
    let thunk = thunk.clone();
    Arc::new(move |state, action| {
        let mut draft = state.cloned().unwrap_or_else(AsyncState::initial);
        if apply_async_transition(&thunk, &mut draft, action) {
            let handler = if thunk.is_pending(action) {
                handlers.on_pending.as_ref()
            } else if thunk.is_fulfilled(action) {
                handlers.on_fulfilled.as_ref()
            } else {
                handlers.on_rejected.as_ref()
            };
            if let Some(handler) = handler {
                if let Some(replacement) = handler(&mut draft, action) {
                    return replacement;
                }
            }
        }
        draft
    })
}

/// A slice composing sync case reducers, per-field async sub-states, and
/// extra reducers. The first matching entry wins: own cases, then thunk
/// sub-states, then the extra builder.
pub struct AsyncSlice {
    name: String,
    initial: Value,
    cases: Vec<(String, CaseReducer)>,
    thunks: Vec<(String, AsyncThunk)>,
    extra: ReducerBuilder,
}

impl AsyncSlice {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn action_type(&self, key: &str) -> String {
        format!("{}/{key}", self.name)
    }

    pub fn action(&self, key: &str, payload: Option<Value>) -> Action {
        let mut action = Action::new(self.action_type(key));
        if let Some(payload) = payload {
            action = action.with_payload(payload);
        }
        action
    }

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
            if let Some(case) = own {
                if let Some(replacement) = case(&mut draft, action) {
                    return replacement;
                }
                return draft;
            }

            for (field, thunk) in &slice.thunks {
                let sub = draft
                    .as_object_mut()
                    .map(|map| map.entry(field.clone()).or_insert_with(AsyncState::initial));
                if let Some(sub) = sub {
                    if apply_async_transition(thunk, sub, action) {
                        return draft;
                    }
                }
            }

            if let Some(case) = slice.extra.select(action) {
                if let Some(replacement) = case(&mut draft, action) {
                    return replacement;
                }
            }
            draft
        })
    }
}

/// Builder for [`AsyncSlice`].
pub struct AsyncSliceBuilder {
    name: String,
    initial: Value,
    cases: Vec<(String, CaseReducer)>,
    thunks: Vec<(String, AsyncThunk)>,
    extra: ReducerBuilder,
}

impl AsyncSliceBuilder {
    pub fn new(name: impl Into<String>, initial: Value) -> Self {
        Self {
            name: name.into(),
            initial,
            cases: Vec::new(),
            thunks: Vec::new(),
            extra: ReducerBuilder::default(),
        }
    }

    /// Register a synchronous case reducer under `{name}/{key}`.
    pub fn case<F>(mut self, key: impl Into<String>, case: F) -> Self
    where
        F: Fn(&mut Value, &Action) -> Option<Value> + Send + Sync + 'static,
    {
        self.cases.push((key.into(), Arc::new(case)));
        self
    }

    /// Manage an [`AsyncState`] sub-state at `field` for the thunk's
    /// lifecycle actions.
    pub fn thunk_state(mut self, field: impl Into<String>, thunk: &AsyncThunk) -> Self {
        let field = field.into();
        self.initial[&field] = AsyncState::initial();
        self.thunks.push((field, thunk.clone()));
        self
    }

    pub fn extra_reducers(mut self, build: impl FnOnce(&mut ReducerBuilder)) -> Self {
        build(&mut self.extra);
        self
    }

    pub fn build(self) -> Arc<AsyncSlice> {
        Arc::new(AsyncSlice {
            name: self.name,
            initial: self.initial,
            cases: self.cases,
            thunks: self.thunks,
            extra: self.extra,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionMeta, RequestStatus};
    use serde_json::json;

    fn fetch_thunk() -> AsyncThunk {
        AsyncThunk::new("users/fetch", |_arg, _api| Box::pin(async { Ok(json!(null)) }))
    }

    fn lifecycle_action(kind: &str, payload: Option<Value>) -> Action {
        let mut action = Action::new(kind).with_meta(ActionMeta::for_request(
            "req-1",
            json!(null),
            RequestStatus::Pending,
        ));
        if let Some(payload) = payload {
            action = action.with_payload(payload);
        }
        action
    }

    #[test]
    fn pending_sets_loading_and_clears_error() {
        let reducer = create_async_reducer(&fetch_thunk(), AsyncReducerHandlers::default());
        let prior = json!({
            "data": null, "loading": false, "error": {"message": "old"},
            "lastFetch": null, "requestId": null
        });
        let next = reducer(Some(&prior), &lifecycle_action("users/fetch/pending", None));
        assert_eq!(next["loading"], json!(true));
        assert_eq!(next["error"], json!(null));
    }

    #[test]
    fn fulfilled_records_data_timestamp_and_request_id() {
        let reducer = create_async_reducer(&fetch_thunk(), AsyncReducerHandlers::default());
        let next = reducer(
            None,
            &lifecycle_action("users/fetch/fulfilled", Some(json!({"name": "ada"}))),
        );
        assert_eq!(next["loading"], json!(false));
        assert_eq!(next["data"], json!({"name": "ada"}));
        assert_eq!(next["requestId"], json!("req-1"));
        assert!(next["lastFetch"].as_i64().unwrap() > 0);
    }

    #[test]
    fn rejected_with_value_stores_payload_as_error() {
        let reducer = create_async_reducer(&fetch_thunk(), AsyncReducerHandlers::default());
        let mut meta = ActionMeta::for_request("req-2", json!(null), RequestStatus::Rejected);
        meta.rejected_with_value = true;
        let action = Action::new("users/fetch/rejected")
            .with_payload(json!({"code": 400}))
            .with_meta(meta);

        let next = reducer(None, &action);
        assert_eq!(next["error"], json!({"code": 400}));
        assert_eq!(next["loading"], json!(false));
    }

    #[test]
    fn plain_rejection_stores_serialized_error() {
        let reducer = create_async_reducer(&fetch_thunk(), AsyncReducerHandlers::default());
        let action = lifecycle_action("users/fetch/rejected", None)
            .with_error(crate::error::SerializedError::from_message("boom"));
        let next = reducer(None, &action);
        assert_eq!(next["error"]["message"], json!("boom"));
    }

    #[test]
    fn async_slice_routes_sync_thunk_and_extra() {
        let thunk = fetch_thunk();
        let slice = AsyncSliceBuilder::new("users", json!({"filter": ""}))
            .case("setFilter", |draft, action| {
                draft["filter"] = action.payload.clone().unwrap_or(Value::Null);
                None
            })
            .thunk_state("current", &thunk)
            .extra_reducers(|builder| {
                builder.add_case("app/reset", |draft, _| {
                    draft["filter"] = json!("");
                    None
                });
            })
            .build();
        let reducer = slice.reducer();

        let s1 = reducer(None, &slice.action("setFilter", Some(json!("abc"))));
        assert_eq!(s1["filter"], json!("abc"));
        assert_eq!(s1["current"]["loading"], json!(false));

        let s2 = reducer(Some(&s1), &lifecycle_action("users/fetch/pending", None));
        assert_eq!(s2["current"]["loading"], json!(true));
        assert_eq!(s2["filter"], json!("abc"));

        let s3 = reducer(Some(&s2), &Action::new("app/reset"));
        assert_eq!(s3["filter"], json!(""));
    }
}
