//! The api object produced by [`create_api`]: reducer, middleware, and
//! per-endpoint initiate/select operations.
//!
//! The reducer owns the api sub-state
//! `{ queries, mutations, provided, subscriptions }` mounted at the
//! configured reducer path. The middleware drives everything that is not a
//! pure state transition: tag invalidation after mutations, retention
//! eviction timers, focus refetch, and aborting abandoned in-flight
//! requests. Requests themselves run as thunks the engine dispatches
//! internally.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::action::{Action, ActionMeta, RequestStatus};
use crate::async_state::now_millis;
use crate::error::QueryError;
use crate::middleware::{Middleware, MiddlewareApi, NextFn};
use crate::query::base_query::{BaseQuery, BaseQueryApi};
use crate::query::endpoint::{EndpointBuilder, EndpointDef, MutationDef, QueryDef};
use crate::query::key::cache_key;
use crate::query::state::{CacheEntry, QueryStatus, Tag};
use crate::reducer::SliceReducer;
use crate::store::{DispatchFn, Dispatched, Op, StateRef, Thunk, ThunkContext};

const EXTRA_CACHE_KEY: &str = "cacheKey";
const EXTRA_ENDPOINT: &str = "endpointName";
const EXTRA_MUTATION_KEY: &str = "mutationKey";
const EXTRA_PROVIDED: &str = "providedTags";
const EXTRA_INVALIDATES: &str = "invalidatesTags";
const GENERAL_BUCKET: &str = "__general__";

/// Options for [`create_api`].
pub struct ApiOptions {
    pub reducer_path: String,
    pub base_query: Arc<dyn BaseQuery>,
    pub tag_types: Vec<String>,
    /// Retention window after the last subscriber leaves, in seconds.
    pub keep_unused_data_for: f64,
}

impl ApiOptions {
    pub fn new(reducer_path: impl Into<String>, base_query: Arc<dyn BaseQuery>) -> Self {
        Self {
            reducer_path: reducer_path.into(),
            base_query,
            tag_types: Vec::new(),
            keep_unused_data_for: 60.0,
        }
    }

    pub fn with_tag_types(mut self, tag_types: Vec<String>) -> Self {
        self.tag_types = tag_types;
        self
    }

    pub fn with_keep_unused_data_for(mut self, seconds: f64) -> Self {
        self.keep_unused_data_for = seconds;
        self
    }
}

/// Per-initiate behavior knobs.
#[derive(Debug, Clone)]
pub struct InitiateOptions {
    /// Register a subscription (refcount) for this caller.
    pub subscribe: bool,
    /// Skip the cache and always start a request.
    pub force: bool,
    /// Refetch on mount when the entry is older than `stale_time_ms`.
    pub refetch_on_mount: bool,
    /// Staleness threshold for `refetch_on_mount`; `None` means always
    /// stale.
    pub stale_time_ms: Option<i64>,
}

impl Default for InitiateOptions {
    fn default() -> Self {
        Self {
            subscribe: true,
            force: false,
            refetch_on_mount: false,
            stale_time_ms: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ApiState {
    #[serde(default)]
    queries: Map<String, Value>,
    #[serde(default)]
    mutations: Map<String, Value>,
    #[serde(default)]
    provided: Map<String, Value>,
    #[serde(default)]
    subscriptions: Map<String, Value>,
}

impl ApiState {
    fn from_slice(slice: Option<&Value>) -> Self {
        slice
            .and_then(|value| serde_json::from_value(value.clone()).ok())
            .unwrap_or_default()
    }

    fn into_value(self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({}))
    }

    fn entry(&self, key: &str) -> CacheEntry {
        self.queries
            .get(key)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
            .unwrap_or_default()
    }

    fn subscriber_count(&self, key: &str) -> u64 {
        self.subscriptions
            .get(key)
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }
}

struct InFlight {
    token: CancellationToken,
    done: watch::Receiver<Option<Action>>,
}

#[derive(Default)]
struct PollState {
    subscribers: Vec<(u64, u64)>,
    task: Option<(u64, AbortHandle)>,
}

struct ApiCore {
    options: ApiOptions,
    endpoints: HashMap<String, EndpointDef>,
    in_flight: Mutex<HashMap<String, InFlight>>,
    eviction: Mutex<HashMap<String, AbortHandle>>,
    polling: Mutex<HashMap<String, PollState>>,
    focus_flags: Mutex<HashMap<String, usize>>,
    next_poll_id: AtomicU64,
}

/// An api instance: cheap to clone, share one per `reducer_path`.
#[derive(Clone)]
pub struct Api {
    core: Arc<ApiCore>,
}

/// Build an api from options and an endpoint map.
pub fn create_api(options: ApiOptions, endpoints: impl FnOnce(&mut EndpointBuilder)) -> Api {
    let mut builder = EndpointBuilder::default();
    endpoints(&mut builder);
    Api {
        core: Arc::new(ApiCore {
            options,
            endpoints: builder.endpoints,
            in_flight: Mutex::new(HashMap::new()),
            eviction: Mutex::new(HashMap::new()),
            polling: Mutex::new(HashMap::new()),
            focus_flags: Mutex::new(HashMap::new()),
            next_poll_id: AtomicU64::new(0),
        }),
    }
}

impl Api {
    pub fn reducer_path(&self) -> &str {
        &self.core.options.reducer_path
    }

    /// The declared tag universe.
    pub fn tag_types(&self) -> &[String] {
        &self.core.options.tag_types
    }

    /// The lifecycle type prefix for an endpoint.
    pub fn endpoint_prefix(&self, endpoint: &str) -> String {
        format!("{}/{endpoint}", self.core.options.reducer_path)
    }

    pub fn add_subscription_type(&self) -> String {
        format!("{}/subscriptions/add", self.core.options.reducer_path)
    }

    pub fn remove_subscription_type(&self) -> String {
        format!("{}/subscriptions/remove", self.core.options.reducer_path)
    }

    pub fn remove_query_type(&self) -> String {
        format!("{}/removeQueryResult", self.core.options.reducer_path)
    }

    pub fn remove_mutation_type(&self) -> String {
        format!("{}/removeMutationResult", self.core.options.reducer_path)
    }

    pub fn invalidate_tags_type(&self) -> String {
        format!("{}/invalidateTags", self.core.options.reducer_path)
    }

    pub fn reset_type(&self) -> String {
        format!("{}/resetApiState", self.core.options.reducer_path)
    }

    pub fn focus_type(&self) -> String {
        format!("{}/onFocus", self.core.options.reducer_path)
    }

    /// The cache key for an endpoint invocation.
    pub fn cache_key_for(&self, endpoint: &str, arg: &Value) -> String {
        cache_key(endpoint, arg)
    }

    pub fn add_subscription_action(&self, key: &str) -> Action {
        Action::new(self.add_subscription_type()).with_payload(json!({ EXTRA_CACHE_KEY: key }))
    }

    pub fn remove_subscription_action(&self, key: &str) -> Action {
        Action::new(self.remove_subscription_type()).with_payload(json!({ EXTRA_CACHE_KEY: key }))
    }

    pub fn remove_query_action(&self, key: &str) -> Action {
        Action::new(self.remove_query_type()).with_payload(json!({ EXTRA_CACHE_KEY: key }))
    }

    pub fn remove_mutation_action(&self, key: &str) -> Action {
        Action::new(self.remove_mutation_type()).with_payload(json!({ "key": key }))
    }

    /// Manually invalidate cache entries by tag.
    pub fn invalidate_tags_action(&self, tags: Vec<Tag>) -> Action {
        Action::new(self.invalidate_tags_type())
            .with_payload(serde_json::to_value(tags).unwrap_or(Value::Null))
    }

    pub fn reset_action(&self) -> Action {
        Action::new(self.reset_type())
    }

    /// Notify the middleware of a window-focus event.
    pub fn focus_action(&self) -> Action {
        Action::new(self.focus_type())
    }

    /// The reducer owning the api sub-state; mount it at
    /// [`Api::reducer_path`].
    pub fn reducer(&self) -> SliceReducer {
        let core = self.core.clone();
        Arc::new(move |state, action| core.reduce(state, action))
    }

    /// The request state machine; install it alongside the thunk middleware.
    pub fn middleware(&self) -> Arc<dyn Middleware> {
        Arc::new(ApiMiddleware {
            core: self.core.clone(),
        })
    }

    /// Build the initiate thunk for a query endpoint.
    pub fn initiate(&self, endpoint: &str, arg: Value, options: InitiateOptions) -> Thunk {
        let core = self.core.clone();
        let endpoint = endpoint.to_string();
        Thunk::new(move |ctx: ThunkContext| {
            Box::pin(async move { core.run_query(ctx, endpoint, arg, options).await })
        })
    }

    /// Build the initiate thunk for a mutation endpoint. `fixed_cache_key`
    /// shares mutation state across call sites.
    pub fn mutate(&self, endpoint: &str, arg: Value, fixed_cache_key: Option<String>) -> Thunk {
        let core = self.core.clone();
        let endpoint = endpoint.to_string();
        Thunk::new(move |ctx: ThunkContext| {
            Box::pin(async move { core.run_mutation(ctx, endpoint, arg, fixed_cache_key).await })
        })
    }

    /// A selector for the cache entry of `(endpoint, arg)`.
    pub fn select_query(
        &self,
        endpoint: &str,
        arg: &Value,
    ) -> impl Fn(&StateRef) -> CacheEntry + Send + Sync + Clone + 'static {
        let path = self.core.options.reducer_path.clone();
        let key = cache_key(endpoint, arg);
        move |state: &StateRef| {
            ApiState::from_slice(state.get(&path)).entry(&key)
        }
    }

    /// A selector for a mutation entry by request id or fixed cache key.
    pub fn select_mutation(
        &self,
        key: &str,
    ) -> impl Fn(&StateRef) -> CacheEntry + Send + Sync + Clone + 'static {
        let path = self.core.options.reducer_path.clone();
        let key = key.to_string();
        move |state: &StateRef| {
            ApiState::from_slice(state.get(&path))
                .mutations
                .get(&key)
                .and_then(|value| serde_json::from_value(value.clone()).ok())
                .unwrap_or_default()
        }
    }

    /// Live subscriber refcount for a cache key.
    pub fn subscriber_count(&self, state: &StateRef, key: &str) -> u64 {
        ApiState::from_slice(state.get(&self.core.options.reducer_path)).subscriber_count(key)
    }

    pub(crate) fn register_focus(&self, key: &str) {
        let mut flags = lock(&self.core.focus_flags);
        *flags.entry(key.to_string()).or_insert(0) += 1;
    }

    pub(crate) fn deregister_focus(&self, key: &str) {
        let mut flags = lock(&self.core.focus_flags);
        if let Some(count) = flags.get_mut(key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                flags.remove(key);
            }
        }
    }

    /// Start (or join) interval polling for a cache key. Polling restarts
    /// with the shortest registered interval and stops when the last
    /// registration is dropped or subscribers reach zero.
    pub(crate) fn register_polling(
        &self,
        dispatch: DispatchFn,
        get_state: crate::store::GetStateFn,
        endpoint: &str,
        arg: &Value,
        interval_ms: u64,
    ) -> u64 {
        let key = cache_key(endpoint, arg);
        let id = self.core.next_poll_id.fetch_add(1, Ordering::Relaxed);
        let mut polling = lock(&self.core.polling);
        let state = polling.entry(key.clone()).or_default();
        state.subscribers.push((id, interval_ms));
        self.core.clone().restart_polling(
            state,
            key,
            endpoint.to_string(),
            arg.clone(),
            dispatch,
            get_state,
        );
        id
    }

    pub(crate) fn deregister_polling(&self, endpoint: &str, arg: &Value, id: u64) {
        let key = cache_key(endpoint, arg);
        let mut polling = lock(&self.core.polling);
        if let Some(state) = polling.get_mut(&key) {
            state.subscribers.retain(|(sub_id, _)| *sub_id != id);
            if state.subscribers.is_empty() {
                if let Some((_, task)) = state.task.take() {
                    task.abort();
                }
                polling.remove(&key);
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

enum Classified {
    SubscriptionAdd(String),
    SubscriptionRemove(String),
    RemoveQuery(String),
    RemoveMutation(String),
    InvalidateTags(Vec<Tag>),
    Reset,
    Focus,
    Lifecycle { phase: RequestStatus },
    Other,
}

impl ApiCore {
    fn classify(&self, action: &Action) -> Classified {
        let path = &self.options.reducer_path;
        let payload_key = |action: &Action| {
            action
                .payload
                .as_ref()
                .and_then(|payload| payload.get(EXTRA_CACHE_KEY))
                .and_then(Value::as_str)
                .map(str::to_string)
        };

        if action.kind == format!("{path}/subscriptions/add") {
            if let Some(key) = payload_key(action) {
                return Classified::SubscriptionAdd(key);
            }
        } else if action.kind == format!("{path}/subscriptions/remove") {
            if let Some(key) = payload_key(action) {
                return Classified::SubscriptionRemove(key);
            }
        } else if action.kind == format!("{path}/removeQueryResult") {
            if let Some(key) = payload_key(action) {
                return Classified::RemoveQuery(key);
            }
        } else if action.kind == format!("{path}/removeMutationResult") {
            if let Some(key) = action
                .payload
                .as_ref()
                .and_then(|payload| payload.get("key"))
                .and_then(Value::as_str)
            {
                return Classified::RemoveMutation(key.to_string());
            }
        } else if action.kind == format!("{path}/invalidateTags") {
            let tags = action
                .payload
                .as_ref()
                .and_then(|payload| serde_json::from_value(payload.clone()).ok())
                .unwrap_or_default();
            return Classified::InvalidateTags(tags);
        } else if action.kind == format!("{path}/resetApiState") {
            return Classified::Reset;
        } else if action.kind == format!("{path}/onFocus") {
            return Classified::Focus;
        } else if action.kind.starts_with(&format!("{path}/")) {
            if let Some(phase) = action.request_status() {
                return Classified::Lifecycle { phase };
            }
        }
        Classified::Other
    }

    fn reduce(&self, state: Option<&Value>, action: &Action) -> Value {
        let mut api_state = ApiState::from_slice(state);

        match self.classify(action) {
            Classified::SubscriptionAdd(key) => {
                let count = api_state.subscriber_count(&key);
                api_state.subscriptions.insert(key, json!(count + 1));
            }
            Classified::SubscriptionRemove(key) => {
                let count = api_state.subscriber_count(&key);
                if count <= 1 {
                    api_state.subscriptions.remove(&key);
                } else {
                    api_state.subscriptions.insert(key, json!(count - 1));
                }
            }
            Classified::RemoveQuery(key) => {
                api_state.queries.remove(&key);
                strip_provided(&mut api_state.provided, &key);
            }
            Classified::RemoveMutation(key) => {
                api_state.mutations.remove(&key);
            }
            Classified::Reset => {
                api_state = ApiState::default();
            }
            Classified::Lifecycle { phase } => {
                self.reduce_lifecycle(&mut api_state, action, phase);
            }
            Classified::InvalidateTags(_) | Classified::Focus | Classified::Other => {}
        }

        api_state.into_value()
    }

    fn reduce_lifecycle(&self, api_state: &mut ApiState, action: &Action, phase: RequestStatus) {
        let Some(meta) = action.meta.as_ref() else {
            return;
        };

        if let Some(key) = meta.extra.get(EXTRA_CACHE_KEY).and_then(Value::as_str) {
            let mut entry = api_state.entry(key);
            match phase {
                RequestStatus::Pending => {
                    entry.status = QueryStatus::Pending;
                    entry.endpoint = meta
                        .extra
                        .get(EXTRA_ENDPOINT)
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    entry.original_args = meta.arg.clone();
                    entry.request_id = meta.request_id.clone();
                    entry.error = None;
                }
                RequestStatus::Fulfilled => {
                    if entry.request_id != meta.request_id {
                        return;
                    }
                    entry.status = QueryStatus::Fulfilled;
                    entry.data = action.payload.clone();
                    entry.error = None;
                    entry.last_fetched = Some(now_millis());
                    let tags: Vec<Tag> = meta
                        .extra
                        .get(EXTRA_PROVIDED)
                        .and_then(|tags| serde_json::from_value(tags.clone()).ok())
                        .unwrap_or_default();
                    record_provided(&mut api_state.provided, key, &tags);
                }
                RequestStatus::Rejected => {
                    if entry.request_id != meta.request_id {
                        return;
                    }
                    entry.status = QueryStatus::Rejected;
                    entry.error = action
                        .payload
                        .as_ref()
                        .and_then(|payload| serde_json::from_value(payload.clone()).ok());
                }
            }
            if let Ok(encoded) = serde_json::to_value(&entry) {
                api_state.queries.insert(key.to_string(), encoded);
            }
        } else if let Some(key) = meta.extra.get(EXTRA_MUTATION_KEY).and_then(Value::as_str) {
            let mut entry: CacheEntry = api_state
                .mutations
                .get(key)
                .and_then(|value| serde_json::from_value(value.clone()).ok())
                .unwrap_or_default();
            match phase {
                RequestStatus::Pending => {
                    entry.status = QueryStatus::Pending;
                    entry.endpoint = meta
                        .extra
                        .get(EXTRA_ENDPOINT)
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    entry.original_args = meta.arg.clone();
                    entry.request_id = meta.request_id.clone();
                    entry.error = None;
                }
                RequestStatus::Fulfilled => {
                    entry.status = QueryStatus::Fulfilled;
                    entry.data = action.payload.clone();
                    entry.error = None;
                    entry.last_fetched = Some(now_millis());
                }
                RequestStatus::Rejected => {
                    entry.status = QueryStatus::Rejected;
                    entry.error = action
                        .payload
                        .as_ref()
                        .and_then(|payload| serde_json::from_value(payload.clone()).ok());
                }
            }
            if let Ok(encoded) = serde_json::to_value(&entry) {
                api_state.mutations.insert(key.to_string(), encoded);
            }
        }
    }

    async fn run_query(
        self: Arc<Self>,
        ctx: ThunkContext,
        endpoint_name: String,
        arg: Value,
        options: InitiateOptions,
    ) -> Action {
        let key = cache_key(&endpoint_name, &arg);
        let prefix = format!("{}/{endpoint_name}", self.options.reducer_path);

        if options.subscribe {
            dispatch_or_warn(
                &ctx.dispatch,
                Action::new(format!("{}/subscriptions/add", self.options.reducer_path))
                    .with_payload(json!({ EXTRA_CACHE_KEY: key })),
            );
        }

        // Deduplicate: join an in-flight request for the same key instead of
        // starting a second one.
        let waiter = lock(&self.in_flight).get(&key).map(|flight| flight.done.clone());
        if let Some(mut done) = waiter {
            if let Ok(terminal) = done.wait_for(Option::is_some).await {
                if let Some(action) = (*terminal).clone() {
                    return action;
                }
            }
            // The request side dropped without publishing; fall through and
            // fetch fresh.
        }

        let entry = {
            let state = (ctx.get_state)();
            ApiState::from_slice(state.get(&self.options.reducer_path)).entry(&key)
        };
        if entry.status == QueryStatus::Fulfilled && !options.force {
            let stale = options.refetch_on_mount
                && match (options.stale_time_ms, entry.last_fetched) {
                    // A zero stale time never serves cached data.
                    (Some(stale_after), Some(last)) => now_millis() - last >= stale_after,
                    _ => true,
                };
            if !stale {
                // Serve from cache: a synthetic fulfilled action, not
                // re-dispatched.
                let mut meta = ActionMeta::for_request(
                    entry.request_id.clone().unwrap_or_default(),
                    arg.clone(),
                    RequestStatus::Fulfilled,
                );
                meta.extra.insert(EXTRA_CACHE_KEY.into(), json!(key));
                return Action::new(format!("{prefix}/fulfilled"))
                    .with_payload(entry.data.clone().unwrap_or(Value::Null))
                    .with_meta(meta);
            }
        }

        let Some(EndpointDef::Query(def)) = self.endpoints.get(&endpoint_name).cloned() else {
            tracing::error!(endpoint = %endpoint_name, "unknown query endpoint");
            return Action::new(format!("{prefix}/rejected")).with_error(
                crate::error::SerializedError::from_message(format!(
                    "unknown query endpoint: {endpoint_name}"
                )),
            );
        };

        let request_id = Uuid::new_v4().to_string();
        let token = CancellationToken::new();
        let (publish, done) = watch::channel(None);
        lock(&self.in_flight).insert(
            key.clone(),
            InFlight {
                token: token.clone(),
                done,
            },
        );

        let mut pending_meta =
            ActionMeta::for_request(&request_id, arg.clone(), RequestStatus::Pending);
        pending_meta
            .extra
            .insert(EXTRA_CACHE_KEY.into(), json!(key));
        pending_meta
            .extra
            .insert(EXTRA_ENDPOINT.into(), json!(endpoint_name));
        dispatch_or_warn(
            &ctx.dispatch,
            Action::new(format!("{prefix}/pending")).with_meta(pending_meta),
        );

        let request_args = (def.query)(&arg);
        let result = self
            .options
            .base_query
            .execute(
                request_args,
                BaseQueryApi {
                    signal: token.clone(),
                    dispatch: ctx.dispatch.clone(),
                    get_state: ctx.get_state.clone(),
                },
            )
            .await;

        let terminal = match result {
            Ok(data) => {
                let data = match &def.transform_response {
                    Some(transform) => transform(data),
                    None => data,
                };
                let tags = def
                    .provides_tags
                    .as_ref()
                    .map(|provides| provides(Some(&data), None, &arg))
                    .unwrap_or_default();
                let mut meta =
                    ActionMeta::for_request(&request_id, arg.clone(), RequestStatus::Fulfilled);
                meta.extra.insert(EXTRA_CACHE_KEY.into(), json!(key));
                meta.extra.insert(EXTRA_ENDPOINT.into(), json!(endpoint_name));
                meta.extra.insert(
                    EXTRA_PROVIDED.into(),
                    serde_json::to_value(&tags).unwrap_or(Value::Null),
                );
                Action::new(format!("{prefix}/fulfilled"))
                    .with_payload(data)
                    .with_meta(meta)
            }
            Err(error) => {
                let mut meta =
                    ActionMeta::for_request(&request_id, arg.clone(), RequestStatus::Rejected);
                meta.aborted = token.is_cancelled();
                meta.extra.insert(EXTRA_CACHE_KEY.into(), json!(key));
                meta.extra.insert(EXTRA_ENDPOINT.into(), json!(endpoint_name));
                Action::new(format!("{prefix}/rejected"))
                    .with_payload(serde_json::to_value(&error).unwrap_or(Value::Null))
                    .with_meta(meta)
            }
        };

        lock(&self.in_flight).remove(&key);
        dispatch_or_warn(&ctx.dispatch, terminal.clone());
        let _ = publish.send(Some(terminal.clone()));
        terminal
    }

    async fn run_mutation(
        self: Arc<Self>,
        ctx: ThunkContext,
        endpoint_name: String,
        arg: Value,
        fixed_cache_key: Option<String>,
    ) -> Action {
        let prefix = format!("{}/{endpoint_name}", self.options.reducer_path);
        let Some(EndpointDef::Mutation(def)) = self.endpoints.get(&endpoint_name).cloned() else {
            tracing::error!(endpoint = %endpoint_name, "unknown mutation endpoint");
            return Action::new(format!("{prefix}/rejected")).with_error(
                crate::error::SerializedError::from_message(format!(
                    "unknown mutation endpoint: {endpoint_name}"
                )),
            );
        };

        let request_id = Uuid::new_v4().to_string();
        let key = fixed_cache_key.unwrap_or_else(|| request_id.clone());

        let mut pending_meta =
            ActionMeta::for_request(&request_id, arg.clone(), RequestStatus::Pending);
        pending_meta
            .extra
            .insert(EXTRA_MUTATION_KEY.into(), json!(key));
        pending_meta
            .extra
            .insert(EXTRA_ENDPOINT.into(), json!(endpoint_name));
        dispatch_or_warn(
            &ctx.dispatch,
            Action::new(format!("{prefix}/pending")).with_meta(pending_meta),
        );

        let request_args = (def.query)(&arg);
        let result = self
            .options
            .base_query
            .execute(
                request_args,
                BaseQueryApi {
                    signal: ctx.signal.clone(),
                    dispatch: ctx.dispatch.clone(),
                    get_state: ctx.get_state.clone(),
                },
            )
            .await;

        let terminal = match result {
            Ok(data) => {
                let data = match &def.transform_response {
                    Some(transform) => transform(data),
                    None => data,
                };
                let tags = def
                    .invalidates_tags
                    .as_ref()
                    .map(|invalidates| invalidates(Some(&data), None, &arg))
                    .unwrap_or_default();
                let mut meta =
                    ActionMeta::for_request(&request_id, arg.clone(), RequestStatus::Fulfilled);
                meta.extra.insert(EXTRA_MUTATION_KEY.into(), json!(key));
                meta.extra.insert(EXTRA_ENDPOINT.into(), json!(endpoint_name));
                meta.extra.insert(
                    EXTRA_INVALIDATES.into(),
                    serde_json::to_value(&tags).unwrap_or(Value::Null),
                );
                Action::new(format!("{prefix}/fulfilled"))
                    .with_payload(data)
                    .with_meta(meta)
            }
            Err(error) => {
                let mut meta =
                    ActionMeta::for_request(&request_id, arg.clone(), RequestStatus::Rejected);
                meta.extra.insert(EXTRA_MUTATION_KEY.into(), json!(key));
                meta.extra.insert(EXTRA_ENDPOINT.into(), json!(endpoint_name));
                Action::new(format!("{prefix}/rejected"))
                    .with_payload(serde_json::to_value(&error).unwrap_or(Value::Null))
                    .with_meta(meta)
            }
        };

        dispatch_or_warn(&ctx.dispatch, terminal.clone());
        terminal
    }

    /// Everything the reducer cannot do: cancellation, timers, refetch.
    fn post_process(self: &Arc<Self>, action: &Action, api: &MiddlewareApi) {
        match self.classify(action) {
            Classified::SubscriptionAdd(key) => {
                // A live subscriber cancels any scheduled eviction.
                if let Some(task) = lock(&self.eviction).remove(&key) {
                    task.abort();
                }
            }
            Classified::SubscriptionRemove(key) => {
                let state = (api.get_state)();
                let api_state = ApiState::from_slice(state.get(&self.options.reducer_path));
                if api_state.subscriber_count(&key) == 0 {
                    // Abandoned before completion: abort the shared request.
                    if let Some(flight) = lock(&self.in_flight).remove(&key) {
                        flight.token.cancel();
                    }
                    if let Some(mut poll) = lock(&self.polling).remove(&key) {
                        if let Some((_, task)) = poll.task.take() {
                            task.abort();
                        }
                    }
                    let keep = self.retention_for(api_state.entry(&key).endpoint.as_deref());
                    self.schedule_eviction(api, key, keep);
                }
            }
            Classified::InvalidateTags(tags) => {
                self.invalidate(api, &tags);
            }
            Classified::Lifecycle {
                phase: RequestStatus::Fulfilled,
            } => {
                let tags: Vec<Tag> = action
                    .meta
                    .as_ref()
                    .filter(|meta| meta.extra.contains_key(EXTRA_MUTATION_KEY))
                    .and_then(|meta| meta.extra.get(EXTRA_INVALIDATES))
                    .and_then(|tags| serde_json::from_value(tags.clone()).ok())
                    .unwrap_or_default();
                if !tags.is_empty() {
                    self.invalidate(api, &tags);
                }
            }
            Classified::Focus => {
                let state = (api.get_state)();
                let api_state = ApiState::from_slice(state.get(&self.options.reducer_path));
                let focused: Vec<String> = lock(&self.focus_flags).keys().cloned().collect();
                for key in focused {
                    if api_state.subscriber_count(&key) > 0 {
                        self.refetch_entry(api, &api_state.entry(&key));
                    }
                }
            }
            _ => {}
        }
    }

    fn retention_for(&self, endpoint: Option<&str>) -> f64 {
        endpoint
            .and_then(|name| self.endpoints.get(name))
            .and_then(|def| match def {
                EndpointDef::Query(query) => query.keep_unused_data_for,
                EndpointDef::Mutation(_) => None,
            })
            .unwrap_or(self.options.keep_unused_data_for)
    }

    fn schedule_eviction(self: &Arc<Self>, api: &MiddlewareApi, key: String, keep_seconds: f64) {
        let remove = Action::new(format!("{}/removeQueryResult", self.options.reducer_path))
            .with_payload(json!({ EXTRA_CACHE_KEY: key }));

        if keep_seconds <= 0.0 {
            dispatch_or_warn(&api.dispatch, remove);
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            // No runtime to host the timer; the entry is retained until the
            // next subscriber or reset.
            return;
        };

        let core = self.clone();
        let dispatch = api.dispatch.clone();
        let get_state = api.get_state.clone();
        let timer_key = key.clone();
        let task = handle.spawn(async move {
            tokio::time::sleep(Duration::from_secs_f64(keep_seconds)).await;
            let state = get_state();
            let api_state = ApiState::from_slice(state.get(&core.options.reducer_path));
            lock(&core.eviction).remove(&timer_key);
            if api_state.subscriber_count(&timer_key) == 0 {
                dispatch_or_warn(&dispatch, remove);
            }
        });
        lock(&self.eviction).insert(key, task.abort_handle());
    }

    fn invalidate(self: &Arc<Self>, api: &MiddlewareApi, tags: &[Tag]) {
        let state = (api.get_state)();
        let api_state = ApiState::from_slice(state.get(&self.options.reducer_path));

        let mut affected: HashSet<String> = HashSet::new();
        for tag in tags {
            let Some(buckets) = api_state.provided.get(&tag.kind).and_then(Value::as_object)
            else {
                continue;
            };
            let mut collect = |bucket: &Value| {
                if let Some(keys) = bucket.as_array() {
                    affected.extend(keys.iter().filter_map(Value::as_str).map(str::to_string));
                }
            };
            match &tag.id {
                Some(id) => {
                    if let Some(bucket) = buckets.get(&id.as_key()) {
                        collect(bucket);
                    }
                    if let Some(bucket) = buckets.get(GENERAL_BUCKET) {
                        collect(bucket);
                    }
                }
                None => {
                    for bucket in buckets.values() {
                        collect(bucket);
                    }
                }
            }
        }

        for key in affected {
            if api_state.subscriber_count(&key) > 0 {
                self.refetch_entry(api, &api_state.entry(&key));
            } else {
                dispatch_or_warn(
                    &api.dispatch,
                    Action::new(format!("{}/removeQueryResult", self.options.reducer_path))
                        .with_payload(json!({ EXTRA_CACHE_KEY: key })),
                );
            }
        }
    }

    fn refetch_entry(self: &Arc<Self>, api: &MiddlewareApi, entry: &CacheEntry) {
        let Some(endpoint) = entry.endpoint.clone() else {
            return;
        };
        let arg = entry.original_args.clone().unwrap_or(Value::Null);
        let core = self.clone();
        let thunk = Thunk::new(move |ctx: ThunkContext| {
            Box::pin(async move {
                core.run_query(
                    ctx,
                    endpoint,
                    arg,
                    InitiateOptions {
                        subscribe: false,
                        force: true,
                        ..InitiateOptions::default()
                    },
                )
                .await
            })
        });
        if let Err(err) = (api.dispatch)(Op::Thunk(thunk)) {
            tracing::warn!(error = %err, "query refetch dispatch failed");
        }
    }

    fn restart_polling(
        self: Arc<Self>,
        state: &mut PollState,
        key: String,
        endpoint: String,
        arg: Value,
        dispatch: DispatchFn,
        get_state: crate::store::GetStateFn,
    ) {
        let Some(min_interval) = state.subscribers.iter().map(|(_, ms)| *ms).min() else {
            return;
        };
        if let Some((current, _)) = &state.task {
            if *current == min_interval {
                return;
            }
        }
        if let Some((_, task)) = state.task.take() {
            task.abort();
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let core = self.clone();
        let path = self.options.reducer_path.clone();
        let task = handle.spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(min_interval)).await;
                let state = get_state();
                let api_state = ApiState::from_slice(state.get(&path));
                if api_state.subscriber_count(&key) == 0 {
                    break;
                }
                let core = core.clone();
                let endpoint = endpoint.clone();
                let arg = arg.clone();
                let thunk = Thunk::new(move |ctx: ThunkContext| {
                    Box::pin(async move {
                        core.run_query(
                            ctx,
                            endpoint,
                            arg,
                            InitiateOptions {
                                subscribe: false,
                                force: true,
                                ..InitiateOptions::default()
                            },
                        )
                        .await
                    })
                });
                if dispatch(Op::Thunk(thunk)).is_err() {
                    break;
                }
            }
        });
        state.task = Some((min_interval, task.abort_handle()));
    }
}

struct ApiMiddleware {
    core: Arc<ApiCore>,
}

impl Middleware for ApiMiddleware {
    fn wrap(self: Arc<Self>, api: MiddlewareApi, next: NextFn) -> NextFn {
        let core = self.core.clone();
        Arc::new(move |op| {
            let result = next(op)?;
            if let Dispatched::Action(action) = &result {
                core.post_process(action, &api);
            }
            Ok(result)
        })
    }
}

fn dispatch_or_warn(dispatch: &DispatchFn, action: Action) {
    if let Err(err) = dispatch(Op::Action(action)) {
        tracing::warn!(error = %err, "query engine dispatch failed");
    }
}

fn strip_provided(provided: &mut Map<String, Value>, key: &str) {
    let mut empty_types = Vec::new();
    for (tag_type, buckets) in provided.iter_mut() {
        if let Some(buckets) = buckets.as_object_mut() {
            let mut empty_buckets = Vec::new();
            for (bucket_key, bucket) in buckets.iter_mut() {
                if let Some(keys) = bucket.as_array_mut() {
                    keys.retain(|existing| existing.as_str() != Some(key));
                    if keys.is_empty() {
                        empty_buckets.push(bucket_key.clone());
                    }
                }
            }
            for bucket_key in empty_buckets {
                buckets.remove(&bucket_key);
            }
            if buckets.is_empty() {
                empty_types.push(tag_type.clone());
            }
        }
    }
    for tag_type in empty_types {
        provided.remove(&tag_type);
    }
}

fn record_provided(provided: &mut Map<String, Value>, key: &str, tags: &[Tag]) {
    strip_provided(provided, key);
    for tag in tags {
        let buckets = provided
            .entry(tag.kind.clone())
            .or_insert_with(|| json!({}));
        if let Some(buckets) = buckets.as_object_mut() {
            let bucket = buckets
                .entry(tag.provided_key())
                .or_insert_with(|| json!([]));
            if let Some(keys) = bucket.as_array_mut() {
                if !keys.iter().any(|existing| existing.as_str() == Some(key)) {
                    keys.push(json!(key));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::{create_store_with_middleware, ThunkMiddleware};
    use crate::query::base_query::BaseQueryFn;
    use crate::reducer::combine_reducers;
    use crate::store::Store;
    use std::sync::atomic::AtomicUsize;

    struct Harness {
        store: Store,
        api: Api,
        calls: Arc<AtomicUsize>,
    }

    fn harness(keep_unused_data_for: f64) -> Harness {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let base = Arc::new(BaseQueryFn(move |args: Value, _api: BaseQueryApi| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                // Yield so overlapping initiates observe the in-flight entry.
                tokio::time::sleep(Duration::from_millis(20)).await;
                if args.get("fail").is_some() {
                    Err(QueryError::http(500, json!({"reason": "server"})))
                } else {
                    Ok(json!({"served": args}))
                }
            }) as futures::future::BoxFuture<'static, Result<Value, QueryError>>
        }));

        let api = create_api(
            ApiOptions::new("api", base)
                .with_tag_types(vec!["Post".into()])
                .with_keep_unused_data_for(keep_unused_data_for),
            |endpoints| {
                endpoints
                    .query(
                        "getPosts",
                        QueryDef::new(|arg| arg.clone()).provides_tags(|_result, _error, _arg| {
                            vec![Tag::with_id("Post", "LIST")]
                        }),
                    )
                    .query("getUser", QueryDef::new(|arg| arg.clone()))
                    .mutation(
                        "createPost",
                        MutationDef::new(|arg| arg.clone()).invalidates_tags(
                            |_result, _error, _arg| vec![Tag::with_id("Post", "LIST")],
                        ),
                    );
            },
        );

        let root = combine_reducers(vec![("api", api.reducer())]);
        let store = create_store_with_middleware(
            root,
            None,
            vec![Arc::new(ThunkMiddleware::new()), api.middleware()],
        );
        Harness { store, api, calls }
    }

    async fn initiate(h: &Harness, endpoint: &str, arg: Value) -> Action {
        h.store
            .dispatch(h.api.initiate(endpoint, arg, InitiateOptions::default()))
            .unwrap()
            .resolved()
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn two_subscribers_share_one_request() {
        let h = harness(60.0);
        let arg = json!({"id": 1});

        let first = h
            .store
            .dispatch(h.api.initiate("getUser", arg.clone(), InitiateOptions::default()))
            .unwrap()
            .handle()
            .unwrap();
        let second = h
            .store
            .dispatch(h.api.initiate("getUser", arg.clone(), InitiateOptions::default()))
            .unwrap()
            .handle()
            .unwrap();

        let (a, b) = tokio::join!(first.wait(), second.wait());

        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.payload, b.payload);
        assert_eq!(a.payload, Some(json!({"served": {"id": 1}})));

        // Both subscribers are counted.
        let key = h.api.cache_key_for("getUser", &arg);
        assert_eq!(h.api.subscriber_count(&h.store.get_state(), &key), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn fulfilled_entries_serve_from_cache() {
        let h = harness(60.0);
        initiate(&h, "getUser", json!({"id": 1})).await;
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);

        let cached = initiate(&h, "getUser", json!({"id": 1})).await;
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cached.payload, Some(json!({"served": {"id": 1}})));

        // Force bypasses the cache but keeps prior data while pending.
        h.store
            .dispatch(h.api.initiate(
                "getUser",
                json!({"id": 1}),
                InitiateOptions {
                    force: true,
                    subscribe: false,
                    ..InitiateOptions::default()
                },
            ))
            .unwrap()
            .resolved()
            .await;
        assert_eq!(h.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_requests_store_the_error() {
        let h = harness(60.0);
        let terminal = initiate(&h, "getUser", json!({"id": 9, "fail": true})).await;
        assert!(terminal.kind.ends_with("/rejected"));

        let select = h.api.select_query("getUser", &json!({"id": 9, "fail": true}));
        let entry = select(&h.store.get_state());
        assert_eq!(entry.status, QueryStatus::Rejected);
        assert_eq!(entry.error, Some(QueryError::http(500, json!({"reason": "server"}))));
    }

    #[tokio::test(start_paused = true)]
    async fn mutation_invalidation_refetches_subscribed_queries() {
        let h = harness(60.0);
        initiate(&h, "getPosts", json!(null)).await;
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);

        let terminal = h
            .store
            .dispatch(h.api.mutate("createPost", json!({"title": "hi"}), None))
            .unwrap()
            .resolved()
            .await;
        assert!(terminal.kind.ends_with("/fulfilled"));

        // The refetch runs as a spawned thunk; let it complete.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.calls.load(Ordering::SeqCst), 3);

        let entry = h.api.select_query("getPosts", &json!(null))(&h.store.get_state());
        assert_eq!(entry.status, QueryStatus::Fulfilled);
    }

    #[tokio::test(start_paused = true)]
    async fn invalidation_drops_unsubscribed_entries() {
        let h = harness(60.0);
        initiate(&h, "getPosts", json!(null)).await;
        let key = h.api.cache_key_for("getPosts", &json!(null));
        h.store
            .dispatch(h.api.remove_subscription_action(&key))
            .unwrap();

        h.store
            .dispatch(h.api.mutate("createPost", json!({"title": "hi"}), None))
            .unwrap()
            .resolved()
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // refcount was 0: data dropped, no refetch.
        assert_eq!(h.calls.load(Ordering::SeqCst), 2);
        let entry = h.api.select_query("getPosts", &json!(null))(&h.store.get_state());
        assert!(entry.is_uninitialized());
    }

    #[tokio::test(start_paused = true)]
    async fn retention_evicts_after_the_window() {
        let h = harness(0.5);
        initiate(&h, "getUser", json!({"id": 4})).await;
        let key = h.api.cache_key_for("getUser", &json!({"id": 4}));

        h.store
            .dispatch(h.api.remove_subscription_action(&key))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;

        let entry = h.api.select_query("getUser", &json!({"id": 4}))(&h.store.get_state());
        assert!(entry.is_uninitialized());
    }

    #[tokio::test(start_paused = true)]
    async fn resubscription_cancels_eviction() {
        let h = harness(0.5);
        initiate(&h, "getUser", json!({"id": 5})).await;
        let key = h.api.cache_key_for("getUser", &json!({"id": 5}));

        h.store
            .dispatch(h.api.remove_subscription_action(&key))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // A new subscriber arrives inside the window and reuses the data.
        let cached = initiate(&h, "getUser", json!({"id": 5})).await;
        assert_eq!(cached.payload, Some(json!({"served": {"id": 5}})));

        tokio::time::sleep(Duration::from_millis(900)).await;
        let entry = h.api.select_query("getUser", &json!({"id": 5}))(&h.store.get_state());
        assert_eq!(entry.status, QueryStatus::Fulfilled);
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_retention_drops_immediately() {
        let h = harness(0.0);
        initiate(&h, "getUser", json!({"id": 6})).await;
        let key = h.api.cache_key_for("getUser", &json!({"id": 6}));

        h.store
            .dispatch(h.api.remove_subscription_action(&key))
            .unwrap();

        let entry = h.api.select_query("getUser", &json!({"id": 6}))(&h.store.get_state());
        assert!(entry.is_uninitialized());
    }

    #[tokio::test(start_paused = true)]
    async fn mutations_track_state_by_fixed_cache_key() {
        let h = harness(60.0);
        h.store
            .dispatch(h.api.mutate(
                "createPost",
                json!({"title": "a"}),
                Some("shared".to_string()),
            ))
            .unwrap()
            .resolved()
            .await;

        let entry = h.api.select_mutation("shared")(&h.store.get_state());
        assert_eq!(entry.status, QueryStatus::Fulfilled);

        h.store
            .dispatch(h.api.remove_mutation_action("shared"))
            .unwrap();
        let entry = h.api.select_mutation("shared")(&h.store.get_state());
        assert!(entry.is_uninitialized());
    }

    #[tokio::test(start_paused = true)]
    async fn reset_clears_the_api_sub_state() {
        let h = harness(60.0);
        initiate(&h, "getUser", json!({"id": 1})).await;
        h.store.dispatch(h.api.reset_action()).unwrap();

        let state = h.store.get_state();
        assert_eq!(
            state["api"],
            json!({"queries": {}, "mutations": {}, "provided": {}, "subscriptions": {}})
        );
    }

    #[tokio::test(start_paused = true)]
    async fn select_query_defaults_to_uninitialized() {
        let h = harness(60.0);
        let entry = h.api.select_query("getUser", &json!({"id": 42}))(&h.store.get_state());
        assert!(entry.is_uninitialized());
        assert!(entry.data.is_none());
    }
}
