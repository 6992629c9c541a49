//! Hook adapters: reactive views of query and mutation cache entries.
//!
//! A handle owns a store subscription and an [`ObservableCell`] holding the
//! derived view state. Mounting registers a cache subscription (which may
//! trigger a fetch), unmounting deregisters it and lets retention rules
//! apply. Consumers read the cell directly or subscribe for changes.

use std::sync::{Arc, Mutex};

use serde_json::Value;
use uuid::Uuid;

use crate::cell::{CellSubscription, ObservableCell};
use crate::error::QueryError;
use crate::query::api::{Api, InitiateOptions};
use crate::query::state::{CacheEntry, QueryStatus};
use crate::store::{Op, Store, SubscriptionHandle, ThunkHandle};

/// Behavior knobs for [`QueryHook::use_query`].
#[derive(Debug, Clone, Default)]
pub struct QueryHookOptions {
    /// Do not subscribe or fetch until triggered.
    pub skip: bool,
    /// Refetch on mount when the cached entry is stale.
    pub refetch_on_mount: bool,
    /// Staleness threshold for `refetch_on_mount`; `None` means always
    /// stale.
    pub stale_time_ms: Option<i64>,
    /// Refetch when the window regains focus.
    pub refetch_on_focus: bool,
    /// Poll at a fixed interval while mounted.
    pub polling_interval_ms: Option<u64>,
}

/// The reactive view of a query cache entry.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryHookState {
    /// Latest successful data, sticky across arg changes.
    pub data: Option<Value>,
    /// Latest successful data for the current arg, preserved during
    /// refetches.
    pub current_data: Option<Value>,
    pub error: Option<QueryError>,
    /// First load only.
    pub is_loading: bool,
    /// Any in-flight request, including refetches.
    pub is_fetching: bool,
    pub is_success: bool,
    pub is_error: bool,
    pub is_uninitialized: bool,
}

/// Factory for query handles on one endpoint.
pub struct QueryHook {
    store: Store,
    api: Api,
    endpoint: String,
}

/// Create the hook factory for a query endpoint.
pub fn create_query_hook(store: &Store, api: &Api, endpoint: &str) -> QueryHook {
    QueryHook {
        store: store.clone(),
        api: api.clone(),
        endpoint: endpoint.to_string(),
    }
}

impl QueryHook {
    /// Mount a reactive view for `arg`. Registers a cache subscription
    /// unless `skip` is set.
    pub fn use_query(&self, arg: Value, options: QueryHookOptions) -> QueryHandle {
        let inner = Arc::new(HandleInner {
            store: self.store.clone(),
            api: self.api.clone(),
            endpoint: self.endpoint.clone(),
            options: options.clone(),
            arg: Mutex::new(arg),
            sticky_data: Mutex::new(None),
            poll_id: Mutex::new(None),
            mounted: Mutex::new(false),
            cell: ObservableCell::new(QueryHookState {
                is_uninitialized: true,
                ..QueryHookState::default()
            }),
        });

        let listener = inner.clone();
        let store_sub = self.store.subscribe(move || listener.recompute());

        let handle = QueryHandle { inner, store_sub };
        if !options.skip {
            handle.inner.mount();
        }
        handle.inner.recompute();
        handle
    }
}

struct HandleInner {
    store: Store,
    api: Api,
    endpoint: String,
    options: QueryHookOptions,
    arg: Mutex<Value>,
    sticky_data: Mutex<Option<Value>>,
    poll_id: Mutex<Option<u64>>,
    mounted: Mutex<bool>,
    cell: ObservableCell<QueryHookState>,
}

impl HandleInner {
    fn current_arg(&self) -> Value {
        self.arg
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn mount(&self) {
        {
            let mut mounted = self.mounted.lock().unwrap_or_else(|p| p.into_inner());
            if *mounted {
                return;
            }
            *mounted = true;
        }
        let arg = self.current_arg();

        let initiate = self.api.initiate(
            &self.endpoint,
            arg.clone(),
            InitiateOptions {
                subscribe: true,
                force: false,
                refetch_on_mount: self.options.refetch_on_mount,
                stale_time_ms: self.options.stale_time_ms,
            },
        );
        if let Err(err) = self.store.dispatch(Op::Thunk(initiate)) {
            tracing::warn!(endpoint = %self.endpoint, error = %err, "query hook mount failed");
        }

        let key = self.api.cache_key_for(&self.endpoint, &arg);
        if self.options.refetch_on_focus {
            self.api.register_focus(&key);
        }
        if let Some(interval) = self.options.polling_interval_ms {
            let store = self.store.clone();
            let dispatch: crate::store::DispatchFn = {
                let store = store.clone();
                Arc::new(move |op| store.dispatch(op))
            };
            let get_state: crate::store::GetStateFn = Arc::new(move || store.get_state());
            let id =
                self.api
                    .register_polling(dispatch, get_state, &self.endpoint, &arg, interval);
            *self.poll_id.lock().unwrap_or_else(|p| p.into_inner()) = Some(id);
        }
    }

    fn unmount_subscription(&self) {
        {
            let mut mounted = self.mounted.lock().unwrap_or_else(|p| p.into_inner());
            if !*mounted {
                return;
            }
            *mounted = false;
        }
        let arg = self.current_arg();
        let key = self.api.cache_key_for(&self.endpoint, &arg);

        if self.options.refetch_on_focus {
            self.api.deregister_focus(&key);
        }
        if let Some(id) = self
            .poll_id
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            self.api.deregister_polling(&self.endpoint, &arg, id);
        }
        if let Err(err) = self.store.dispatch(self.api.remove_subscription_action(&key)) {
            tracing::warn!(endpoint = %self.endpoint, error = %err, "query hook unmount failed");
        }
    }

    fn entry(&self) -> CacheEntry {
        let arg = self.current_arg();
        let select = self.api.select_query(&self.endpoint, &arg);
        select(&self.store.get_state())
    }

    fn recompute(&self) {
        let entry = self.entry();
        let mut sticky = self
            .sticky_data
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if entry.status == QueryStatus::Fulfilled {
            sticky.clone_from(&entry.data);
        }

        let next = QueryHookState {
            data: sticky.clone().or_else(|| entry.data.clone()),
            current_data: entry.data.clone(),
            error: entry.error.clone(),
            is_loading: entry.is_fetching() && sticky.is_none() && entry.data.is_none(),
            is_fetching: entry.is_fetching(),
            is_success: entry.is_success(),
            is_error: entry.is_error(),
            is_uninitialized: entry.is_uninitialized(),
        };
        drop(sticky);
        self.cell.set_if_changed(next);
    }
}

/// A mounted reactive query view. Explicitly [`QueryHandle::unmount`] to
/// deregister; retention rules then apply to the cache entry.
#[derive(Clone)]
pub struct QueryHandle {
    inner: Arc<HandleInner>,
    store_sub: SubscriptionHandle,
}

impl QueryHandle {
    /// Snapshot of the reactive state.
    pub fn state(&self) -> QueryHookState {
        self.inner.cell.get()
    }

    /// Subscribe to state changes; returns a disposer.
    pub fn subscribe(
        &self,
        listener: impl Fn(&QueryHookState) + Send + Sync + 'static,
    ) -> CellSubscription<QueryHookState> {
        self.inner.cell.subscribe(listener)
    }

    /// Start a fresh request for the current arg, bypassing the cache.
    pub fn refetch(&self) -> Option<ThunkHandle> {
        let initiate = self.inner.api.initiate(
            &self.inner.endpoint,
            self.inner.current_arg(),
            InitiateOptions {
                subscribe: false,
                force: true,
                ..InitiateOptions::default()
            },
        );
        match self.inner.store.dispatch(Op::Thunk(initiate)) {
            Ok(dispatched) => dispatched.handle(),
            Err(err) => {
                tracing::warn!(error = %err, "refetch dispatch failed");
                None
            }
        }
    }

    /// Switch to a new arg: the old subscription is dropped, a new one is
    /// registered, and `data` stays sticky until fresh data lands.
    pub fn set_arg(&self, arg: Value) {
        self.inner.unmount_subscription();
        *self
            .inner
            .arg
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = arg;
        if !self.inner.options.skip {
            self.inner.mount();
        }
        self.inner.recompute();
    }

    /// Activate a skipped handle for `arg` (lazy queries).
    pub fn trigger(&self, arg: Value) {
        self.inner.unmount_subscription();
        *self
            .inner
            .arg
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = arg;
        self.inner.mount();
        self.inner.recompute();
    }

    /// Deregister the cache subscription and stop observing the store.
    pub fn unmount(&self) {
        self.inner.unmount_subscription();
        self.store_sub.unsubscribe();
    }
}

/// The reactive view of a mutation entry.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MutationHookState {
    pub data: Option<Value>,
    pub error: Option<QueryError>,
    pub is_loading: bool,
    pub is_success: bool,
    pub is_error: bool,
    pub is_uninitialized: bool,
}

/// Factory for mutation handles on one endpoint.
pub struct MutationHook {
    store: Store,
    api: Api,
    endpoint: String,
}

/// Create the hook factory for a mutation endpoint.
pub fn create_mutation_hook(store: &Store, api: &Api, endpoint: &str) -> MutationHook {
    MutationHook {
        store: store.clone(),
        api: api.clone(),
        endpoint: endpoint.to_string(),
    }
}

impl MutationHook {
    pub fn use_mutation(&self) -> MutationHandle {
        let inner = Arc::new(MutationInner {
            store: self.store.clone(),
            api: self.api.clone(),
            endpoint: self.endpoint.clone(),
            // One shared mutation key per handle, so repeated triggers
            // overwrite the same entry.
            key: format!("{}:{}", self.endpoint, Uuid::new_v4()),
            cell: ObservableCell::new(MutationHookState {
                is_uninitialized: true,
                ..MutationHookState::default()
            }),
        });

        let listener = inner.clone();
        let store_sub = self.store.subscribe(move || listener.recompute());
        MutationHandle { inner, store_sub }
    }
}

struct MutationInner {
    store: Store,
    api: Api,
    endpoint: String,
    key: String,
    cell: ObservableCell<MutationHookState>,
}

impl MutationInner {
    fn recompute(&self) {
        let select = self.api.select_mutation(&self.key);
        let entry = select(&self.store.get_state());
        let next = MutationHookState {
            data: entry.data.clone(),
            error: entry.error.clone(),
            is_loading: entry.is_fetching(),
            is_success: entry.is_success(),
            is_error: entry.is_error(),
            is_uninitialized: entry.is_uninitialized(),
        };
        self.cell.set_if_changed(next);
    }
}

/// A mounted mutation trigger plus its reactive state.
#[derive(Clone)]
pub struct MutationHandle {
    inner: Arc<MutationInner>,
    store_sub: SubscriptionHandle,
}

impl MutationHandle {
    /// Run the mutation. The handle's state tracks the latest trigger.
    pub fn trigger(&self, arg: Value) -> Option<ThunkHandle> {
        let mutate = self
            .inner
            .api
            .mutate(&self.inner.endpoint, arg, Some(self.inner.key.clone()));
        match self.inner.store.dispatch(Op::Thunk(mutate)) {
            Ok(dispatched) => dispatched.handle(),
            Err(err) => {
                tracing::warn!(error = %err, "mutation dispatch failed");
                None
            }
        }
    }

    pub fn state(&self) -> MutationHookState {
        self.inner.cell.get()
    }

    pub fn subscribe(
        &self,
        listener: impl Fn(&MutationHookState) + Send + Sync + 'static,
    ) -> CellSubscription<MutationHookState> {
        self.inner.cell.subscribe(listener)
    }

    /// Drop the mutation entry and return to `uninitialized`.
    pub fn reset(&self) {
        if let Err(err) = self
            .inner
            .store
            .dispatch(self.inner.api.remove_mutation_action(&self.inner.key))
        {
            tracing::warn!(error = %err, "mutation reset failed");
        }
    }

    pub fn unmount(&self) {
        self.store_sub.unsubscribe();
    }
}

/// Factory for lazy query handles: no auto-initiation.
pub struct LazyQueryHook {
    hook: QueryHook,
}

/// Create the hook factory for a lazily triggered query endpoint.
pub fn create_lazy_query_hook(store: &Store, api: &Api, endpoint: &str) -> LazyQueryHook {
    LazyQueryHook {
        hook: create_query_hook(store, api, endpoint),
    }
}

impl LazyQueryHook {
    /// Returns the trigger and the reactive handle; nothing runs until the
    /// trigger fires.
    pub fn use_lazy_query(&self) -> (LazyTrigger, QueryHandle) {
        let handle = self.hook.use_query(
            Value::Null,
            QueryHookOptions {
                skip: true,
                ..QueryHookOptions::default()
            },
        );
        (
            LazyTrigger {
                handle: handle.clone(),
            },
            handle,
        )
    }
}

/// Starts a lazy query for a given arg.
pub struct LazyTrigger {
    handle: QueryHandle,
}

impl LazyTrigger {
    pub fn trigger(&self, arg: Value) {
        self.handle.trigger(arg);
    }
}
