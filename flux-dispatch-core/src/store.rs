//! Store kernel: a reducer-driven, subscribable state container.
//!
//! The store holds one root state behind an [`Arc`] and is the single point
//! for state mutations through [`Store::dispatch`]. State identity is the
//! `Arc` pointer: a new allocation is made only when the reducer output
//! differs from the prior value, so subscribers and selectors can detect
//! change with a pointer comparison.
//!
//! # Example
//!
//! ```ignore
//! use flux_dispatch_core::prelude::*;
//! use serde_json::{json, Value};
//!
//! let reducer: RootReducer = std::sync::Arc::new(|state, action| {
//!     let mut count = state.and_then(Value::as_i64).unwrap_or(0);
//!     if action.kind == "counter/increment" {
//!         count += 1;
//!     }
//!     json!(count)
//! });
//!
//! let store = create_store(reducer, None);
//! store.dispatch(Action::new("counter/increment")).unwrap();
//! assert_eq!(*store.get_state(), json!(1));
//! ```

use std::any::Any;
use std::cell::Cell;
use std::future::{Future, IntoFuture};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::action::Action;
use crate::error::{SerializedError, StoreError};

/// Sentinel dispatched at construction so reducers materialize initial state.
pub const INIT_TYPE: &str = "@@INIT";
/// Sentinel dispatched by [`Store::replace_reducer`].
pub const REPLACE_TYPE: &str = "@@REPLACE";

/// Shared handle to the committed root state.
pub type StateRef = Arc<Value>;

/// The root reducer: `(state | None, action) -> state`.
pub type RootReducer = Arc<dyn Fn(Option<&Value>, &Action) -> Value + Send + Sync>;

/// Reads the committed state; handed to middleware and thunks.
pub type GetStateFn = Arc<dyn Fn() -> StateRef + Send + Sync>;

/// Dispatches through the fully wrapped chain; handed to middleware and thunks.
pub type DispatchFn = Arc<dyn Fn(Op) -> Result<Dispatched, StoreError> + Send + Sync>;

/// Wraps store creation; an enhancer may rewrap `dispatch`.
pub type StoreCreator = Box<dyn FnOnce(RootReducer, Option<Value>) -> Store>;

/// A function wrapping [`StoreCreator`].
pub type Enhancer = Box<dyn FnOnce(StoreCreator) -> StoreCreator>;

thread_local! {
    static IN_REDUCE: Cell<bool> = const { Cell::new(false) };
}

struct ReduceFlagGuard;

impl ReduceFlagGuard {
    fn enter() -> Self {
        IN_REDUCE.with(|flag| flag.set(true));
        ReduceFlagGuard
    }
}

impl Drop for ReduceFlagGuard {
    fn drop(&mut self) {
        IN_REDUCE.with(|flag| flag.set(false));
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The environment a thunk body runs in.
#[derive(Clone)]
pub struct ThunkContext {
    pub dispatch: DispatchFn,
    pub get_state: GetStateFn,
    /// The extra argument configured on the thunk middleware.
    pub extra: Option<Arc<dyn Any + Send + Sync>>,
    /// Cancellation signal owned by this invocation.
    pub signal: CancellationToken,
}

type ThunkBody = Box<dyn FnOnce(ThunkContext) -> BoxFuture<'static, Action> + Send>;

/// An action expressed as an async function of the store.
///
/// Thunks are intercepted by the thunk middleware, which invokes the body
/// with a [`ThunkContext`] and spawns the returned future. The future
/// resolves to the terminal action of the work it performed.
pub struct Thunk {
    body: ThunkBody,
    request_id: Option<String>,
    token: Option<CancellationToken>,
}

impl Thunk {
    pub fn new<F>(body: F) -> Self
    where
        F: FnOnce(ThunkContext) -> BoxFuture<'static, Action> + Send + 'static,
    {
        Self {
            body: Box::new(body),
            request_id: None,
            token: None,
        }
    }

    /// Attach a pre-generated request id, surfaced on the [`ThunkHandle`].
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Attach a pre-allocated cancellation token instead of letting the
    /// middleware allocate one.
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }

    pub(crate) fn into_parts(self) -> (ThunkBody, Option<String>, Option<CancellationToken>) {
        (self.body, self.request_id, self.token)
    }
}

impl std::fmt::Debug for Thunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Thunk")
            .field("request_id", &self.request_id)
            .finish()
    }
}

/// What can be dispatched: a plain action or a thunk.
#[derive(Debug)]
pub enum Op {
    Action(Action),
    Thunk(Thunk),
}

impl From<Action> for Op {
    fn from(action: Action) -> Self {
        Op::Action(action)
    }
}

impl From<Thunk> for Op {
    fn from(thunk: Thunk) -> Self {
        Op::Thunk(thunk)
    }
}

/// Handle to a spawned thunk invocation.
///
/// Awaiting the handle yields the terminal action (`fulfilled` or
/// `rejected`); [`ThunkHandle::abort`] cancels the invocation's signal.
#[derive(Debug)]
pub struct ThunkHandle {
    request_id: Option<String>,
    token: CancellationToken,
    join: JoinHandle<Action>,
}

impl ThunkHandle {
    pub(crate) fn new(
        request_id: Option<String>,
        token: CancellationToken,
        join: JoinHandle<Action>,
    ) -> Self {
        Self {
            request_id,
            token,
            join,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    /// Cancel the invocation's signal. Cooperative: the body observes the
    /// signal at its suspension points and the engine suppresses `fulfilled`
    /// for work that completes after the abort.
    pub fn abort(&self) {
        self.token.cancel();
    }

    /// Await the terminal action.
    pub async fn wait(self) -> Action {
        match self.join.await {
            Ok(action) => action,
            Err(err) => Action::new("@@thunk/join-error")
                .with_error(SerializedError::from_message(err.to_string())),
        }
    }
}

impl IntoFuture for ThunkHandle {
    type Output = Action;
    type IntoFuture = ThunkFuture;

    fn into_future(self) -> Self::IntoFuture {
        ThunkFuture {
            inner: Box::pin(self.wait()),
        }
    }
}

/// Future returned by awaiting a [`ThunkHandle`].
pub struct ThunkFuture {
    inner: Pin<Box<dyn Future<Output = Action> + Send>>,
}

impl Future for ThunkFuture {
    type Output = Action;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

/// Outcome of a dispatch: the committed action, or a handle for thunk work.
#[derive(Debug)]
pub enum Dispatched {
    Action(Action),
    Handle(ThunkHandle),
}

impl Dispatched {
    /// The committed action, if this dispatch was synchronous.
    pub fn action(self) -> Option<Action> {
        match self {
            Dispatched::Action(action) => Some(action),
            Dispatched::Handle(_) => None,
        }
    }

    /// The thunk handle, if this dispatch spawned async work.
    pub fn handle(self) -> Option<ThunkHandle> {
        match self {
            Dispatched::Action(_) => None,
            Dispatched::Handle(handle) => Some(handle),
        }
    }

    /// Resolve to the terminal action, awaiting thunk work when necessary.
    pub async fn resolved(self) -> Action {
        match self {
            Dispatched::Action(action) => action,
            Dispatched::Handle(handle) => handle.wait().await,
        }
    }
}

type Listener = Arc<dyn Fn() + Send + Sync>;

struct StoreInner {
    state: RwLock<Option<StateRef>>,
    reducer: RwLock<RootReducer>,
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_listener_id: AtomicU64,
    /// The fully wrapped dispatch chain once middleware is installed.
    chain: RwLock<ChainSlot>,
    /// Serializes reducer runs across threads.
    dispatch_guard: Mutex<()>,
}

enum ChainSlot {
    /// No enhancer installed; dispatch goes straight to the base.
    Base,
    /// Middleware composition in progress; dispatching is an error.
    Composing,
    Installed(DispatchFn),
}

/// A reducer-driven, subscribable state container.
///
/// Cheap to clone; all clones share the same state cell.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    fn new(reducer: RootReducer, preloaded: Option<Value>) -> Self {
        let store = Self {
            inner: Arc::new(StoreInner {
                state: RwLock::new(preloaded.map(Arc::new)),
                reducer: RwLock::new(reducer),
                listeners: Mutex::new(Vec::new()),
                next_listener_id: AtomicU64::new(0),
                chain: RwLock::new(ChainSlot::Base),
                dispatch_guard: Mutex::new(()),
            }),
        };
        // Reducers receive their initial state through the init sentinel.
        // The store starts consistent even if this errors, which it cannot:
        // the sentinel type is non-empty and no reducer is running yet.
        let _ = store.base_dispatch(Action::new(INIT_TYPE));
        store
    }

    /// The committed root state.
    pub fn get_state(&self) -> StateRef {
        self.inner
            .state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .unwrap_or_else(|| Arc::new(Value::Null))
    }

    /// Dispatch an action or thunk through the installed middleware chain.
    pub fn dispatch(&self, op: impl Into<Op>) -> Result<Dispatched, StoreError> {
        let op = op.into();
        let chain = {
            let slot = self
                .inner
                .chain
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match &*slot {
                ChainSlot::Base => None,
                ChainSlot::Composing => return Err(StoreError::DispatchDuringSetup),
                ChainSlot::Installed(chain) => Some(chain.clone()),
            }
        };
        match chain {
            Some(chain) => chain(op),
            None => self.base_op(op),
        }
    }

    /// Register a change listener. Listeners fire after each dispatch, in
    /// registration order, against the already-committed state.
    pub fn subscribe(&self, listener: impl Fn() + Send + Sync + 'static) -> SubscriptionHandle {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.listeners).push((id, Arc::new(listener)));
        SubscriptionHandle {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Swap the root reducer and dispatch the replace sentinel so the new
    /// reducer materializes any state it owns.
    pub fn replace_reducer(&self, next: RootReducer) -> Result<(), StoreError> {
        *self
            .inner
            .reducer
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = next;
        self.base_dispatch(Action::new(REPLACE_TYPE))?;
        Ok(())
    }

    pub(crate) fn begin_chain_setup(&self) {
        *self
            .inner
            .chain
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = ChainSlot::Composing;
    }

    pub(crate) fn install_chain(&self, chain: DispatchFn) {
        *self
            .inner
            .chain
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = ChainSlot::Installed(chain);
    }

    /// The base dispatch for an [`Op`], bypassing middleware. Thunks cannot
    /// be handled here; without thunk middleware they are a contract error.
    pub(crate) fn base_op(&self, op: Op) -> Result<Dispatched, StoreError> {
        match op {
            Op::Action(action) => self.base_dispatch(action).map(Dispatched::Action),
            Op::Thunk(_) => Err(StoreError::UnhandledThunk),
        }
    }

    /// Run the reducer for `action` and commit the result.
    pub(crate) fn base_dispatch(&self, action: Action) -> Result<Action, StoreError> {
        if action.kind.is_empty() {
            return Err(StoreError::InvalidAction);
        }
        if IN_REDUCE.with(|flag| flag.get()) {
            return Err(StoreError::ReentrantDispatch);
        }

        {
            let _serial = lock(&self.inner.dispatch_guard);
            let prior = self
                .inner
                .state
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone();
            let reducer = self
                .inner
                .reducer
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone();

            let next = {
                let _flag = ReduceFlagGuard::enter();
                reducer(prior.as_deref(), &action)
            };

            let unchanged = prior.as_deref().is_some_and(|value| *value == next);
            if !unchanged {
                *self
                    .inner
                    .state
                    .write()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Arc::new(next));
            }
        }

        self.notify();
        Ok(action)
    }

    fn notify(&self) {
        let snapshot: Vec<Listener> = lock(&self.inner.listeners)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in snapshot {
            // A panicking listener must not prevent later listeners from
            // running; isolate it and keep going.
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener())) {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic".to_string());
                tracing::warn!(panic = %message, "store listener panicked");
            }
        }
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("listeners", &lock(&self.inner.listeners).len())
            .finish()
    }
}

/// Handle returned by [`Store::subscribe`]; call
/// [`SubscriptionHandle::unsubscribe`] to deregister. Dropping the handle
/// leaves the listener installed.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    id: u64,
    inner: Weak<StoreInner>,
}

impl SubscriptionHandle {
    pub fn unsubscribe(&self) {
        if let Some(inner) = self.inner.upgrade() {
            lock(&inner.listeners).retain(|(id, _)| *id != self.id);
        }
    }
}

/// Create a store from a reducer and optional preloaded state.
pub fn create_store(reducer: RootReducer, preloaded: Option<Value>) -> Store {
    Store::new(reducer, preloaded)
}

/// Create a store through an enhancer, which may rewrap store creation.
pub fn create_store_with_enhancer(
    reducer: RootReducer,
    preloaded: Option<Value>,
    enhancer: Enhancer,
) -> Store {
    let base: StoreCreator = Box::new(Store::new);
    enhancer(base)(reducer, preloaded)
}
