//! Test utilities for flux-dispatch applications.
//!
//! - [`ActionRecorder`]: middleware that captures every dispatched action,
//!   for asserting lifecycle sequences.
//! - [`recording_store`]: a passthrough store wired with the recorder and
//!   thunk middleware.
//! - Time control helpers (feature `testing-time`) for driving debounced
//!   and polled work deterministically.

use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::action::Action;
use crate::middleware::{
    create_store_with_middleware, Middleware, MiddlewareApi, NextFn, ThunkMiddleware,
};
use crate::store::{Op, RootReducer, Store};

/// Middleware that records every plain action flowing through the chain.
///
/// Clones share the same buffer, so keep one clone in the test and install
/// another in the store.
#[derive(Clone, Default)]
pub struct ActionRecorder {
    inner: Arc<Mutex<Vec<Action>>>,
}

impl ActionRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every recorded action, in dispatch order.
    pub fn actions(&self) -> Vec<Action> {
        self.inner.lock().unwrap().clone()
    }

    /// Just the action types, in dispatch order.
    pub fn kinds(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .map(|action| action.kind.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }
}

impl Middleware for ActionRecorder {
    fn wrap(self: Arc<Self>, _api: MiddlewareApi, next: NextFn) -> NextFn {
        Arc::new(move |op| match op {
            Op::Action(action) => {
                self.inner.lock().unwrap().push(action.clone());
                next(Op::Action(action))
            }
            op => next(op),
        })
    }
}

/// A store whose state passes through unchanged, wired with an
/// [`ActionRecorder`] and thunk middleware. Returns the store and a handle
/// to the recorder.
pub fn recording_store() -> (Store, ActionRecorder) {
    recording_store_with_reducer(Arc::new(|state, _action| {
        state.cloned().unwrap_or(Value::Null)
    }))
}

/// Like [`recording_store`] but with a caller-provided root reducer.
pub fn recording_store_with_reducer(reducer: RootReducer) -> (Store, ActionRecorder) {
    let recorder = ActionRecorder::new();
    let store = create_store_with_middleware(
        reducer,
        None,
        vec![
            Arc::new(recorder.clone()),
            Arc::new(ThunkMiddleware::new()),
        ],
    );
    (store, recorder)
}

/// Pause the tokio clock. Requires a current-thread test runtime.
#[cfg(feature = "testing-time")]
pub fn pause_time() {
    tokio::time::pause();
}

/// Resume the tokio clock.
#[cfg(feature = "testing-time")]
pub fn resume_time() {
    tokio::time::resume();
}

/// Advance the paused tokio clock, firing any timers that come due.
#[cfg(feature = "testing-time")]
pub async fn advance_time(duration: std::time::Duration) {
    tokio::time::advance(duration).await;
}
