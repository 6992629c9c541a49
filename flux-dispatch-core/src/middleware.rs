//! Middleware pipeline and enhancer composition.
//!
//! A middleware wraps dispatch: it receives the store api and the next stage
//! of the chain once at setup, and returns its own dispatch stage. Stages
//! compose right-to-left around the base dispatch, so the first middleware
//! in the list sees every dispatched op first.
//!
//! # Example
//!
//! ```ignore
//! use flux_dispatch_core::prelude::*;
//!
//! let store = create_store_with_enhancer(
//!     reducer,
//!     None,
//!     apply_middleware(vec![Arc::new(ThunkMiddleware::default())]),
//! );
//! ```

use std::any::Any;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::StoreError;
use crate::store::{
    Dispatched, DispatchFn, Enhancer, GetStateFn, Op, Store, StoreCreator, ThunkContext,
    ThunkHandle,
};

/// The store surface handed to middleware at setup.
///
/// `dispatch` refers to the fully wrapped outer chain, enabling recursive
/// dispatch; invoking it while the chain is still being composed returns
/// [`StoreError::DispatchDuringSetup`].
#[derive(Clone)]
pub struct MiddlewareApi {
    pub dispatch: DispatchFn,
    pub get_state: GetStateFn,
}

/// One stage of the composed dispatch chain.
pub type NextFn = Arc<dyn Fn(Op) -> Result<Dispatched, StoreError> + Send + Sync>;

/// A function wrapping dispatch, producing a new dispatch.
pub trait Middleware: Send + Sync {
    fn wrap(self: Arc<Self>, api: MiddlewareApi, next: NextFn) -> NextFn;
}

/// Right-to-left function composition; zero functions yields identity.
pub fn compose<T: 'static>(fns: Vec<Box<dyn FnOnce(T) -> T>>) -> Box<dyn FnOnce(T) -> T> {
    Box::new(move |seed| fns.into_iter().rev().fold(seed, |acc, f| f(acc)))
}

/// Compose enhancers right-to-left into a single enhancer.
pub fn compose_enhancers(enhancers: Vec<Enhancer>) -> Enhancer {
    Box::new(move |creator: StoreCreator| {
        enhancers
            .into_iter()
            .rev()
            .fold(creator, |acc, enhancer| enhancer(acc))
    })
}

/// Build an enhancer that composes `middlewares` around the base dispatch.
pub fn apply_middleware(middlewares: Vec<Arc<dyn Middleware>>) -> Enhancer {
    Box::new(move |create: StoreCreator| {
        Box::new(move |reducer, preloaded| {
            let store = create(reducer, preloaded);
            store.begin_chain_setup();

            let api = MiddlewareApi {
                dispatch: {
                    let store = store.clone();
                    Arc::new(move |op| store.dispatch(op))
                },
                get_state: {
                    let store = store.clone();
                    Arc::new(move || store.get_state())
                },
            };

            let mut next: NextFn = {
                let store = store.clone();
                Arc::new(move |op| store.base_op(op))
            };
            for middleware in middlewares.iter().rev() {
                next = middleware.clone().wrap(api.clone(), next.clone());
            }

            store.install_chain(next);
            store
        })
    })
}

/// Convenience: create an enhanced store with the given middleware chain.
pub fn create_store_with_middleware(
    reducer: crate::store::RootReducer,
    preloaded: Option<serde_json::Value>,
    middlewares: Vec<Arc<dyn Middleware>>,
) -> Store {
    crate::store::create_store_with_enhancer(reducer, preloaded, apply_middleware(middlewares))
}

/// Middleware that intercepts [`Op::Thunk`] and spawns the thunk body.
///
/// The body receives `(dispatch, get_state, extra)` through a
/// [`ThunkContext`]; its future is spawned on the ambient tokio runtime and
/// surfaced to the caller as a [`ThunkHandle`]. Plain actions delegate to
/// `next`.
#[derive(Default)]
pub struct ThunkMiddleware {
    extra: Option<Arc<dyn Any + Send + Sync>>,
}

impl ThunkMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure the extra argument passed to every thunk body.
    pub fn with_extra(extra: Arc<dyn Any + Send + Sync>) -> Self {
        Self { extra: Some(extra) }
    }
}

impl Middleware for ThunkMiddleware {
    fn wrap(self: Arc<Self>, api: MiddlewareApi, next: NextFn) -> NextFn {
        Arc::new(move |op| match op {
            Op::Thunk(thunk) => {
                let (body, request_id, token) = thunk.into_parts();
                let token = token.unwrap_or_else(CancellationToken::new);
                let ctx = ThunkContext {
                    dispatch: api.dispatch.clone(),
                    get_state: api.get_state.clone(),
                    extra: self.extra.clone(),
                    signal: token.clone(),
                };
                let join = tokio::spawn(body(ctx));
                Ok(Dispatched::Handle(ThunkHandle::new(request_id, token, join)))
            }
            op => next(op),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Action;
    use crate::store::{create_store_with_enhancer, RootReducer, Thunk};
    use serde_json::{json, Value};
    use std::sync::Mutex;

    fn tracking_reducer(log: Arc<Mutex<Vec<String>>>) -> RootReducer {
        Arc::new(move |state, action| {
            log.lock().unwrap().push(action.kind.clone());
            let count = state.and_then(Value::as_i64).unwrap_or(0);
            if action.kind == "bump" {
                json!(count + 1)
            } else {
                json!(count)
            }
        })
    }

    /// Tags every action payload with a marker so ordering is observable.
    struct TaggingMiddleware(&'static str);

    impl Middleware for TaggingMiddleware {
        fn wrap(self: Arc<Self>, _api: MiddlewareApi, next: NextFn) -> NextFn {
            let tag = self.0;
            Arc::new(move |op| match op {
                Op::Action(mut action) => {
                    let mut tags = action
                        .payload
                        .take()
                        .and_then(|p| match p {
                            Value::Array(items) => Some(items),
                            _ => None,
                        })
                        .unwrap_or_default();
                    tags.push(json!(tag));
                    next(Op::Action(action.with_payload(Value::Array(tags))))
                }
                op => next(op),
            })
        }
    }

    #[test]
    fn compose_is_right_to_left() {
        let double: Box<dyn FnOnce(i32) -> i32> = Box::new(|x| x * 2);
        let add_one: Box<dyn FnOnce(i32) -> i32> = Box::new(|x| x + 1);
        // compose(double, add_one)(3) = double(add_one(3)) = 8
        assert_eq!(compose(vec![double, add_one])(3), 8);
    }

    #[test]
    fn compose_of_nothing_is_identity() {
        assert_eq!(compose::<i32>(vec![])(7), 7);
    }

    /// Middleware that misuses the api dispatch during setup.
    struct EagerMiddleware {
        setup_result: Mutex<Option<Result<(), crate::error::StoreError>>>,
    }

    impl Middleware for EagerMiddleware {
        fn wrap(self: Arc<Self>, api: MiddlewareApi, next: NextFn) -> NextFn {
            let result = (api.dispatch)(Op::Action(Action::new("too-early"))).map(|_| ());
            *self.setup_result.lock().unwrap() = Some(result);
            next
        }
    }

    #[test]
    fn dispatching_during_middleware_setup_fails() {
        let eager = Arc::new(EagerMiddleware {
            setup_result: Mutex::new(None),
        });
        let log = Arc::new(Mutex::new(Vec::new()));
        let store = create_store_with_enhancer(
            tracking_reducer(log.clone()),
            None,
            apply_middleware(vec![eager.clone()]),
        );

        assert_eq!(
            eager.setup_result.lock().unwrap().clone(),
            Some(Err(crate::error::StoreError::DispatchDuringSetup))
        );
        // Once composed, dispatch works normally.
        store.dispatch(Action::new("bump")).unwrap();
    }

    #[test]
    fn middleware_runs_in_declaration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let store = create_store_with_enhancer(
            tracking_reducer(log.clone()),
            None,
            apply_middleware(vec![
                Arc::new(TaggingMiddleware("outer")),
                Arc::new(TaggingMiddleware("inner")),
            ]),
        );

        let committed = store
            .dispatch(Action::new("probe"))
            .unwrap()
            .action()
            .unwrap();
        assert_eq!(committed.payload, Some(json!(["outer", "inner"])));
    }

    #[tokio::test]
    async fn thunk_middleware_invokes_body_with_store_access() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let store = create_store_with_enhancer(
            tracking_reducer(log.clone()),
            None,
            apply_middleware(vec![Arc::new(ThunkMiddleware::new())]),
        );

        let thunk = Thunk::new(|ctx: ThunkContext| {
            Box::pin(async move {
                (ctx.dispatch)(Op::Action(Action::new("bump"))).ok();
                let state = (ctx.get_state)();
                Action::new("done").with_payload(state.as_ref().clone())
            })
        });

        let terminal = store.dispatch(thunk).unwrap().resolved().await;
        assert_eq!(terminal.kind, "done");
        assert_eq!(terminal.payload, Some(json!(1)));
    }

    #[tokio::test]
    async fn thunk_receives_extra_argument() {
        let store = create_store_with_enhancer(
            Arc::new(|_, _| Value::Null),
            None,
            apply_middleware(vec![Arc::new(ThunkMiddleware::with_extra(Arc::new(
                "api-client".to_string(),
            )))]),
        );

        let thunk = Thunk::new(|ctx: ThunkContext| {
            Box::pin(async move {
                let extra = ctx
                    .extra
                    .as_ref()
                    .and_then(|e| e.downcast_ref::<String>().cloned())
                    .unwrap_or_default();
                Action::new("done").with_payload(json!(extra))
            })
        });

        let terminal = store.dispatch(thunk).unwrap().resolved().await;
        assert_eq!(terminal.payload, Some(json!("api-client")));
    }
}
