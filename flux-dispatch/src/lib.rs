//! flux-dispatch: predictable state management for reactive Rust apps
//!
//! A Redux-lineage runtime: a reducer-driven store with middleware and
//! enhancers, an async thunk lifecycle with cancellation, an RTK-Query
//! style data-query engine with tag invalidation, and a persistence
//! subsystem with versioned migrations.
//!
//! # Example
//! ```ignore
//! use flux_dispatch::prelude::*;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let counter = create_reducer(json!(0), |builder| {
//!     builder.add_case("counter/increment", |draft, _| {
//!         Some(json!(draft.as_i64().unwrap_or(0) + 1))
//!     });
//! });
//!
//! let store = create_store_with_middleware(
//!     combine_reducers(vec![("counter", counter)]),
//!     None,
//!     vec![Arc::new(ThunkMiddleware::new())],
//! );
//!
//! store.dispatch(Action::new("counter/increment"))?;
//! assert_eq!(store.get_state()["counter"], json!(1));
//! ```

pub use flux_dispatch_core::*;

pub mod prelude {
    pub use flux_dispatch_core::prelude::*;
}
