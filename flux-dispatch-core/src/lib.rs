//! Core runtime for flux-dispatch
//!
//! A predictable state-management runtime for reactive client
//! applications, following a Redux-inspired architecture: a reducer-driven
//! store with enhancers and middleware, an async thunk lifecycle, a
//! cache-keyed data-query engine, and a storage persistence subsystem.
//!
//! # Core Concepts
//!
//! - **Action**: a plain record describing an intent, keyed by `type`
//! - **Store**: the subscribable state container with a middleware chain
//! - **Thunk**: async work dispatched through the store, with request ids
//!   and cancellation
//! - **Api**: cache-keyed queries and mutations with tag invalidation
//! - **Persistence**: rehydrate at startup, debounced writes, migrations
//!
//! # Basic Example
//!
//! ```ignore
//! use flux_dispatch_core::prelude::*;
//! use serde_json::json;
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
//! store.dispatch(Action::new("counter/increment"))?;
//! ```
//!
//! # Async Thunks
//!
//! ```ignore
//! let fetch_user = AsyncThunk::new("users/fetch", |arg, api: ThunkApi| {
//!     Box::pin(async move {
//!         let user = backend.user(&arg).await
//!             .map_err(ThunkError::failure)?;
//!         Ok(user)
//!     })
//! });
//!
//! // pending -> fulfilled|rejected -> settled, with a unique request id.
//! let terminal = store.dispatch(fetch_user.call(json!({"id": 1})))?
//!     .resolved()
//!     .await;
//! ```

pub mod action;
pub mod async_state;
pub mod cell;
pub mod entity;
pub mod error;
pub mod extensions;
pub mod middleware;
pub mod persist;
pub mod query;
pub mod reducer;
pub mod selector;
pub mod store;
pub mod testing;
pub mod thunk;

// Action exports
pub use action::{
    is_fulfilled, is_pending, is_rejected, is_rejected_with_value, is_settled, Action, ActionMeta,
    RequestStatus,
};

// Error exports
pub use error::{ErrorStatus, QueryError, SerializedError, StorageError, StoreError};

// Store exports
pub use store::{
    create_store, create_store_with_enhancer, Dispatched, Enhancer, GetStateFn, Op, RootReducer,
    StateRef, Store, StoreCreator, SubscriptionHandle, Thunk, ThunkContext, ThunkHandle,
    INIT_TYPE, REPLACE_TYPE,
};

// Middleware exports
pub use middleware::{
    apply_middleware, compose, compose_enhancers, create_store_with_middleware, Middleware,
    MiddlewareApi, NextFn, ThunkMiddleware,
};

// Reducer exports
pub use reducer::{
    combine_reducers, create_reducer, CaseReducer, ReducerBuilder, Slice, SliceBuilder,
    SliceReducer,
};

// Selector exports
pub use selector::{
    create_selector, create_structured_selector, input, state_selector, Selector, SelectorFn,
};

// Thunk exports
pub use thunk::{
    is_thunk_fulfilled, is_thunk_pending, is_thunk_rejected, is_thunk_settled, AsyncThunk,
    ConditionApi, ThunkApi, ThunkError,
};

// Async state exports
pub use async_state::{
    apply_async_transition, create_async_reducer, now_millis, AsyncReducerHandlers, AsyncSlice,
    AsyncSliceBuilder, AsyncState,
};

// Entity exports
pub use entity::{EntityAdapter, EntityId, EntitySelectors, EntityUpdate};

// Cell exports
pub use cell::{CellSubscription, ObservableCell};

// Query exports
pub use query::{
    create_api, create_lazy_query_hook, create_mutation_hook, create_query_hook, Api, ApiOptions,
    BaseQuery, BaseQueryApi, BaseQueryFn, CacheEntry, InitiateOptions, MutationDef, QueryDef,
    QueryHandle, QueryHookOptions, QueryHookState, QueryStatus, Tag,
};
#[cfg(feature = "fetch")]
pub use query::{fetch_base_query, FetchBaseQuery, FetchBaseQueryConfig};

// Persistence exports
pub use persist::{
    default_storage, global_registry, persist_enhancer, persist_middleware, ControllerRegistry,
    FileStorage, MemoryStorage, PersistConfig, PersistController, PersistMiddlewareConfig,
    PersistedRecord, RehydrateStrategy, Storage,
};

// Extension exports
pub use extensions::{
    create_batched_thunk, create_dependent_thunk, create_optimistic_thunk,
    create_paginated_thunk, create_polling_thunk, create_retry_thunk, create_search_thunk,
    OptimisticConfig, PageRequest, PageResult, PollingThunk, RetryOptions,
};

// Testing exports
pub use testing::{recording_store, recording_store_with_reducer, ActionRecorder};

#[cfg(feature = "testing-time")]
pub use testing::{advance_time, pause_time, resume_time};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::action::{
        is_fulfilled, is_pending, is_rejected, is_settled, Action, ActionMeta, RequestStatus,
    };
    pub use crate::async_state::{
        create_async_reducer, AsyncReducerHandlers, AsyncSliceBuilder, AsyncState,
    };
    pub use crate::cell::ObservableCell;
    pub use crate::entity::{EntityAdapter, EntityId, EntityUpdate};
    pub use crate::error::{QueryError, SerializedError, StoreError};
    pub use crate::extensions::{
        create_batched_thunk, create_dependent_thunk, create_optimistic_thunk,
        create_paginated_thunk, create_polling_thunk, create_retry_thunk, create_search_thunk,
        OptimisticConfig, RetryOptions,
    };
    pub use crate::middleware::{
        apply_middleware, compose_enhancers, create_store_with_middleware, Middleware,
        ThunkMiddleware,
    };
    pub use crate::persist::{
        default_storage, persist_enhancer, persist_middleware, PersistConfig,
        PersistMiddlewareConfig, RehydrateStrategy, Storage,
    };
    pub use crate::query::{
        create_api, create_mutation_hook, create_query_hook, Api, ApiOptions, MutationDef,
        QueryDef, QueryHookOptions, Tag,
    };
    pub use crate::reducer::{combine_reducers, create_reducer, SliceBuilder};
    pub use crate::selector::{create_selector, create_structured_selector, state_selector};
    pub use crate::store::{
        create_store, create_store_with_enhancer, Op, RootReducer, Store, Thunk,
    };
    pub use crate::thunk::{AsyncThunk, ThunkApi, ThunkError};
}
