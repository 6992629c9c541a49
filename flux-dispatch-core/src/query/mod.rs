//! Data-query engine: cache-keyed requests, deduplication, tag-based
//! invalidation, reactive consumers, and mutation lifecycle.
//!
//! Build an [`Api`] with [`create_api`], mount [`Api::reducer`] at the
//! reducer path, install [`Api::middleware`] next to the thunk middleware,
//! and consume endpoints through the hook factories or
//! [`Api::initiate`]/[`Api::select_query`] directly.

pub mod api;
pub mod base_query;
pub mod endpoint;
pub mod hooks;
pub mod key;
pub mod state;

pub use api::{create_api, Api, ApiOptions, InitiateOptions};
pub use base_query::{BaseQuery, BaseQueryApi, BaseQueryFn};
#[cfg(feature = "fetch")]
pub use base_query::{fetch_base_query, FetchBaseQuery, FetchBaseQueryConfig};
pub use endpoint::{EndpointBuilder, MutationDef, QueryDef};
pub use hooks::{
    create_lazy_query_hook, create_mutation_hook, create_query_hook, LazyQueryHook, LazyTrigger,
    MutationHandle, MutationHook, MutationHookState, QueryHandle, QueryHook, QueryHookOptions,
    QueryHookState,
};
pub use key::{cache_key, canonical_json};
pub use state::{CacheEntry, QueryStatus, Tag};
