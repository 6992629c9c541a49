//! Cache entry state and tag descriptions.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entity::EntityId;
use crate::error::QueryError;

/// Lifecycle status of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    #[default]
    Uninitialized,
    Pending,
    Fulfilled,
    Rejected,
}

/// One cached request, keyed by cache key (queries) or request id
/// (mutations).
///
/// `data` survives refetches: a `pending` entry with `data` present is a
/// refetch in flight, not a first load.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CacheEntry {
    #[serde(default)]
    pub status: QueryStatus,
    #[serde(rename = "endpointName", skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(rename = "originalArgs", skip_serializing_if = "Option::is_none")]
    pub original_args: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<QueryError>,
    #[serde(rename = "lastFetched", skip_serializing_if = "Option::is_none")]
    pub last_fetched: Option<i64>,
    #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl CacheEntry {
    pub fn is_uninitialized(&self) -> bool {
        self.status == QueryStatus::Uninitialized
    }

    /// Any request in flight, first load or refetch.
    pub fn is_fetching(&self) -> bool {
        self.status == QueryStatus::Pending
    }

    /// First load only: in flight with no data yet.
    pub fn is_loading(&self) -> bool {
        self.is_fetching() && self.data.is_none()
    }

    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Fulfilled
    }

    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Rejected
    }
}

/// A logical label attached to a cached result, enabling mutation-driven
/// invalidation. A tag matches entries registered under the same
/// `(type, id)` pair, or under the bare type when no id is given.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<EntityId>,
}

impl Tag {
    /// A whole-type tag: `{type}`.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: None,
        }
    }

    /// An id-scoped tag: `{type, id}`.
    pub fn with_id(kind: impl Into<String>, id: impl Into<EntityId>) -> Self {
        Self {
            kind: kind.into(),
            id: Some(id.into()),
        }
    }

    /// The key this tag occupies in the `provided` map.
    pub(crate) fn provided_key(&self) -> String {
        match &self.id {
            Some(id) => id.as_key(),
            None => "__general__".to_string(),
        }
    }
}
