//! Endpoint definitions and the builder handed to `create_api`.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::error::QueryError;
use crate::query::state::Tag;

/// Maps the caller's arg to the base query's request args.
pub type QueryArgFn = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// Reshapes a successful response before it is cached.
pub type TransformFn = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// Derives tags from `(result, error, arg)`.
pub type TagsFn = Arc<dyn Fn(Option<&Value>, Option<&QueryError>, &Value) -> Vec<Tag> + Send + Sync>;

/// A cached, deduplicated read endpoint.
#[derive(Clone)]
pub struct QueryDef {
    pub(crate) query: QueryArgFn,
    pub(crate) transform_response: Option<TransformFn>,
    pub(crate) provides_tags: Option<TagsFn>,
    pub(crate) keep_unused_data_for: Option<f64>,
}

impl QueryDef {
    pub fn new<F>(query: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        Self {
            query: Arc::new(query),
            transform_response: None,
            provides_tags: None,
            keep_unused_data_for: None,
        }
    }

    pub fn transform_response<F>(mut self, transform: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.transform_response = Some(Arc::new(transform));
        self
    }

    /// Declare produced tags, statically or derived from args/result.
    pub fn provides_tags<F>(mut self, provides: F) -> Self
    where
        F: Fn(Option<&Value>, Option<&QueryError>, &Value) -> Vec<Tag> + Send + Sync + 'static,
    {
        self.provides_tags = Some(Arc::new(provides));
        self
    }

    /// Per-endpoint override of the retention window, in seconds.
    pub fn keep_unused_data_for(mut self, seconds: f64) -> Self {
        self.keep_unused_data_for = Some(seconds);
        self
    }
}

/// A write endpoint; successful runs invalidate tags.
#[derive(Clone)]
pub struct MutationDef {
    pub(crate) query: QueryArgFn,
    pub(crate) transform_response: Option<TransformFn>,
    pub(crate) invalidates_tags: Option<TagsFn>,
}

impl MutationDef {
    pub fn new<F>(query: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        Self {
            query: Arc::new(query),
            transform_response: None,
            invalidates_tags: None,
        }
    }

    pub fn transform_response<F>(mut self, transform: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.transform_response = Some(Arc::new(transform));
        self
    }

    /// Declare invalidated tags, statically or derived from args/result.
    pub fn invalidates_tags<F>(mut self, invalidates: F) -> Self
    where
        F: Fn(Option<&Value>, Option<&QueryError>, &Value) -> Vec<Tag> + Send + Sync + 'static,
    {
        self.invalidates_tags = Some(Arc::new(invalidates));
        self
    }
}

#[derive(Clone)]
pub(crate) enum EndpointDef {
    Query(QueryDef),
    Mutation(MutationDef),
}

/// Collects endpoint definitions for an api.
#[derive(Default)]
pub struct EndpointBuilder {
    pub(crate) endpoints: HashMap<String, EndpointDef>,
}

impl EndpointBuilder {
    pub fn query(&mut self, name: impl Into<String>, def: QueryDef) -> &mut Self {
        self.endpoints.insert(name.into(), EndpointDef::Query(def));
        self
    }

    pub fn mutation(&mut self, name: impl Into<String>, def: MutationDef) -> &mut Self {
        self.endpoints
            .insert(name.into(), EndpointDef::Mutation(def));
        self
    }
}
