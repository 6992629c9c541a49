//! Actions and lifecycle type guards.
//!
//! An action is a plain record describing an intent, keyed by a string
//! `type`. Async lifecycle variants carry request metadata (`requestId`,
//! `arg`, `requestStatus`) and suffix their type with `/pending`,
//! `/fulfilled`, `/rejected`, or `/settled`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::SerializedError;

/// Lifecycle suffixes appended to a thunk's type prefix.
pub const PENDING_SUFFIX: &str = "/pending";
pub const FULFILLED_SUFFIX: &str = "/fulfilled";
pub const REJECTED_SUFFIX: &str = "/rejected";
pub const SETTLED_SUFFIX: &str = "/settled";

/// The request phase recorded on lifecycle action metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Fulfilled,
    Rejected,
}

/// Metadata attached to lifecycle actions.
///
/// `extra` is a flattened bag for subsystem fields (the persistence layer
/// records `key` and `version` on its rehydrate notification there).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ActionMeta {
    #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arg: Option<Value>,
    #[serde(rename = "requestStatus", skip_serializing_if = "Option::is_none")]
    pub request_status: Option<RequestStatus>,
    #[serde(rename = "rejectedWithValue", default, skip_serializing_if = "std::ops::Not::not")]
    pub rejected_with_value: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub aborted: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub condition: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ActionMeta {
    /// Metadata for a lifecycle action of the given request.
    pub fn for_request(request_id: impl Into<String>, arg: Value, status: RequestStatus) -> Self {
        Self {
            request_id: Some(request_id.into()),
            arg: Some(arg),
            request_status: Some(status),
            ..Self::default()
        }
    }
}

/// A plain record describing an intent, uniquely keyed by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<ActionMeta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<SerializedError>,
}

impl Action {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            payload: None,
            meta: None,
            error: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_meta(mut self, meta: ActionMeta) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn with_error(mut self, error: SerializedError) -> Self {
        self.error = Some(error);
        self
    }

    /// The request id recorded on lifecycle metadata, if any.
    pub fn request_id(&self) -> Option<&str> {
        self.meta.as_ref()?.request_id.as_deref()
    }

    /// The request phase recorded on lifecycle metadata, if any.
    pub fn request_status(&self) -> Option<RequestStatus> {
        self.meta.as_ref()?.request_status
    }
}

/// Matches any `*/pending` lifecycle action.
pub fn is_pending(action: &Action) -> bool {
    action.kind.ends_with(PENDING_SUFFIX)
}

/// Matches any `*/fulfilled` lifecycle action.
pub fn is_fulfilled(action: &Action) -> bool {
    action.kind.ends_with(FULFILLED_SUFFIX)
}

/// Matches any `*/rejected` lifecycle action.
pub fn is_rejected(action: &Action) -> bool {
    action.kind.ends_with(REJECTED_SUFFIX)
}

/// Matches any `*/settled` lifecycle action.
pub fn is_settled(action: &Action) -> bool {
    action.kind.ends_with(SETTLED_SUFFIX)
}

/// Matches rejections whose payload was supplied via `reject_with_value`.
pub fn is_rejected_with_value(action: &Action) -> bool {
    is_rejected(action)
        && action
            .meta
            .as_ref()
            .is_some_and(|meta| meta.rejected_with_value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lifecycle_suffix_matching() {
        assert!(is_pending(&Action::new("users/fetch/pending")));
        assert!(is_fulfilled(&Action::new("users/fetch/fulfilled")));
        assert!(is_rejected(&Action::new("users/fetch/rejected")));
        assert!(is_settled(&Action::new("users/fetch/settled")));
        assert!(!is_pending(&Action::new("users/fetch/fulfilled")));
        assert!(!is_rejected(&Action::new("counter/increment")));
    }

    #[test]
    fn rejected_with_value_requires_meta_flag() {
        let plain = Action::new("x/rejected");
        assert!(!is_rejected_with_value(&plain));

        let meta = ActionMeta {
            rejected_with_value: true,
            ..ActionMeta::default()
        };
        let flagged = Action::new("x/rejected").with_meta(meta);
        assert!(is_rejected_with_value(&flagged));
    }

    #[test]
    fn action_serializes_with_type_field() {
        let action = Action::new("todos/add").with_payload(json!({"id": 1}));
        let encoded = serde_json::to_value(&action).unwrap();
        assert_eq!(encoded, json!({"type": "todos/add", "payload": {"id": 1}}));
    }

    #[test]
    fn meta_serializes_camel_case_and_skips_defaults() {
        let meta = ActionMeta::for_request("req-1", json!(7), RequestStatus::Pending);
        let encoded = serde_json::to_value(&meta).unwrap();
        assert_eq!(
            encoded,
            json!({"requestId": "req-1", "arg": 7, "requestStatus": "pending"})
        );
    }
}
