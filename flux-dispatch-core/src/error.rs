//! Error types shared across the store, thunk, query, and persistence layers.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Contract violations raised synchronously by the store kernel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The dispatched action carried an empty `type`.
    #[error("action type must be a non-empty string")]
    InvalidAction,

    /// `dispatch` was re-entered while a reducer was running.
    #[error("reducers may not dispatch actions")]
    ReentrantDispatch,

    /// The middleware api `dispatch` was invoked while the chain was still
    /// being composed.
    #[error("dispatching while constructing your middleware is not allowed")]
    DispatchDuringSetup,

    /// A thunk was dispatched to a store without thunk middleware.
    #[error("cannot dispatch a thunk without thunk middleware installed")]
    UnhandledThunk,
}

/// Failures raised by a [`Storage`](crate::persist::Storage) backend.
///
/// The persistence subsystem swallows these to preserve liveness; they
/// surface only through `tracing` output.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage io failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
}

/// The serialized form of an error carried on rejected lifecycle actions.
///
/// Mirrors the default serializer contract: `{ name, message, stack }`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SerializedError {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl SerializedError {
    /// Serialize an arbitrary error with the default `{name, message}` shape.
    pub fn from_error(err: &(dyn std::error::Error + '_)) -> Self {
        Self {
            name: Some("Error".to_string()),
            message: Some(err.to_string()),
            stack: None,
        }
    }

    /// Build from a bare message.
    pub fn from_message(message: impl Into<String>) -> Self {
        Self {
            name: Some("Error".to_string()),
            message: Some(message.into()),
            stack: None,
        }
    }

    /// The synthetic error attached to aborted thunk rejections.
    pub fn aborted() -> Self {
        Self {
            name: Some("AbortError".to_string()),
            message: Some("Aborted".to_string()),
            stack: None,
        }
    }

    /// The synthetic error attached to condition-skipped rejections.
    pub fn condition() -> Self {
        Self {
            name: Some("ConditionError".to_string()),
            message: Some("Aborted due to condition callback returning false.".to_string()),
            stack: None,
        }
    }
}

impl std::fmt::Display for SerializedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.name, &self.message) {
            (Some(n), Some(m)) => write!(f, "{n}: {m}"),
            (None, Some(m)) => write!(f, "{m}"),
            (Some(n), None) => write!(f, "{n}"),
            (None, None) => write!(f, "unknown error"),
        }
    }
}

/// The `status` discriminant of a [`QueryError`].
///
/// HTTP failures carry the numeric status code; transport-level failures
/// carry a string label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorStatus {
    Code(u16),
    Label(String),
}

/// A transport error surfaced as a cache-entry `error`.
///
/// Serializes to the wire shapes the base query contract prescribes:
/// `{status: 404, data}`, `{status: "FETCH_ERROR", error}`,
/// `{status: "PARSING_ERROR", originalStatus, error}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryError {
    pub status: ErrorStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "originalStatus", skip_serializing_if = "Option::is_none")]
    pub original_status: Option<u16>,
}

impl QueryError {
    /// A non-2xx HTTP response with its decoded body.
    pub fn http(status: u16, data: Value) -> Self {
        Self {
            status: ErrorStatus::Code(status),
            data: Some(data),
            error: None,
            original_status: None,
        }
    }

    /// A network-level failure that produced no response.
    pub fn fetch(message: impl Into<String>) -> Self {
        Self {
            status: ErrorStatus::Label("FETCH_ERROR".to_string()),
            data: None,
            error: Some(message.into()),
            original_status: None,
        }
    }

    /// A 2xx response whose payload could not be decoded.
    pub fn parsing(original_status: u16, message: impl Into<String>) -> Self {
        Self {
            status: ErrorStatus::Label("PARSING_ERROR".to_string()),
            data: None,
            error: Some(message.into()),
            original_status: Some(original_status),
        }
    }

    /// An error produced by a custom base query.
    pub fn custom(data: Value) -> Self {
        Self {
            status: ErrorStatus::Label("CUSTOM_ERROR".to_string()),
            data: Some(data),
            error: None,
            original_status: None,
        }
    }
}

impl std::fmt::Display for QueryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.status {
            ErrorStatus::Code(code) => write!(f, "request failed with status {code}"),
            ErrorStatus::Label(label) => match &self.error {
                Some(msg) => write!(f, "{label}: {msg}"),
                None => write!(f, "{label}"),
            },
        }
    }
}

impl std::error::Error for QueryError {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serialized_error_display() {
        let err = SerializedError::from_message("boom");
        assert_eq!(err.to_string(), "Error: boom");
        assert_eq!(SerializedError::aborted().name.as_deref(), Some("AbortError"));
    }

    #[test]
    fn query_error_http_shape() {
        let err = QueryError::http(404, json!({"detail": "missing"}));
        let encoded = serde_json::to_value(&err).unwrap();
        assert_eq!(encoded, json!({"status": 404, "data": {"detail": "missing"}}));
    }

    #[test]
    fn query_error_fetch_shape() {
        let err = QueryError::fetch("connection refused");
        let encoded = serde_json::to_value(&err).unwrap();
        assert_eq!(
            encoded,
            json!({"status": "FETCH_ERROR", "error": "connection refused"})
        );
    }

    #[test]
    fn query_error_parsing_shape() {
        let err = QueryError::parsing(200, "invalid json");
        let encoded = serde_json::to_value(&err).unwrap();
        assert_eq!(
            encoded,
            json!({"status": "PARSING_ERROR", "originalStatus": 200, "error": "invalid json"})
        );
    }

    #[test]
    fn query_error_round_trip() {
        let err = QueryError::http(500, json!("oops"));
        let decoded: QueryError = serde_json::from_value(serde_json::to_value(&err).unwrap()).unwrap();
        assert_eq!(decoded, err);
    }
}
