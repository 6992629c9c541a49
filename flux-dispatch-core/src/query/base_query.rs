//! The transport seam: a base query turns request args into data or error.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::QueryError;
use crate::store::{DispatchFn, GetStateFn};

/// Store access and cancellation handed to a base query run.
#[derive(Clone)]
pub struct BaseQueryApi {
    pub signal: CancellationToken,
    pub dispatch: DispatchFn,
    pub get_state: GetStateFn,
}

/// The transport contract: `(args, api) -> data | error`.
pub trait BaseQuery: Send + Sync {
    fn execute(
        &self,
        args: Value,
        api: BaseQueryApi,
    ) -> BoxFuture<'static, Result<Value, QueryError>>;
}

/// Adapt a closure into a [`BaseQuery`].
pub struct BaseQueryFn<F>(pub F);

impl<F> BaseQuery for BaseQueryFn<F>
where
    F: Fn(Value, BaseQueryApi) -> BoxFuture<'static, Result<Value, QueryError>> + Send + Sync,
{
    fn execute(
        &self,
        args: Value,
        api: BaseQueryApi,
    ) -> BoxFuture<'static, Result<Value, QueryError>> {
        (self.0)(args, api)
    }
}

/// Configuration for [`fetch_base_query`].
#[cfg(feature = "fetch")]
pub struct FetchBaseQueryConfig {
    pub base_url: String,
    /// Adjust headers before each request.
    pub prepare_headers:
        Option<Arc<dyn Fn(reqwest::header::HeaderMap) -> reqwest::header::HeaderMap + Send + Sync>>,
}

#[cfg(feature = "fetch")]
impl FetchBaseQueryConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            prepare_headers: None,
        }
    }
}

/// The default HTTP transport.
///
/// Accepts `args` as either a string path or an object
/// `{url, method?, body?, headers?, params?}`. Composes the url against
/// `base_url`, JSON-encodes non-GET bodies, attaches the abort signal, and
/// maps failures to the standard error shapes.
#[cfg(feature = "fetch")]
pub struct FetchBaseQuery {
    base_url: String,
    prepare_headers:
        Option<Arc<dyn Fn(reqwest::header::HeaderMap) -> reqwest::header::HeaderMap + Send + Sync>>,
    client: reqwest::Client,
}

#[cfg(feature = "fetch")]
pub fn fetch_base_query(config: FetchBaseQueryConfig) -> Arc<dyn BaseQuery> {
    Arc::new(FetchBaseQuery {
        base_url: config.base_url,
        prepare_headers: config.prepare_headers,
        client: reqwest::Client::new(),
    })
}

#[cfg(feature = "fetch")]
impl FetchBaseQuery {
    fn build_request(&self, args: &Value) -> Result<reqwest::RequestBuilder, QueryError> {
        let (path, method, body, headers, params) = match args {
            Value::String(path) => (path.clone(), "GET".to_string(), None, None, None),
            Value::Object(request) => (
                request
                    .get("url")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                request
                    .get("method")
                    .and_then(Value::as_str)
                    .unwrap_or("GET")
                    .to_uppercase(),
                request.get("body").cloned(),
                request.get("headers").and_then(Value::as_object).cloned(),
                request.get("params").and_then(Value::as_object).cloned(),
            ),
            other => {
                return Err(QueryError::fetch(format!(
                    "unsupported request args: {other}"
                )))
            }
        };

        let url = if path.starts_with("http://") || path.starts_with("https://") {
            path
        } else {
            format!(
                "{}/{}",
                self.base_url.trim_end_matches('/'),
                path.trim_start_matches('/')
            )
        };

        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|err| QueryError::fetch(format!("invalid method: {err}")))?;
        let mut request = self.client.request(method.clone(), &url);

        if let Some(params) = params {
            let pairs: Vec<(String, String)> = params
                .iter()
                .map(|(key, value)| {
                    let rendered = match value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (key.clone(), rendered)
                })
                .collect();
            request = request.query(&pairs);
        }

        let mut header_map = reqwest::header::HeaderMap::new();
        if let Some(headers) = headers {
            for (key, value) in &headers {
                let name = reqwest::header::HeaderName::from_bytes(key.as_bytes())
                    .map_err(|err| QueryError::fetch(format!("invalid header name: {err}")))?;
                let rendered = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                let header_value = reqwest::header::HeaderValue::from_str(&rendered)
                    .map_err(|err| QueryError::fetch(format!("invalid header value: {err}")))?;
                header_map.insert(name, header_value);
            }
        }
        if let Some(prepare) = &self.prepare_headers {
            header_map = prepare(header_map);
        }
        request = request.headers(header_map);

        if let Some(body) = body {
            if method != reqwest::Method::GET {
                request = request.json(&body);
            }
        }
        Ok(request)
    }

    async fn run(request: reqwest::RequestBuilder, signal: CancellationToken) -> Result<Value, QueryError> {
        let response = tokio::select! {
            _ = signal.cancelled() => return Err(QueryError::fetch("request aborted")),
            response = request.send() => {
                response.map_err(|err| QueryError::fetch(err.to_string()))?
            }
        };

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|err| QueryError::fetch(err.to_string()))?;
        let parsed = if text.is_empty() {
            Ok(Value::Null)
        } else {
            serde_json::from_str::<Value>(&text)
        };

        if (200..300).contains(&status) {
            parsed.map_err(|err| QueryError::parsing(status, err.to_string()))
        } else {
            // Non-2xx bodies that fail to parse are kept as raw text.
            Err(QueryError::http(
                status,
                parsed.unwrap_or(Value::String(text)),
            ))
        }
    }
}

#[cfg(feature = "fetch")]
impl BaseQuery for FetchBaseQuery {
    fn execute(
        &self,
        args: Value,
        api: BaseQueryApi,
    ) -> BoxFuture<'static, Result<Value, QueryError>> {
        let request = self.build_request(&args);
        Box::pin(async move { Self::run(request?, api.signal).await })
    }
}
