//! Higher-order thunks: pagination, debounced search, optimistic updates,
//! polling, batching, dependencies, and retry with backoff.
//!
//! Each factory wraps a caller-supplied work function into an
//! [`AsyncThunk`] with the extra lifecycle behavior layered inside the
//! payload creator, so the standard `pending`/`fulfilled`/`rejected`/
//! `settled` sequencing and reducer helpers apply unchanged.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::action::Action;
use crate::error::SerializedError;
use crate::store::Op;
use crate::thunk::{AsyncThunk, ThunkApi, ThunkError};

/// Debounce applied inside search payload creators.
pub const SEARCH_DEBOUNCE_MS: u64 = 300;

/// A page request decoded from the thunk arg
/// `{page, pageSize, append?}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u64,
    pub page_size: u64,
    pub append: bool,
}

impl PageRequest {
    fn from_arg(arg: &Value) -> Self {
        Self {
            page: arg.get("page").and_then(Value::as_u64).unwrap_or(1),
            page_size: arg.get("pageSize").and_then(Value::as_u64).unwrap_or(20),
            append: arg.get("append").and_then(Value::as_bool).unwrap_or(false),
        }
    }
}

/// One fetched page: the items plus the total collection size.
#[derive(Debug, Clone)]
pub struct PageResult {
    pub items: Vec<Value>,
    pub total_count: u64,
}

/// A thunk fetching one page at a time.
///
/// The fulfilled payload is
/// `{items, totalCount, pageSize, currentPage, hasMore}`.
pub fn create_paginated_thunk<F>(type_prefix: impl Into<String>, fetch_page: F) -> AsyncThunk
where
    F: Fn(PageRequest) -> BoxFuture<'static, Result<PageResult, ThunkError>>
        + Send
        + Sync
        + 'static,
{
    let fetch_page = Arc::new(fetch_page);
    AsyncThunk::new(type_prefix, move |arg, _api: ThunkApi| {
        let fetch_page = fetch_page.clone();
        Box::pin(async move {
            let request = PageRequest::from_arg(&arg);
            let page = fetch_page(request).await?;
            let has_more = request.page.saturating_mul(request.page_size) < page.total_count;
            Ok(json!({
                "items": page.items,
                "totalCount": page.total_count,
                "pageSize": request.page_size,
                "currentPage": request.page,
                "hasMore": has_more,
            }))
        })
    })
}

fn query_of(arg: &Value) -> String {
    match arg {
        Value::String(s) => s.clone(),
        other => other
            .get("query")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    }
}

/// A debounced, abort-aware search thunk.
///
/// The payload creator waits [`SEARCH_DEBOUNCE_MS`] before searching and
/// skips the work when the invocation was aborted during the wait. The
/// condition gate drops empty and whitespace-only queries before any
/// `pending` is emitted.
pub fn create_search_thunk<F>(type_prefix: impl Into<String>, search: F) -> AsyncThunk
where
    F: Fn(String) -> BoxFuture<'static, Result<Value, ThunkError>> + Send + Sync + 'static,
{
    let search = Arc::new(search);
    AsyncThunk::new(type_prefix, move |arg, api: ThunkApi| {
        let search = search.clone();
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(SEARCH_DEBOUNCE_MS)).await;
            if api.aborted() {
                // Superseded while debouncing; the engine turns this into
                // an aborted rejection.
                return Ok(Value::Null);
            }
            search(query_of(&arg).trim().to_string()).await
        })
    })
    .with_condition(|arg, _api| !query_of(arg).trim().is_empty())
}

/// Optimistic update wiring: the projection and its revert are both
/// dispatched actions, so the revert is a symmetric dispatch rather than a
/// direct state mutation.
#[derive(Clone)]
pub struct OptimisticConfig {
    /// Builds the synchronous optimistic projection for an arg.
    pub apply: Arc<dyn Fn(&Value) -> Action + Send + Sync>,
    /// Builds the revert from the pre-update state snapshot and the arg.
    pub revert: Option<Arc<dyn Fn(&Value, &Value) -> Action + Send + Sync>>,
}

impl OptimisticConfig {
    pub fn new<F>(apply: F) -> Self
    where
        F: Fn(&Value) -> Action + Send + Sync + 'static,
    {
        Self {
            apply: Arc::new(apply),
            revert: None,
        }
    }

    pub fn with_revert<F>(mut self, revert: F) -> Self
    where
        F: Fn(&Value, &Value) -> Action + Send + Sync + 'static,
    {
        self.revert = Some(Arc::new(revert));
        self
    }
}

/// A thunk that applies an optimistic projection before awaiting the work.
///
/// On success the fulfilled payload is `{data, isOptimistic: true}`; on
/// failure a configured revert is dispatched using the pre-update state
/// before the rejection propagates.
pub fn create_optimistic_thunk<F>(
    type_prefix: impl Into<String>,
    work: F,
    config: OptimisticConfig,
) -> AsyncThunk
where
    F: Fn(Value) -> BoxFuture<'static, Result<Value, ThunkError>> + Send + Sync + 'static,
{
    let work = Arc::new(work);
    AsyncThunk::new(type_prefix, move |arg, api: ThunkApi| {
        let work = work.clone();
        let config = config.clone();
        Box::pin(async move {
            let snapshot = (api.get_state)();
            let projection = (config.apply)(&arg);
            if let Err(err) = (api.dispatch)(Op::Action(projection)) {
                tracing::warn!(error = %err, "optimistic projection dispatch failed");
            }

            match work(arg.clone()).await {
                Ok(data) => Ok(json!({"data": data, "isOptimistic": true})),
                Err(err) => {
                    if let Some(revert) = &config.revert {
                        let action = revert(&snapshot, &arg);
                        if let Err(err) = (api.dispatch)(Op::Action(action)) {
                            tracing::warn!(error = %err, "optimistic revert dispatch failed");
                        }
                    }
                    Err(err)
                }
            }
        })
    })
}

/// A repeating thunk with a tick cap and external stop control.
#[derive(Clone)]
pub struct PollingThunk {
    thunk: Arc<Mutex<Option<AsyncThunk>>>,
    timer: Arc<Mutex<Option<AbortHandle>>>,
    attempts: Arc<AtomicU32>,
}

impl PollingThunk {
    /// The underlying thunk; dispatch `thunk().call(arg)` to start polling.
    pub fn thunk(&self) -> AsyncThunk {
        self.thunk
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .unwrap_or_else(|| {
                AsyncThunk::new("polling/unset", |_arg, _api| {
                    Box::pin(async { Ok(Value::Null) })
                })
            })
    }

    /// Attempts completed since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Clear the scheduled tick and reset the attempt counter.
    pub fn stop_polling(&self) {
        if let Some(timer) = self
            .timer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            timer.abort();
        }
        self.attempts.store(0, Ordering::SeqCst);
    }
}

/// Wrap `work` into a thunk that reschedules itself after `interval_ms` on
/// each fulfillment, while the signal is live and fewer than
/// `max_attempts` ticks have completed.
pub fn create_polling_thunk<F>(
    type_prefix: impl Into<String>,
    work: F,
    interval_ms: u64,
    max_attempts: u32,
) -> PollingThunk
where
    F: Fn(Value) -> BoxFuture<'static, Result<Value, ThunkError>> + Send + Sync + 'static,
{
    let work = Arc::new(work);
    let polling = PollingThunk {
        thunk: Arc::new(Mutex::new(None)),
        timer: Arc::new(Mutex::new(None)),
        attempts: Arc::new(AtomicU32::new(0)),
    };

    let handle = polling.clone();
    let thunk = AsyncThunk::new(type_prefix, move |arg, api: ThunkApi| {
        let work = work.clone();
        let handle = handle.clone();
        Box::pin(async move {
            let data = work(arg.clone()).await?;
            let attempt = handle.attempts.fetch_add(1, Ordering::SeqCst) + 1;

            if !api.aborted() && attempt < max_attempts {
                let next = handle.thunk();
                let dispatch = api.dispatch.clone();
                let timer_slot = handle.timer.clone();
                let task = tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(interval_ms)).await;
                    if let Err(err) = dispatch(Op::Thunk(next.call(arg))) {
                        tracing::warn!(error = %err, "polling tick dispatch failed");
                    }
                    *timer_slot
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
                });
                *handle
                    .timer
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) =
                    Some(task.abort_handle());
            }
            Ok(data)
        })
    });

    *polling
        .thunk
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(thunk);
    polling
}

type BatchItem = (Value, oneshot::Sender<Result<Value, SerializedError>>);
type BatchFn =
    Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Vec<Value>, SerializedError>> + Send + Sync>;

struct BatchState {
    queue: Mutex<Vec<BatchItem>>,
    timer: Mutex<Option<AbortHandle>>,
    batch_fn: BatchFn,
}

impl BatchState {
    async fn flush(self: Arc<Self>) {
        // A size-triggered flush cancels the window timer so the empty
        // queue is never flushed again.
        let timer = self
            .timer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(timer) = timer {
            timer.abort();
        }
        let items: Vec<BatchItem> = std::mem::take(
            &mut *self
                .queue
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        if items.is_empty() {
            return;
        }

        let args: Vec<Value> = items.iter().map(|(arg, _)| arg.clone()).collect();
        match (self.batch_fn)(args).await {
            Ok(results) => {
                let mut results = results.into_iter();
                for (_, responder) in items {
                    let outcome = results
                        .next()
                        .ok_or_else(|| SerializedError::from_message("batch result missing"));
                    let _ = responder.send(outcome);
                }
            }
            Err(err) => {
                // Failures fan out to every pending item.
                for (_, responder) in items {
                    let _ = responder.send(Err(err.clone()));
                }
            }
        }
    }
}

/// Collect individual calls into batches.
///
/// The queue flushes when it reaches `batch_size`, or `batch_delay_ms`
/// after the first queued item. Results fan out to callers in enqueue
/// order; a batch failure rejects every pending call.
pub fn create_batched_thunk<F>(
    type_prefix: impl Into<String>,
    batch_fn: F,
    batch_size: usize,
    batch_delay_ms: u64,
) -> AsyncThunk
where
    F: Fn(Vec<Value>) -> BoxFuture<'static, Result<Vec<Value>, SerializedError>>
        + Send
        + Sync
        + 'static,
{
    let state = Arc::new(BatchState {
        queue: Mutex::new(Vec::new()),
        timer: Mutex::new(None),
        batch_fn: Arc::new(batch_fn),
    });

    AsyncThunk::new(type_prefix, move |arg, _api: ThunkApi| {
        let state = state.clone();
        Box::pin(async move {
            let (responder, receiver) = oneshot::channel();
            let (flush_now, start_timer) = {
                let mut queue = state
                    .queue
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                queue.push((arg, responder));
                (
                    queue.len() >= batch_size,
                    queue.len() == 1 && batch_size > 1,
                )
            };

            if start_timer {
                let window = state.clone();
                let task = tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(batch_delay_ms)).await;
                    window.flush().await;
                });
                *state
                    .timer
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(task.abort_handle());
            }
            if flush_now {
                state.clone().flush().await;
            }

            match receiver.await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(ThunkError::Serialized(err)),
                Err(_) => Err(ThunkError::Serialized(SerializedError::from_message(
                    "batch dropped before completion",
                ))),
            }
        })
    })
}

/// Await a list of prerequisite thunks, then run the main work over their
/// fulfilled payloads.
///
/// Prerequisites start concurrently; all must fulfill or the main thunk
/// rejects with the first failure.
pub fn create_dependent_thunk<F>(
    type_prefix: impl Into<String>,
    dependencies: Vec<(AsyncThunk, Value)>,
    work: F,
) -> AsyncThunk
where
    F: Fn(Vec<Value>, Value) -> BoxFuture<'static, Result<Value, ThunkError>>
        + Send
        + Sync
        + 'static,
{
    let work = Arc::new(work);
    let dependencies = Arc::new(dependencies);
    AsyncThunk::new(type_prefix, move |arg, api: ThunkApi| {
        let work = work.clone();
        let dependencies = dependencies.clone();
        Box::pin(async move {
            let mut handles = Vec::with_capacity(dependencies.len());
            for (dependency, dep_arg) in dependencies.iter() {
                match (api.dispatch)(Op::Thunk(dependency.call(dep_arg.clone()))) {
                    Ok(dispatched) => {
                        if let Some(handle) = dispatched.handle() {
                            handles.push((dependency.clone(), handle));
                        }
                    }
                    Err(err) => {
                        return Err(ThunkError::Serialized(SerializedError::from_message(
                            format!("dependency dispatch failed: {err}"),
                        )))
                    }
                }
            }

            let mut payloads = Vec::with_capacity(handles.len());
            for (dependency, handle) in handles {
                let terminal = handle.wait().await;
                if !dependency.is_fulfilled(&terminal) {
                    let error = terminal.error.clone().unwrap_or_else(|| {
                        SerializedError::from_message("dependency rejected")
                    });
                    return Err(ThunkError::Serialized(error));
                }
                payloads.push(terminal.payload.unwrap_or(Value::Null));
            }

            work(payloads, arg).await
        })
    })
}

/// Retry policy for [`create_retry_thunk`].
#[derive(Clone)]
pub struct RetryOptions {
    pub max_retries: u32,
    /// Gate each retry on `(error, attempt)`; default always retries.
    pub should_retry: Option<Arc<dyn Fn(&SerializedError, u32) -> bool + Send + Sync>>,
    /// Fulfilled payload to fall back to when retries are exhausted.
    pub fallback_data: Option<Value>,
}

impl RetryOptions {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            should_retry: None,
            fallback_data: None,
        }
    }

    pub fn with_should_retry<F>(mut self, should_retry: F) -> Self
    where
        F: Fn(&SerializedError, u32) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Some(Arc::new(should_retry));
        self
    }

    pub fn with_fallback(mut self, fallback_data: Value) -> Self {
        self.fallback_data = Some(fallback_data);
        self
    }
}

/// Retry `work` with exponential backoff (`2^attempt * 1000 ms`).
///
/// On exhaustion, returns the fallback data when configured, otherwise
/// rejects with the last error.
pub fn create_retry_thunk<F>(
    type_prefix: impl Into<String>,
    work: F,
    options: RetryOptions,
) -> AsyncThunk
where
    F: Fn(Value) -> BoxFuture<'static, Result<Value, SerializedError>> + Send + Sync + 'static,
{
    let work = Arc::new(work);
    AsyncThunk::new(type_prefix, move |arg, api: ThunkApi| {
        let work = work.clone();
        let options = options.clone();
        Box::pin(async move {
            let mut attempt: u32 = 0;
            loop {
                match work(arg.clone()).await {
                    Ok(data) => return Ok(data),
                    Err(error) => {
                        let retry_allowed = attempt < options.max_retries
                            && options
                                .should_retry
                                .as_ref()
                                .map_or(true, |gate| gate(&error, attempt));
                        if !retry_allowed {
                            return match options.fallback_data.clone() {
                                Some(fallback) => Ok(fallback),
                                None => Err(ThunkError::Serialized(error)),
                            };
                        }
                        let backoff = Duration::from_millis(
                            1000u64.saturating_mul(1u64 << attempt.min(32)),
                        );
                        tokio::time::sleep(backoff).await;
                        if api.aborted() {
                            return Err(ThunkError::Serialized(SerializedError::aborted()));
                        }
                        attempt += 1;
                    }
                }
            }
        })
    })
}
