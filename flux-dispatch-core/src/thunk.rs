//! Async thunk engine: lifecycle actions, request ids, cancellation,
//! condition gating, and error serialization.
//!
//! An [`AsyncThunk`] wraps a payload creator into a dispatchable state
//! machine. Dispatching an invocation emits `"{prefix}/pending"`, runs the
//! creator, then emits exactly one of `"{prefix}/fulfilled"` or
//! `"{prefix}/rejected"` followed by `"{prefix}/settled"`.
//!
//! # Example
//!
//! ```ignore
//! let fetch_user = AsyncThunk::new("users/fetch", |arg, api: ThunkApi| {
//!     Box::pin(async move {
//!         let user = client.user(arg["id"].as_i64().unwrap_or(0)).await
//!             .map_err(|e| api.reject_with_value(json!({"code": 500})))?;
//!         Ok(user)
//!     })
//! });
//!
//! let terminal = store.dispatch(fetch_user.call(json!({"id": 1})))?
//!     .resolved()
//!     .await;
//! assert_eq!(terminal.kind, fetch_user.fulfilled_type());
//! ```

use std::any::Any;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::action::{
    self, Action, ActionMeta, RequestStatus, FULFILLED_SUFFIX, PENDING_SUFFIX, REJECTED_SUFFIX,
    SETTLED_SUFFIX,
};
use crate::error::SerializedError;
use crate::store::{DispatchFn, GetStateFn, Op, Thunk, ThunkContext};

/// How a payload creator failed.
pub enum ThunkError {
    /// A deliberate, payload-carrying rejection.
    RejectWithValue(Value),
    /// An error to be run through the configured serializer.
    Failure(Box<dyn std::error::Error + Send + Sync>),
    /// An already-serialized error, carried onto the rejection verbatim.
    Serialized(SerializedError),
}

impl ThunkError {
    pub fn failure(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        ThunkError::Failure(Box::new(err))
    }

    pub fn message(message: impl Into<String>) -> Self {
        ThunkError::Failure(Box::new(std::io::Error::other(message.into())))
    }
}

impl std::fmt::Debug for ThunkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ThunkError::RejectWithValue(value) => {
                f.debug_tuple("RejectWithValue").field(value).finish()
            }
            ThunkError::Failure(err) => f.debug_tuple("Failure").field(&err.to_string()).finish(),
            ThunkError::Serialized(err) => f.debug_tuple("Serialized").field(err).finish(),
        }
    }
}

/// The api handed to payload creators.
#[derive(Clone)]
pub struct ThunkApi {
    pub dispatch: DispatchFn,
    pub get_state: GetStateFn,
    pub extra: Option<Arc<dyn Any + Send + Sync>>,
    pub request_id: String,
    pub signal: CancellationToken,
}

impl ThunkApi {
    /// Build a payload-carrying rejection.
    pub fn reject_with_value(&self, value: Value) -> ThunkError {
        ThunkError::RejectWithValue(value)
    }

    /// Whether this invocation has been cancelled.
    pub fn aborted(&self) -> bool {
        self.signal.is_cancelled()
    }
}

/// The api handed to condition callbacks.
#[derive(Clone)]
pub struct ConditionApi {
    pub dispatch: DispatchFn,
    pub get_state: GetStateFn,
}

/// The payload creator: async work producing the fulfilled payload.
pub type PayloadCreator =
    dyn Fn(Value, ThunkApi) -> BoxFuture<'static, Result<Value, ThunkError>> + Send + Sync;

type ConditionFn = Arc<dyn Fn(&Value, ConditionApi) -> bool + Send + Sync>;
type IdGenerator = Arc<dyn Fn() -> String + Send + Sync>;
type ErrorSerializer =
    Arc<dyn Fn(&(dyn std::error::Error + Send + Sync)) -> SerializedError + Send + Sync>;

/// A thunk action creator carrying its lifecycle type constants.
///
/// Cheap to clone; clones share the payload creator and options.
#[derive(Clone)]
pub struct AsyncThunk {
    prefix: String,
    payload_creator: Arc<PayloadCreator>,
    condition: Option<ConditionFn>,
    dispatch_condition_rejection: bool,
    id_generator: Option<IdGenerator>,
    serialize_error: Option<ErrorSerializer>,
}

impl AsyncThunk {
    pub fn new<F>(type_prefix: impl Into<String>, payload_creator: F) -> Self
    where
        F: Fn(Value, ThunkApi) -> BoxFuture<'static, Result<Value, ThunkError>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            prefix: type_prefix.into(),
            payload_creator: Arc::new(payload_creator),
            condition: None,
            dispatch_condition_rejection: false,
            id_generator: None,
            serialize_error: None,
        }
    }

    /// Gate dispatch: when the callback returns `false` the lifecycle is
    /// skipped entirely and the handle resolves to a condition-rejected
    /// sentinel.
    pub fn with_condition<F>(mut self, condition: F) -> Self
    where
        F: Fn(&Value, ConditionApi) -> bool + Send + Sync + 'static,
    {
        self.condition = Some(Arc::new(condition));
        self
    }

    /// Also dispatch the synthetic rejection when the condition fails.
    pub fn with_condition_rejection(mut self) -> Self {
        self.dispatch_condition_rejection = true;
        self
    }

    /// Replace the default uuid-v4 request id generator.
    pub fn with_id_generator<F>(mut self, generator: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.id_generator = Some(Arc::new(generator));
        self
    }

    /// Replace the default `{name, message}` error serializer.
    pub fn with_error_serializer<F>(mut self, serializer: F) -> Self
    where
        F: Fn(&(dyn std::error::Error + Send + Sync)) -> SerializedError + Send + Sync + 'static,
    {
        self.serialize_error = Some(Arc::new(serializer));
        self
    }

    pub fn type_prefix(&self) -> &str {
        &self.prefix
    }

    pub fn pending_type(&self) -> String {
        format!("{}{PENDING_SUFFIX}", self.prefix)
    }

    pub fn fulfilled_type(&self) -> String {
        format!("{}{FULFILLED_SUFFIX}", self.prefix)
    }

    pub fn rejected_type(&self) -> String {
        format!("{}{REJECTED_SUFFIX}", self.prefix)
    }

    pub fn settled_type(&self) -> String {
        format!("{}{SETTLED_SUFFIX}", self.prefix)
    }

    pub fn is_pending(&self, action: &Action) -> bool {
        action.kind == self.pending_type()
    }

    pub fn is_fulfilled(&self, action: &Action) -> bool {
        action.kind == self.fulfilled_type()
    }

    pub fn is_rejected(&self, action: &Action) -> bool {
        action.kind == self.rejected_type()
    }

    pub fn is_settled(&self, action: &Action) -> bool {
        action.kind == self.settled_type()
    }

    /// Build the dispatchable invocation for `arg`.
    pub fn call(&self, arg: Value) -> Thunk {
        let this = self.clone();
        let request_id = match &self.id_generator {
            Some(generator) => generator(),
            None => Uuid::new_v4().to_string(),
        };
        let token = CancellationToken::new();

        let thunk_request_id = request_id.clone();
        Thunk::new(move |ctx: ThunkContext| {
            Box::pin(async move { this.execute(arg, ctx, request_id).await })
        })
        .with_request_id(thunk_request_id)
        .with_token(token)
    }

    async fn execute(&self, arg: Value, ctx: ThunkContext, request_id: String) -> Action {
        let api = ThunkApi {
            dispatch: ctx.dispatch.clone(),
            get_state: ctx.get_state.clone(),
            extra: ctx.extra.clone(),
            request_id: request_id.clone(),
            signal: ctx.signal.clone(),
        };

        if let Some(condition) = &self.condition {
            let condition_api = ConditionApi {
                dispatch: ctx.dispatch.clone(),
                get_state: ctx.get_state.clone(),
            };
            if !condition(&arg, condition_api) {
                let mut meta = ActionMeta::for_request(&request_id, arg, RequestStatus::Rejected);
                meta.condition = true;
                let sentinel = Action::new(self.rejected_type())
                    .with_meta(meta)
                    .with_error(SerializedError::condition());
                if self.dispatch_condition_rejection {
                    self.dispatch(&ctx, sentinel.clone());
                }
                return sentinel;
            }
        }

        self.dispatch(
            &ctx,
            Action::new(self.pending_type()).with_meta(ActionMeta::for_request(
                &request_id,
                arg.clone(),
                RequestStatus::Pending,
            )),
        );

        let outcome = (self.payload_creator)(arg.clone(), api).await;

        let terminal = match outcome {
            // A deliberate rejection wins even over a concurrent abort.
            Err(ThunkError::RejectWithValue(value)) => {
                let mut meta =
                    ActionMeta::for_request(&request_id, arg.clone(), RequestStatus::Rejected);
                meta.rejected_with_value = true;
                Action::new(self.rejected_type())
                    .with_payload(value)
                    .with_meta(meta)
            }
            // Work that completes after an abort must not fulfill.
            _ if ctx.signal.is_cancelled() => {
                let mut meta =
                    ActionMeta::for_request(&request_id, arg.clone(), RequestStatus::Rejected);
                meta.aborted = true;
                Action::new(self.rejected_type())
                    .with_meta(meta)
                    .with_error(SerializedError::aborted())
            }
            Ok(payload) => Action::new(self.fulfilled_type())
                .with_payload(payload)
                .with_meta(ActionMeta::for_request(
                    &request_id,
                    arg.clone(),
                    RequestStatus::Fulfilled,
                )),
            Err(ThunkError::Failure(err)) => {
                let serialized = match &self.serialize_error {
                    Some(serializer) => serializer(err.as_ref()),
                    None => SerializedError::from_error(err.as_ref()),
                };
                Action::new(self.rejected_type())
                    .with_meta(ActionMeta::for_request(
                        &request_id,
                        arg.clone(),
                        RequestStatus::Rejected,
                    ))
                    .with_error(serialized)
            }
            Err(ThunkError::Serialized(serialized)) => Action::new(self.rejected_type())
                .with_meta(ActionMeta::for_request(
                    &request_id,
                    arg.clone(),
                    RequestStatus::Rejected,
                ))
                .with_error(serialized),
        };

        self.dispatch(&ctx, terminal.clone());
        let settled_status = terminal.request_status().unwrap_or(RequestStatus::Rejected);
        self.dispatch(
            &ctx,
            Action::new(self.settled_type()).with_meta(ActionMeta::for_request(
                &request_id,
                arg,
                settled_status,
            )),
        );

        terminal
    }

    fn dispatch(&self, ctx: &ThunkContext, action: Action) {
        if let Err(err) = (ctx.dispatch)(Op::Action(action)) {
            tracing::warn!(prefix = %self.prefix, error = %err, "thunk lifecycle dispatch failed");
        }
    }
}

impl std::fmt::Debug for AsyncThunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncThunk")
            .field("prefix", &self.prefix)
            .finish()
    }
}

/// Matches `pending` actions of any of the given thunks; with an empty list,
/// matches any `*/pending` action.
pub fn is_thunk_pending(thunks: &[&AsyncThunk], action: &Action) -> bool {
    if thunks.is_empty() {
        return action::is_pending(action);
    }
    thunks.iter().any(|thunk| thunk.is_pending(action))
}

/// Matches `fulfilled` actions of any of the given thunks; with an empty
/// list, matches any `*/fulfilled` action.
pub fn is_thunk_fulfilled(thunks: &[&AsyncThunk], action: &Action) -> bool {
    if thunks.is_empty() {
        return action::is_fulfilled(action);
    }
    thunks.iter().any(|thunk| thunk.is_fulfilled(action))
}

/// Matches `rejected` actions of any of the given thunks; with an empty
/// list, matches any `*/rejected` action.
pub fn is_thunk_rejected(thunks: &[&AsyncThunk], action: &Action) -> bool {
    if thunks.is_empty() {
        return action::is_rejected(action);
    }
    thunks.iter().any(|thunk| thunk.is_rejected(action))
}

/// Matches `settled` actions of any of the given thunks; with an empty
/// list, matches any `*/settled` action.
pub fn is_thunk_settled(thunks: &[&AsyncThunk], action: &Action) -> bool {
    if thunks.is_empty() {
        return action::is_settled(action);
    }
    thunks.iter().any(|thunk| thunk.is_settled(action))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::recording_store;
    use serde_json::json;
    use std::collections::HashSet;
    use std::time::Duration;

    fn succeeding_thunk() -> AsyncThunk {
        AsyncThunk::new("users/fetch", |arg, _api| {
            Box::pin(async move { Ok(json!({"echo": arg})) })
        })
    }

    #[tokio::test]
    async fn lifecycle_emits_pending_fulfilled_settled() {
        let (store, recorder) = recording_store();
        let thunk = succeeding_thunk();

        let terminal = store
            .dispatch(thunk.call(json!({"id": 1})))
            .unwrap()
            .resolved()
            .await;

        assert_eq!(terminal.kind, "users/fetch/fulfilled");
        assert_eq!(terminal.payload, Some(json!({"echo": {"id": 1}})));
        assert_eq!(
            recorder.kinds(),
            vec![
                "users/fetch/pending",
                "users/fetch/fulfilled",
                "users/fetch/settled"
            ]
        );

        let pending = &recorder.actions()[0];
        let meta = pending.meta.as_ref().unwrap();
        assert_eq!(meta.request_status, Some(RequestStatus::Pending));
        assert_eq!(meta.arg, Some(json!({"id": 1})));
        assert_eq!(pending.request_id(), terminal.request_id());
    }

    #[tokio::test]
    async fn reject_with_value_carries_payload_not_error() {
        let (store, recorder) = recording_store();
        let thunk = AsyncThunk::new("users/update", |_arg, api: ThunkApi| {
            Box::pin(async move { Err(api.reject_with_value(json!({"code": 400}))) })
        });

        let terminal = store
            .dispatch(thunk.call(json!(null)))
            .unwrap()
            .resolved()
            .await;

        assert_eq!(terminal.kind, "users/update/rejected");
        assert_eq!(terminal.payload, Some(json!({"code": 400})));
        assert_eq!(terminal.error, None);
        assert!(terminal.meta.as_ref().unwrap().rejected_with_value);
        assert_eq!(
            recorder.kinds(),
            vec![
                "users/update/pending",
                "users/update/rejected",
                "users/update/settled"
            ]
        );
    }

    #[tokio::test]
    async fn thrown_errors_are_serialized() {
        let (store, _recorder) = recording_store();
        let thunk = AsyncThunk::new("users/fetch", |_arg, _api| {
            Box::pin(async move { Err(ThunkError::message("backend unavailable")) })
        });

        let terminal = store
            .dispatch(thunk.call(json!(null)))
            .unwrap()
            .resolved()
            .await;

        assert_eq!(terminal.kind, "users/fetch/rejected");
        let error = terminal.error.unwrap();
        assert_eq!(error.name.as_deref(), Some("Error"));
        assert_eq!(error.message.as_deref(), Some("backend unavailable"));
    }

    #[tokio::test]
    async fn custom_error_serializer_applies() {
        let (store, _recorder) = recording_store();
        let thunk = AsyncThunk::new("users/fetch", |_arg, _api| {
            Box::pin(async move { Err(ThunkError::message("boom")) })
        })
        .with_error_serializer(|err| SerializedError {
            name: Some("CustomError".into()),
            message: Some(err.to_string()),
            stack: None,
        });

        let terminal = store
            .dispatch(thunk.call(json!(null)))
            .unwrap()
            .resolved()
            .await;
        assert_eq!(terminal.error.unwrap().name.as_deref(), Some("CustomError"));
    }

    #[tokio::test]
    async fn condition_false_emits_nothing_by_default() {
        let (store, recorder) = recording_store();
        let thunk = succeeding_thunk().with_condition(|_arg, _api| false);

        let sentinel = store
            .dispatch(thunk.call(json!(1)))
            .unwrap()
            .resolved()
            .await;

        assert_eq!(sentinel.kind, "users/fetch/rejected");
        assert!(sentinel.meta.as_ref().unwrap().condition);
        assert!(recorder.kinds().is_empty());
    }

    #[tokio::test]
    async fn condition_rejection_can_be_dispatched() {
        let (store, recorder) = recording_store();
        let thunk = succeeding_thunk()
            .with_condition(|_arg, _api| false)
            .with_condition_rejection();

        store
            .dispatch(thunk.call(json!(1)))
            .unwrap()
            .resolved()
            .await;

        // The synthetic rejection is dispatched without a pending.
        assert_eq!(recorder.kinds(), vec!["users/fetch/rejected"]);
        let rejected = &recorder.actions()[0];
        assert!(rejected.meta.as_ref().unwrap().condition);
    }

    #[tokio::test]
    async fn abort_suppresses_fulfilled() {
        let (store, recorder) = recording_store();
        let thunk = AsyncThunk::new("slow/fetch", |_arg, api: ThunkApi| {
            Box::pin(async move {
                api.signal.cancelled().await;
                Ok(json!("too late"))
            })
        });

        let handle = store.dispatch(thunk.call(json!(null))).unwrap().handle().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.abort();
        let terminal = handle.wait().await;

        assert_eq!(terminal.kind, "slow/fetch/rejected");
        let meta = terminal.meta.as_ref().unwrap();
        assert!(meta.aborted);
        assert_eq!(
            terminal.error.as_ref().unwrap().name.as_deref(),
            Some("AbortError")
        );
        assert_eq!(
            recorder.kinds(),
            vec!["slow/fetch/pending", "slow/fetch/rejected", "slow/fetch/settled"]
        );
    }

    #[tokio::test]
    async fn request_ids_are_unique_across_concurrent_dispatches() {
        let (store, _recorder) = recording_store();
        let thunk = succeeding_thunk();

        let mut ids = HashSet::new();
        for _ in 0..16 {
            let handle = store
                .dispatch(thunk.call(json!(null)))
                .unwrap()
                .handle()
                .unwrap();
            ids.insert(handle.request_id().unwrap().to_string());
            handle.wait().await;
        }
        assert_eq!(ids.len(), 16);
    }

    #[test]
    fn variadic_matchers_narrow_by_prefix() {
        let a = succeeding_thunk();
        let b = AsyncThunk::new("posts/fetch", |_arg, _api| Box::pin(async { Ok(json!(0)) }));

        let pending_a = Action::new("users/fetch/pending");
        assert!(is_thunk_pending(&[&a], &pending_a));
        assert!(!is_thunk_pending(&[&b], &pending_a));
        assert!(is_thunk_pending(&[&a, &b], &pending_a));
        // Zero thunks falls back to the bare suffix predicate.
        assert!(is_thunk_pending(&[], &pending_a));
    }
}
