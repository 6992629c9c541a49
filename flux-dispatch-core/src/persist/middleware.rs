//! Control middleware: maps persistence control actions to controller
//! methods and optionally gates which actions may schedule writes.

use std::sync::Arc;

use crate::action::Action;
use crate::middleware::{Middleware, MiddlewareApi, NextFn};
use crate::persist::controller::{global_registry, ControllerRegistry};
use crate::persist::{FLUSH_TYPE, PAUSE_TYPE, PURGE_TYPE, RESUME_TYPE};
use crate::store::Op;

type ActionFilter = Arc<dyn Fn(&Action) -> bool + Send + Sync>;

/// Configuration for [`persist_middleware`].
#[derive(Clone)]
pub struct PersistMiddlewareConfig {
    pub key: String,
    /// Only actions passing the filter trigger an immediate persist; all
    /// others run with writes paused.
    pub action_filter: Option<ActionFilter>,
    /// Convenience form of `action_filter`: a list of action types.
    pub types: Option<Vec<String>>,
    pub registry: Option<Arc<ControllerRegistry>>,
}

impl PersistMiddlewareConfig {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            action_filter: None,
            types: None,
            registry: None,
        }
    }

    pub fn with_action_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Action) -> bool + Send + Sync + 'static,
    {
        self.action_filter = Some(Arc::new(filter));
        self
    }

    pub fn with_types(mut self, types: Vec<String>) -> Self {
        self.types = Some(types);
        self
    }

    pub fn with_registry(mut self, registry: Arc<ControllerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    fn matches(&self, action: &Action) -> Option<bool> {
        if let Some(filter) = &self.action_filter {
            return Some(filter(action));
        }
        self.types
            .as_ref()
            .map(|types| types.iter().any(|kind| *kind == action.kind))
    }
}

/// Build the control middleware for a persisted key.
pub fn persist_middleware(config: PersistMiddlewareConfig) -> Arc<dyn Middleware> {
    Arc::new(PersistMiddleware { config })
}

struct PersistMiddleware {
    config: PersistMiddlewareConfig,
}

impl Middleware for PersistMiddleware {
    fn wrap(self: Arc<Self>, _api: MiddlewareApi, next: NextFn) -> NextFn {
        let registry = self
            .config
            .registry
            .clone()
            .unwrap_or_else(global_registry);
        let controller = registry.controller(&self.config.key);
        let config = self.config.clone();

        Arc::new(move |op| {
            let Op::Action(action) = op else {
                return next(op);
            };

            match action.kind.as_str() {
                PAUSE_TYPE => controller.pause(),
                RESUME_TYPE => controller.resume(),
                FLUSH_TYPE => controller.flush(),
                PURGE_TYPE => controller.purge(),
                _ => {
                    if let Some(matches) = config.matches(&action) {
                        if matches {
                            // Matching actions persist immediately.
                            let result = next(Op::Action(action));
                            controller.flush();
                            return result;
                        }
                        // The reducer still runs, but no write is
                        // scheduled for this change.
                        let was_paused = controller.is_paused();
                        controller.pause();
                        let result = next(Op::Action(action));
                        if !was_paused {
                            controller.resume();
                        }
                        return result;
                    }
                }
            }
            next(Op::Action(action))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::apply_middleware;
    use crate::persist::enhancer::{persist_enhancer, PersistConfig};
    use crate::persist::storage::{MemoryStorage, Storage};
    use crate::reducer::create_reducer;
    use crate::store::create_store_with_enhancer;
    use crate::middleware::compose_enhancers;
    use serde_json::{json, Value};

    fn counter_reducer() -> crate::reducer::SliceReducer {
        create_reducer(json!(0), |builder| {
            builder.add_case("counter/increment", |draft, _| {
                Some(json!(draft.as_i64().unwrap_or(0) + 1))
            });
            builder.add_case("counter/scratch", |draft, _| {
                Some(json!(draft.as_i64().unwrap_or(0) + 100))
            });
        })
    }

    fn build(
        storage: Arc<MemoryStorage>,
        registry: Arc<ControllerRegistry>,
        middleware_config: PersistMiddlewareConfig,
    ) -> crate::store::Store {
        create_store_with_enhancer(
            counter_reducer(),
            None,
            compose_enhancers(vec![
                persist_enhancer(
                    PersistConfig::new("app", storage).with_registry(registry.clone()),
                ),
                apply_middleware(vec![persist_middleware(
                    middleware_config.with_registry(registry),
                )]),
            ]),
        )
    }

    fn persisted_state(storage: &MemoryStorage) -> Option<Value> {
        storage
            .get_item("app")
            .unwrap()
            .map(|raw| serde_json::from_str::<Value>(&raw).unwrap()["state"].clone())
    }

    #[tokio::test]
    async fn control_actions_drive_the_controller() {
        let storage = Arc::new(MemoryStorage::new());
        let registry = Arc::new(ControllerRegistry::new());
        let store = build(
            storage.clone(),
            registry.clone(),
            PersistMiddlewareConfig::new("app"),
        );

        store.dispatch(Action::new(PAUSE_TYPE)).unwrap();
        assert!(registry.controller("app").is_paused());

        store.dispatch(Action::new("counter/increment")).unwrap();
        assert_eq!(persisted_state(&storage), None, "paused: nothing written");

        store.dispatch(Action::new(RESUME_TYPE)).unwrap();
        store.dispatch(Action::new(FLUSH_TYPE)).unwrap();
        assert_eq!(persisted_state(&storage), Some(json!(1)));

        store.dispatch(Action::new(PURGE_TYPE)).unwrap();
        assert_eq!(storage.get_item("app").unwrap(), None);
    }

    #[tokio::test]
    async fn type_gating_persists_matching_actions_only() {
        let storage = Arc::new(MemoryStorage::new());
        let registry = Arc::new(ControllerRegistry::new());
        let store = build(
            storage.clone(),
            registry,
            PersistMiddlewareConfig::new("app")
                .with_types(vec!["counter/increment".to_string()]),
        );

        // Non-matching: reducer runs, storage untouched.
        store.dispatch(Action::new("counter/scratch")).unwrap();
        assert_eq!(store.get_state().as_i64(), Some(100));
        assert_eq!(persisted_state(&storage), None);

        // Matching: persisted immediately.
        store.dispatch(Action::new("counter/increment")).unwrap();
        assert_eq!(persisted_state(&storage), Some(json!(101)));
    }

    #[tokio::test]
    async fn action_filter_gates_like_types() {
        let storage = Arc::new(MemoryStorage::new());
        let registry = Arc::new(ControllerRegistry::new());
        let store = build(
            storage.clone(),
            registry,
            PersistMiddlewareConfig::new("app")
                .with_action_filter(|action| action.kind.ends_with("/increment")),
        );

        store.dispatch(Action::new("counter/scratch")).unwrap();
        assert_eq!(persisted_state(&storage), None);

        store.dispatch(Action::new("counter/increment")).unwrap();
        assert_eq!(persisted_state(&storage), Some(json!(101)));
    }
}
