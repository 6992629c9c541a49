//! The storage enhancer: rehydrate at startup, debounced writes, versioned
//! migrations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::task::AbortHandle;

use crate::action::{Action, ActionMeta};
use crate::persist::controller::{global_registry, ControllerRegistry, PersistController};
use crate::persist::storage::Storage;
use crate::persist::REHYDRATE_TYPE;
use crate::store::{Enhancer, Store, StoreCreator};

/// The on-disk wire format. Legacy bare values are accepted and treated as
/// version 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub version: u32,
    pub state: Value,
}

impl PersistedRecord {
    /// Parse a raw storage payload: a wrapped record, or a bare legacy
    /// value.
    pub fn parse(raw: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(raw).ok()?;
        let looks_wrapped = value.get("version").is_some_and(Value::is_u64)
            && value.get("state").is_some();
        if looks_wrapped {
            serde_json::from_value(value).ok()
        } else {
            Some(Self { version: 0, state: value })
        }
    }
}

/// How rehydrated state lands in the store's preloaded state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RehydrateStrategy {
    /// Install the persisted value as the preloaded state.
    #[default]
    Replace,
    /// Shallow-merge the persisted value over the reducer's preloaded
    /// state.
    Merge,
}

type MigrateFn = Arc<dyn Fn(Value, u32) -> Value + Send + Sync>;
type PartializeFn = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// Configuration for [`persist_enhancer`] .
#[derive(Clone)]
pub struct PersistConfig {
    pub key: String,
    pub version: u32,
    pub storage: Arc<dyn Storage>,
    /// Trailing debounce for writes, in milliseconds; zero writes on every
    /// change.
    pub throttle_ms: u64,
    pub migrate: Option<MigrateFn>,
    pub rehydrate_strategy: RehydrateStrategy,
    pub partialize: Option<PartializeFn>,
    pub whitelist: Option<Vec<String>>,
    pub blacklist: Option<Vec<String>>,
    pub registry: Option<Arc<ControllerRegistry>>,
}

impl PersistConfig {
    pub fn new(key: impl Into<String>, storage: Arc<dyn Storage>) -> Self {
        Self {
            key: key.into(),
            version: 0,
            storage,
            throttle_ms: 0,
            migrate: None,
            rehydrate_strategy: RehydrateStrategy::default(),
            partialize: None,
            whitelist: None,
            blacklist: None,
            registry: None,
        }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_throttle(mut self, throttle_ms: u64) -> Self {
        self.throttle_ms = throttle_ms;
        self
    }

    /// Reshape old persisted state; receives `(state, persisted_version)`.
    pub fn with_migrate<F>(mut self, migrate: F) -> Self
    where
        F: Fn(Value, u32) -> Value + Send + Sync + 'static,
    {
        self.migrate = Some(Arc::new(migrate));
        self
    }

    pub fn with_strategy(mut self, strategy: RehydrateStrategy) -> Self {
        self.rehydrate_strategy = strategy;
        self
    }

    /// Project the state into its storable subset.
    pub fn with_partialize<F>(mut self, partialize: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        self.partialize = Some(Arc::new(partialize));
        self
    }

    /// Persist only these top-level keys.
    pub fn with_whitelist(mut self, keys: Vec<String>) -> Self {
        self.whitelist = Some(keys);
        self
    }

    /// Persist everything but these top-level keys.
    pub fn with_blacklist(mut self, keys: Vec<String>) -> Self {
        self.blacklist = Some(keys);
        self
    }

    /// Use an isolated controller registry instead of the process-wide one.
    pub fn with_registry(mut self, registry: Arc<ControllerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    fn project(&self, state: &Value) -> Value {
        if let Some(partialize) = &self.partialize {
            return partialize(state);
        }
        if let Some(whitelist) = &self.whitelist {
            let mut out = serde_json::Map::new();
            if let Some(map) = state.as_object() {
                for key in whitelist {
                    if let Some(value) = map.get(key) {
                        out.insert(key.clone(), value.clone());
                    }
                }
            }
            return Value::Object(out);
        }
        if let Some(blacklist) = &self.blacklist {
            if let Some(map) = state.as_object() {
                let mut out = map.clone();
                for key in blacklist {
                    out.remove(key);
                }
                return Value::Object(out);
            }
        }
        state.clone()
    }
}

struct PersistWriter {
    config: PersistConfig,
    store: Store,
    controller: Arc<PersistController>,
    pending: Mutex<Option<AbortHandle>>,
    /// State identity changed since the last write or purge.
    dirty: AtomicBool,
    last_seen: Mutex<crate::store::StateRef>,
}

impl PersistWriter {
    /// Track state identity; control actions that change nothing must not
    /// mark the record dirty.
    fn observe_change(&self) -> bool {
        let current = self.store.get_state();
        let mut last = self
            .last_seen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if Arc::ptr_eq(&current, &last) {
            return false;
        }
        *last = current;
        self.dirty.store(true, Ordering::SeqCst);
        true
    }

    fn cancel_pending(&self) {
        if let Some(task) = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            task.abort();
        }
    }

    /// Trailing debounce: each change resets the timer.
    fn schedule(self: &Arc<Self>) {
        if self.config.throttle_ms == 0 {
            self.write_now();
            return;
        }

        self.cancel_pending();
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            // No runtime for the timer; degrade to an immediate write.
            self.write_now();
            return;
        };

        let writer = self.clone();
        let task = handle.spawn(async move {
            tokio::time::sleep(Duration::from_millis(writer.config.throttle_ms)).await;
            *writer
                .pending
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
            writer.write_now();
        });
        *self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(task.abort_handle());
    }

    /// Write through storage if there are unpersisted changes.
    fn write_now(&self) {
        self.cancel_pending();
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return;
        }
        let state = self.store.get_state();
        let projected = self.config.project(&state);
        let record = json!({"version": self.config.version, "state": projected});
        match serde_json::to_string(&record) {
            Ok(serialized) => {
                if let Err(err) = self.config.storage.set_item(&self.config.key, &serialized) {
                    tracing::warn!(key = %self.config.key, error = %err, "persist write failed");
                }
            }
            Err(err) => {
                tracing::warn!(key = %self.config.key, error = %err, "persist serialize failed");
            }
        }
    }

    fn purge(&self) {
        self.cancel_pending();
        self.dirty.store(false, Ordering::SeqCst);
        *self
            .last_seen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = self.store.get_state();
        if let Err(err) = self.config.storage.remove_item(&self.config.key) {
            tracing::warn!(key = %self.config.key, error = %err, "persist purge failed");
        }
    }
}

fn read_persisted(config: &PersistConfig) -> Option<PersistedRecord> {
    match config.storage.get_item(&config.key) {
        Ok(Some(raw)) => PersistedRecord::parse(&raw),
        Ok(None) => None,
        Err(err) => {
            tracing::warn!(key = %config.key, error = %err, "persist read failed");
            None
        }
    }
}

fn merge_shallow(base: Option<Value>, over: &Value) -> Value {
    match (base, over.as_object()) {
        (Some(Value::Object(mut base)), Some(over)) => {
            for (key, value) in over {
                base.insert(key.clone(), value.clone());
            }
            Value::Object(base)
        }
        _ => over.clone(),
    }
}

/// Build the persistence enhancer.
///
/// At construction: read and parse the persisted record (bare legacy
/// payloads are version 0). A version mismatch with a configured `migrate`
/// reshapes storage only — the upgraded record is written back and
/// rehydration is skipped for this session. Otherwise the persisted state
/// lands in the preloaded state per the rehydrate strategy. Either way a
/// `persist/REHYDRATE` notification is dispatched carrying the rehydrated
/// value and `{key, version}`.
///
/// After startup the store is observed and writes are debounced by
/// `throttle_ms`, skipped entirely while the controller is paused.
pub fn persist_enhancer(config: PersistConfig) -> Enhancer {
    Box::new(move |create: StoreCreator| {
        Box::new(move |reducer, preloaded| {
            let persisted = read_persisted(&config);

            let mut preloaded = preloaded;
            let mut rehydrated: Option<Value> = None;
            if let Some(record) = persisted {
                if record.version != config.version {
                    if let Some(migrate) = &config.migrate {
                        // Migration reshapes storage only; the running
                        // store keeps the reducer's preloaded state.
                        let upgraded = migrate(record.state, record.version);
                        let wrapped = json!({"version": config.version, "state": upgraded});
                        match serde_json::to_string(&wrapped) {
                            Ok(serialized) => {
                                if let Err(err) =
                                    config.storage.set_item(&config.key, &serialized)
                                {
                                    tracing::warn!(key = %config.key, error = %err, "migration write failed");
                                }
                            }
                            Err(err) => {
                                tracing::warn!(key = %config.key, error = %err, "migration serialize failed");
                            }
                        }
                    } else {
                        rehydrated = Some(record.state);
                    }
                } else {
                    rehydrated = Some(record.state);
                }
            }

            if let Some(value) = &rehydrated {
                preloaded = match config.rehydrate_strategy {
                    RehydrateStrategy::Replace => Some(value.clone()),
                    RehydrateStrategy::Merge => Some(merge_shallow(preloaded, value)),
                };
            }

            let store = create(reducer, preloaded);

            let registry = config.registry.clone().unwrap_or_else(global_registry);
            let controller = registry.controller(&config.key);

            let writer = Arc::new(PersistWriter {
                config: config.clone(),
                store: store.clone(),
                controller: controller.clone(),
                pending: Mutex::new(None),
                dirty: AtomicBool::new(false),
                last_seen: Mutex::new(store.get_state()),
            });

            {
                let writer = writer.clone();
                controller.set_flusher(move || writer.write_now());
            }
            {
                let writer = writer.clone();
                controller.set_purger(move || writer.purge());
            }

            let mut meta = ActionMeta::default();
            meta.extra.insert("key".into(), json!(config.key));
            meta.extra.insert("version".into(), json!(config.version));
            let notification = Action::new(REHYDRATE_TYPE)
                .with_payload(rehydrated.unwrap_or(Value::Null))
                .with_meta(meta);
            if let Err(err) = store.dispatch(notification) {
                tracing::warn!(key = %config.key, error = %err, "rehydrate dispatch failed");
            }

            {
                let writer = writer.clone();
                store.subscribe(move || {
                    if writer.observe_change() && !writer.controller.is_paused() {
                        writer.schedule();
                    }
                });
            }

            store
        })
    })
}
