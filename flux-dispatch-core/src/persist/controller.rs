//! Process-wide persistence controllers.
//!
//! A controller coordinates the enhancer (which owns the write path) and
//! the middleware (which maps control actions) for one storage key. The
//! registry is injectable so tests can isolate controllers; the default is
//! a process-wide singleton shared by every store persisting the same key.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;

type ControlFn = Arc<dyn Fn() + Send + Sync>;

/// Pause/resume/flush/purge coordination for one persisted key.
#[derive(Default)]
pub struct PersistController {
    paused: AtomicBool,
    flusher: Mutex<Option<ControlFn>>,
    purger: Mutex<Option<ControlFn>>,
}

impl PersistController {
    /// Suspend write scheduling; reducers keep running.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Cancel any pending debounce and write immediately.
    pub fn flush(&self) {
        let flusher = self
            .flusher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if let Some(flusher) = flusher {
            flusher();
        }
    }

    /// Remove the persisted record from storage.
    pub fn purge(&self) {
        let purger = self
            .purger
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if let Some(purger) = purger {
            purger();
        }
    }

    /// Installed by the enhancer that owns the write path.
    pub fn set_flusher(&self, flusher: impl Fn() + Send + Sync + 'static) {
        *self
            .flusher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Arc::new(flusher));
    }

    /// Installed by the enhancer that owns the storage entry.
    pub fn set_purger(&self, purger: impl Fn() + Send + Sync + 'static) {
        *self
            .purger
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Arc::new(purger));
    }
}

/// Maps persistence keys to shared controllers.
#[derive(Default)]
pub struct ControllerRegistry {
    controllers: Mutex<HashMap<String, Arc<PersistController>>>,
}

impl ControllerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The controller for `key`, created on first use. Enhancer and
    /// middleware targeting the same key share one controller.
    pub fn controller(&self, key: &str) -> Arc<PersistController> {
        self.controllers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(key.to_string())
            .or_default()
            .clone()
    }
}

static GLOBAL_REGISTRY: Lazy<Arc<ControllerRegistry>> =
    Lazy::new(|| Arc::new(ControllerRegistry::new()));

/// The process-wide default registry.
pub fn global_registry() -> Arc<ControllerRegistry> {
    GLOBAL_REGISTRY.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn same_key_shares_a_controller() {
        let registry = ControllerRegistry::new();
        let a = registry.controller("app");
        let b = registry.controller("app");
        let other = registry.controller("other");

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &other));

        a.pause();
        assert!(b.is_paused());
        b.resume();
        assert!(!a.is_paused());
    }

    #[test]
    fn flush_and_purge_invoke_installed_hooks() {
        let controller = PersistController::default();
        let flushes = Arc::new(AtomicUsize::new(0));
        let purges = Arc::new(AtomicUsize::new(0));

        // Without hooks these are no-ops.
        controller.flush();
        controller.purge();

        let f = flushes.clone();
        controller.set_flusher(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        let p = purges.clone();
        controller.set_purger(move || {
            p.fetch_add(1, Ordering::SeqCst);
        });

        controller.flush();
        controller.purge();
        assert_eq!(flushes.load(Ordering::SeqCst), 1);
        assert_eq!(purges.load(Ordering::SeqCst), 1);
    }
}
