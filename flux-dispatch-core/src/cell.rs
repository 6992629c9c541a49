//! A typed observable cell: plain reads, explicit subscription.
//!
//! Hook adapters expose their reactive state through this cell. Reads are
//! plain accesses; `subscribe` hands the caller a disposer tied to the
//! consumer's lifetime.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

type CellListener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct CellShared<T> {
    value: RwLock<T>,
    listeners: Mutex<Vec<(u64, CellListener<T>)>>,
    next_id: AtomicU64,
}

/// A shared value that notifies subscribers on writes.
pub struct ObservableCell<T> {
    shared: Arc<CellShared<T>>,
}

impl<T> Clone for ObservableCell<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> ObservableCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            shared: Arc::new(CellShared {
                value: RwLock::new(value),
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Read the current value.
    pub fn get(&self) -> T {
        self.shared
            .value
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Write a value and notify subscribers.
    pub fn set(&self, value: T) {
        *self
            .shared
            .value
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = value;
        self.notify();
    }

    /// Register a listener; returns a disposer.
    pub fn subscribe(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> CellSubscription<T> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((id, Arc::new(listener)));
        CellSubscription {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    fn notify(&self) {
        let value = self.get();
        let snapshot: Vec<CellListener<T>> = self
            .shared
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in snapshot {
            listener(&value);
        }
    }
}

impl<T: Clone + Send + Sync + PartialEq + 'static> ObservableCell<T> {
    /// Write a value, notifying only when it differs from the current one.
    pub fn set_if_changed(&self, value: T) {
        {
            let mut current = self
                .shared
                .value
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if *current == value {
                return;
            }
            *current = value;
        }
        self.notify();
    }
}

/// Disposer returned by [`ObservableCell::subscribe`].
pub struct CellSubscription<T> {
    id: u64,
    shared: Weak<CellShared<T>>,
}

impl<T> CellSubscription<T> {
    pub fn dispose(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared
                .listeners
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .retain(|(id, _)| *id != self.id);
        }
    }
}
