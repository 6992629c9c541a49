//! Input-equality memoized selectors.
//!
//! Selectors derive values from the root state and hand back shared
//! [`Arc`]s: while inputs are unchanged, repeated calls return the identical
//! allocation, so consumers can detect "nothing changed" with a pointer
//! comparison. In the dynamic state model, "referential equality" of an
//! input tuple means `Arc` pointer equality or value equality, whichever is
//! cheaper to establish first.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};

use crate::store::StateRef;

/// An input extractor feeding a selector.
pub type SelectorFn = Arc<dyn Fn(&StateRef) -> Arc<Value> + Send + Sync>;

type Combiner = Arc<dyn Fn(&[Arc<Value>]) -> Value + Send + Sync>;

struct SelectorCache {
    state: Option<StateRef>,
    inputs: Vec<Arc<Value>>,
    output: Arc<Value>,
}

/// A memoized derivation over the root state.
pub struct Selector {
    inputs: Vec<SelectorFn>,
    combiner: Combiner,
    /// Memoize by state identity instead of by input tuple.
    state_keyed: bool,
    cache: Mutex<Option<SelectorCache>>,
    recomputations: AtomicUsize,
}

fn same_value(a: &Arc<Value>, b: &Arc<Value>) -> bool {
    Arc::ptr_eq(a, b) || a == b
}

impl Selector {
    /// Run the selector against the given state.
    pub fn select(self: &Arc<Self>, state: &StateRef) -> Arc<Value> {
        let mut cache = self
            .cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if self.state_keyed {
            if let Some(cached) = cache.as_ref() {
                if cached
                    .state
                    .as_ref()
                    .is_some_and(|cached_state| Arc::ptr_eq(cached_state, state))
                {
                    return cached.output.clone();
                }
            }
        }

        let inputs: Vec<Arc<Value>> = self.inputs.iter().map(|input| input(state)).collect();

        if !self.state_keyed {
            if let Some(cached) = cache.as_ref() {
                if cached.inputs.len() == inputs.len()
                    && cached
                        .inputs
                        .iter()
                        .zip(inputs.iter())
                        .all(|(a, b)| same_value(a, b))
                {
                    return cached.output.clone();
                }
            }
        }

        let output = Arc::new((self.combiner)(&inputs));
        self.recomputations.fetch_add(1, Ordering::Relaxed);
        *cache = Some(SelectorCache {
            state: self.state_keyed.then(|| state.clone()),
            inputs,
            output: output.clone(),
        });
        output
    }

    /// How many times the combiner has run. Useful in tests.
    pub fn recomputations(&self) -> usize {
        self.recomputations.load(Ordering::Relaxed)
    }

    /// Use this selector as the input of another.
    pub fn as_input(self: &Arc<Self>) -> SelectorFn {
        let selector = self.clone();
        Arc::new(move |state| selector.select(state))
    }
}

/// Lift a plain extraction function into a [`SelectorFn`].
pub fn input<F>(f: F) -> SelectorFn
where
    F: Fn(&Value) -> Value + Send + Sync + 'static,
{
    Arc::new(move |state| Arc::new(f(state)))
}

/// Memoize a derivation over a set of inputs.
///
/// The combiner reruns only when the input tuple changed; identical inputs
/// return the identical output `Arc`.
pub fn create_selector<F>(inputs: Vec<SelectorFn>, combiner: F) -> Arc<Selector>
where
    F: Fn(&[Arc<Value>]) -> Value + Send + Sync + 'static,
{
    Arc::new(Selector {
        inputs,
        combiner: Arc::new(combiner),
        state_keyed: false,
        cache: Mutex::new(None),
        recomputations: AtomicUsize::new(0),
    })
}

/// One-argument passthrough: memoizes by state identity.
pub fn state_selector<F>(f: F) -> Arc<Selector>
where
    F: Fn(&Value) -> Value + Send + Sync + 'static,
{
    Arc::new(Selector {
        inputs: vec![input(f)],
        combiner: Arc::new(|inputs: &[Arc<Value>]| {
            inputs
                .first()
                .map(|v| v.as_ref().clone())
                .unwrap_or(Value::Null)
        }),
        state_keyed: true,
        cache: Mutex::new(None),
        recomputations: AtomicUsize::new(0),
    })
}

/// Build an object-valued selector that returns the same `Arc` while state
/// identity is unchanged.
pub fn create_structured_selector<K: Into<String>>(
    fields: Vec<(K, Arc<Selector>)>,
) -> Arc<Selector> {
    let fields: Vec<(String, Arc<Selector>)> = fields
        .into_iter()
        .map(|(key, selector)| (key.into(), selector))
        .collect();
    let keys: Vec<String> = fields.iter().map(|(key, _)| key.clone()).collect();
    let inputs: Vec<SelectorFn> = fields
        .iter()
        .map(|(_, selector)| selector.as_input())
        .collect();

    Arc::new(Selector {
        inputs,
        combiner: Arc::new(move |values: &[Arc<Value>]| {
            let mut object = Map::with_capacity(keys.len());
            for (key, value) in keys.iter().zip(values.iter()) {
                object.insert(key.clone(), value.as_ref().clone());
            }
            Value::Object(object)
        }),
        state_keyed: true,
        cache: Mutex::new(None),
        recomputations: AtomicUsize::new(0),
    })
}
