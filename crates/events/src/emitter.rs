//! Typed observer registry with explicit subscription handles.
//!
//! [`Emitter::on`] and [`Emitter::off`] are amortised O(1). Emission walks
//! the slots in registration order. Registering the same callback `Arc`
//! twice returns the original handle instead of adding a second slot.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

/// A registered observer.
pub type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Handle returned by [`Emitter::on`]; pass it to [`Emitter::off`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// A callback that panicked during [`Emitter::emit`].
#[derive(Debug, Clone)]
pub struct CallbackFailure {
    pub subscription: SubscriptionId,
    pub message: String,
}

/// Outcome of one emission: every callback ran, some may have failed.
#[derive(Debug, Clone, Default)]
pub struct EmitReport {
    pub delivered: usize,
    pub failures: Vec<CallbackFailure>,
}

impl EmitReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Tombstoned slots are compacted once they outnumber live ones.
const COMPACT_MIN_SLOTS: usize = 16;

struct Slot<T> {
    id: SubscriptionId,
    callback: Callback<T>,
}

struct Registry<T> {
    slots: Vec<Option<Slot<T>>>,
    /// Subscription id -> slot index.
    by_id: HashMap<SubscriptionId, usize>,
    /// Callback allocation address -> subscription id.
    by_callback: HashMap<usize, SubscriptionId>,
    next_id: u64,
}

impl<T> Registry<T> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            by_id: HashMap::new(),
            by_callback: HashMap::new(),
            next_id: 0,
        }
    }

    fn compact(&mut self) {
        self.slots.retain(Option::is_some);
        self.by_id.clear();
        for (idx, slot) in self.slots.iter().enumerate() {
            if let Some(slot) = slot {
                self.by_id.insert(slot.id, idx);
            }
        }
    }
}

/// Synchronous publish/subscribe primitive for one payload type.
pub struct Emitter<T> {
    registry: Mutex<Registry<T>>,
}

impl<T> Default for Emitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Emitter<T> {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry::new()),
        }
    }

    /// Register a callback.
    pub fn on(&self, callback: Callback<T>) -> SubscriptionId {
        let key = callback_key(&callback);
        let mut reg = self.lock();

        if let Some(existing) = reg.by_callback.get(&key) {
            return *existing;
        }

        let id = SubscriptionId(reg.next_id);
        reg.next_id += 1;
        let idx = reg.slots.len();
        reg.slots.push(Some(Slot { id, callback }));
        reg.by_id.insert(id, idx);
        reg.by_callback.insert(key, id);
        id
    }

    /// Deregister a callback. Unknown handles are ignored.
    ///
    /// Returns whether a callback was removed.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut reg = self.lock();
        let Some(idx) = reg.by_id.remove(&id) else {
            return false;
        };
        if let Some(slot) = reg.slots[idx].take() {
            let key = callback_key(&slot.callback);
            reg.by_callback.remove(&key);
        }

        let live = reg.by_id.len();
        if reg.slots.len() >= COMPACT_MIN_SLOTS && live * 2 < reg.slots.len() {
            reg.compact();
        }
        true
    }

    /// Number of registered callbacks.
    pub fn len(&self) -> usize {
        self.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every registration.
    pub fn clear(&self) {
        *self.lock() = Registry::new();
    }

    /// Invoke every registered callback with `payload`, in registration order.
    ///
    /// The registry lock is released before callbacks run, so callbacks may
    /// register or deregister. A panicking callback does not prevent the
    /// remaining ones from running; panics are collected into the report.
    pub fn emit(&self, payload: &T) -> EmitReport {
        let callbacks: Vec<(SubscriptionId, Callback<T>)> = self
            .lock()
            .slots
            .iter()
            .flatten()
            .map(|slot| (slot.id, Arc::clone(&slot.callback)))
            .collect();

        let mut report = EmitReport::default();
        for (id, callback) in callbacks {
            match panic::catch_unwind(AssertUnwindSafe(|| callback(payload))) {
                Ok(()) => report.delivered += 1,
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    tracing::warn!(subscription = id.0, error = %message, "Event callback panicked");
                    report.failures.push(CallbackFailure {
                        subscription: id,
                        message,
                    });
                }
            }
        }
        report
    }

    fn lock(&self) -> MutexGuard<'_, Registry<T>> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn callback_key<T>(callback: &Callback<T>) -> usize {
    Arc::as_ptr(callback) as *const () as usize
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "callback panicked".to_string()
    }
}
