//! Listener registry
//!
//! Callbacks are grouped by [`CollectorEvent`]. Emission isolates every
//! callback: an `Err` return or a panic is contained at that callback's call
//! site, and the remaining callbacks still receive the payload.

use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Events a collector emits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectorEvent {
    /// A batch was flushed, either by the timer or by recovery
    Flush,
}

impl CollectorEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectorEvent::Flush => "flush",
        }
    }
}

/// Error a listener may return; it is contained, never propagated
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// Return type of a listener callback
pub type ListenerResult = std::result::Result<(), ListenerError>;

type Callback<T> = Arc<dyn Fn(&[T]) -> ListenerResult + Send + Sync>;

/// Outcome of one emission
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EmitReport {
    /// Callbacks that returned `Ok`
    pub delivered: usize,
    /// Callbacks that returned `Err` or panicked
    pub failed: usize,
}

struct RegistryState<T> {
    next_id: u64,
    /// Keyed by subscription id, so callbacks run in subscription order
    listeners: HashMap<CollectorEvent, BTreeMap<u64, Callback<T>>>,
}

trait Detach: Send + Sync {
    fn detach(&self, event: CollectorEvent, id: u64);
}

impl<T> Detach for Mutex<RegistryState<T>> {
    fn detach(&self, event: CollectorEvent, id: u64) {
        let mut state = self.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(set) = state.listeners.get_mut(&event) {
            set.remove(&id);
        }
    }
}

pub(crate) struct ListenerRegistry<T> {
    state: Arc<Mutex<RegistryState<T>>>,
}

impl<T: 'static> ListenerRegistry<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RegistryState {
                next_id: 0,
                listeners: HashMap::new(),
            })),
        }
    }

    pub(crate) fn subscribe<F>(&self, event: CollectorEvent, callback: F) -> Subscription
    where
        F: Fn(&[T]) -> ListenerResult + Send + Sync + 'static,
    {
        let id = {
            let mut state = self.lock();
            let id = state.next_id;
            state.next_id += 1;
            state
                .listeners
                .entry(event)
                .or_default()
                .insert(id, Arc::new(callback));
            id
        };

        let registry: Arc<dyn Detach> = self.state.clone();
        Subscription {
            registry: Arc::downgrade(&registry),
            event,
            id,
        }
    }

    /// Invoke every callback registered for `event`.
    ///
    /// The registry lock is released before any callback runs, so callbacks may
    /// subscribe, unsubscribe or call back into the collector.
    pub(crate) fn emit(&self, event: CollectorEvent, payload: &[T]) -> EmitReport {
        let callbacks: Vec<Callback<T>> = self
            .lock()
            .listeners
            .get(&event)
            .map(|set| set.values().cloned().collect())
            .unwrap_or_default();

        let mut report = EmitReport::default();
        for callback in callbacks {
            match panic::catch_unwind(AssertUnwindSafe(|| callback(payload))) {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    report.failed += 1;
                    tracing::debug!(event = event.as_str(), error = %e, "Listener returned an error");
                }
                Err(_) => {
                    report.failed += 1;
                    tracing::debug!(event = event.as_str(), "Listener panicked");
                }
            }
        }
        report
    }

    pub(crate) fn count(&self, event: CollectorEvent) -> usize {
        self.lock().listeners.get(&event).map_or(0, BTreeMap::len)
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle returned by `subscribe`
///
/// Dropping it keeps the callback registered; call
/// [`unsubscribe`](Subscription::unsubscribe) to remove it.
#[derive(Clone)]
pub struct Subscription {
    registry: Weak<dyn Detach>,
    event: CollectorEvent,
    id: u64,
}

impl Subscription {
    /// Remove exactly this callback. Calling it again does nothing.
    pub fn unsubscribe(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.detach(self.event, self.id);
        }
    }

    pub fn event(&self) -> CollectorEvent {
        self.event
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("event", &self.event)
            .field("id", &self.id)
            .finish()
    }
}
