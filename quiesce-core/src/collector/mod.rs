//! The batching collector
//!
//! A [`Collector`] buffers pushed items and delivers them as one batch to its
//! listeners once a quiescence delay has elapsed. It combines:
//!
//! - a buffer of pending items, in push order
//! - a flush scheduler holding at most one timer
//! - optional persistence of the buffer through a [`KeyValueStore`]
//! - a listener registry that isolates callback failures
//!
//! ## Scheduling
//!
//! The first push arms a timer for `delay_ms`. With `reset_timer_on_push`,
//! every later push restarts it (flush after the last push). Without it, the
//! first schedule is kept (flush `delay_ms` after the first push of the window).
//!
//! ## Recovery
//!
//! A persistent collector looks for a pending batch while it is constructed.
//! With `auto_clear` the batch is claimed (read and deleted atomically), so of
//! several collectors built against the same key only one recovers it. The
//! recovered batch is emitted on the next scheduler tick, giving callers the
//! chance to subscribe first. If nobody subscribes before that tick the batch
//! is dropped: recovery is at-most-once.
//!
//! ```rust
//! use std::sync::Arc;
//! use quiesce_core::{Collector, CollectorConfig, VirtualClock};
//!
//! let clock = Arc::new(VirtualClock::new());
//! let collector: Collector<String> =
//!     Collector::new(&CollectorConfig::with_delay(100), clock.clone()).unwrap();
//!
//! collector.on_flush(|batch| println!("flushed {} items", batch.len()));
//! collector.push("hello".to_string());
//! clock.advance_ms(100);
//! assert!(collector.is_empty());
//! ```

mod listeners;
mod persistence;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::config::CollectorConfig;
use crate::error::Result;
use crate::scheduler::{Scheduler, TimerHandle};
use crate::store::{self, KeyValueStore};

pub use listeners::{CollectorEvent, EmitReport, ListenerError, ListenerResult, Subscription};
pub use persistence::{PersistedState, Persistence};

use listeners::ListenerRegistry;

/// Collector counters since construction
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CollectorStats {
    /// Items accepted by `push`
    pub items_pushed: usize,
    /// Flush events emitted from the buffer
    pub flushes: usize,
    /// Items delivered by those flushes
    pub items_flushed: usize,
    /// Items found in storage at construction
    pub recovered_items: usize,
    /// Listener calls that returned an error or panicked
    pub listener_failures: usize,
    /// Failed writes of the buffer to storage
    pub persist_failures: usize,
}

/// The timer currently armed for a flush
#[derive(Debug, Clone, Copy)]
struct ArmedTimer {
    handle: TimerHandle,
    /// Distinguishes this arming from earlier ones whose task may still fire
    generation: u64,
}

struct State<T> {
    buffer: Vec<T>,
    /// Pushes not yet delivered by any emission
    unflushed: usize,
    timer: Option<ArmedTimer>,
    generation: u64,
    stats: CollectorStats,
}

struct Shared<T> {
    id: Uuid,
    delay: Duration,
    reset_timer_on_push: bool,
    auto_clear: bool,
    scheduler: Arc<dyn Scheduler>,
    persistence: Option<Persistence>,
    listeners: ListenerRegistry<T>,
    state: Mutex<State<T>>,
}

/// Buffers items and flushes them as a batch after a quiescence delay.
///
/// All operations take `&self`; the collector is safe to share between
/// threads, and the scheduler's timer tasks only hold a weak reference to it.
/// Dropping the collector cancels its pending flush timer.
pub struct Collector<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Collector<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + 'static,
{
    /// Build a collector, opening the store its config asks for.
    ///
    /// A durable store that cannot be opened leaves the collector memory-only.
    pub fn new(config: &CollectorConfig, scheduler: Arc<dyn Scheduler>) -> Result<Self> {
        config.validate()?;
        let store = store::open_for(config);
        Ok(Self::build(config, scheduler, store))
    }

    /// Build a collector persisting into an explicit store, regardless of
    /// `config.storage`.
    pub fn with_store(
        config: &CollectorConfig,
        scheduler: Arc<dyn Scheduler>,
        store: Arc<dyn KeyValueStore>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config, scheduler, Some(store)))
    }

    fn build(
        config: &CollectorConfig,
        scheduler: Arc<dyn Scheduler>,
        store: Option<Arc<dyn KeyValueStore>>,
    ) -> Self {
        let id = Uuid::new_v4();
        let persistence = store.map(|store| Persistence::new(store, config.storage_key.clone()));

        let recovered: Vec<T> = match &persistence {
            Some(p) if config.auto_clear => p.claim(),
            Some(p) => p.read(),
            None => Vec::new(),
        };

        // Without auto_clear the batch stays in storage, so the buffer adopts it.
        let buffer = if config.auto_clear {
            Vec::new()
        } else {
            recovered.clone()
        };

        let shared = Arc::new(Shared {
            id,
            delay: Duration::from_millis(config.delay_ms),
            reset_timer_on_push: config.reset_timer_on_push,
            auto_clear: config.auto_clear,
            scheduler,
            persistence,
            listeners: ListenerRegistry::new(),
            state: Mutex::new(State {
                buffer,
                unflushed: 0,
                timer: None,
                generation: 0,
                stats: CollectorStats {
                    recovered_items: recovered.len(),
                    ..Default::default()
                },
            }),
        });

        tracing::debug!(
            collector = %id,
            delay_ms = config.delay_ms,
            reset_timer_on_push = config.reset_timer_on_push,
            auto_clear = config.auto_clear,
            persistent = shared.persistence.is_some(),
            "Collector created"
        );

        if !recovered.is_empty() {
            tracing::info!(
                collector = %id,
                items = recovered.len(),
                claimed = config.auto_clear,
                "Recovered persisted batch"
            );
            let weak = Arc::downgrade(&shared);
            shared.scheduler.schedule_after(
                Duration::ZERO,
                Box::new(move || {
                    if let Some(shared) = weak.upgrade() {
                        shared.emit_flush(&recovered);
                    }
                }),
            );
        }

        Self { shared }
    }

    /// Register a callback for `event`.
    ///
    /// A callback that returns `Err` or panics does not affect other
    /// callbacks or the caller that triggered the emission.
    pub fn subscribe<F>(&self, event: CollectorEvent, callback: F) -> Subscription
    where
        F: Fn(&[T]) -> ListenerResult + Send + Sync + 'static,
    {
        self.shared.listeners.subscribe(event, callback)
    }

    /// Register an infallible flush callback
    pub fn on_flush<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&[T]) + Send + Sync + 'static,
    {
        self.subscribe(CollectorEvent::Flush, move |batch| {
            callback(batch);
            Ok(())
        })
    }

    /// Append an item and update the flush timer
    pub fn push(&self, item: T) {
        let shared = &self.shared;
        let mut state = shared.lock();

        state.buffer.push(item);
        state.unflushed += 1;
        state.stats.items_pushed += 1;
        shared.mirror(&mut state);

        let armed = state.timer;
        match armed {
            None => Shared::arm(&self.shared, &mut state),
            Some(armed) if shared.reset_timer_on_push => {
                shared.scheduler.cancel(armed.handle);
                Shared::arm(&self.shared, &mut state);
            }
            Some(_) => {}
        }
    }

    /// Copy of the pending items
    pub fn items(&self) -> Vec<T> {
        self.shared.lock().buffer.clone()
    }

    /// Drop all pending items, cancel the timer and remove the persisted batch.
    ///
    /// Always returns true.
    pub fn clear(&self) -> bool {
        let shared = &self.shared;
        let mut state = shared.lock();

        shared.disarm(&mut state);
        state.buffer.clear();
        state.unflushed = 0;
        shared.mirror(&mut state);

        tracing::debug!(collector = %shared.id, "Collector cleared");
        true
    }

    /// Flush now instead of waiting for the timer, draining when `auto_clear`
    /// is set. Returns false if there was nothing to flush.
    pub fn flush_now(&self) -> bool {
        self.shared.flush(self.shared.auto_clear)
    }

    pub fn len(&self) -> usize {
        self.shared.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of pushed items no listener has been sent yet.
    ///
    /// Equals `len()` with `auto_clear`. Without it the buffer keeps items that
    /// were already delivered, so this is what a `flush_now` would add.
    pub fn unflushed(&self) -> usize {
        self.shared.lock().unflushed
    }

    /// Whether a flush timer is currently armed
    pub fn is_armed(&self) -> bool {
        self.shared.lock().timer.is_some()
    }

    pub fn stats(&self) -> CollectorStats {
        self.shared.lock().stats.clone()
    }

    pub fn instance_id(&self) -> Uuid {
        self.shared.id
    }

    pub fn is_persistent(&self) -> bool {
        self.shared.persistence.is_some()
    }

    /// Number of callbacks registered for `event`
    pub fn listener_count(&self, event: CollectorEvent) -> usize {
        self.shared.listeners.count(event)
    }
}

impl<T> Shared<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + 'static,
{
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Schedule a flush `delay` from now and remember it as the armed timer
    fn arm(this: &Arc<Self>, state: &mut State<T>) {
        state.generation += 1;
        let generation = state.generation;
        let weak: Weak<Self> = Arc::downgrade(this);

        let handle = this.scheduler.schedule_after(
            this.delay,
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.on_timer(generation);
                }
            }),
        );

        state.timer = Some(ArmedTimer { handle, generation });
        tracing::debug!(collector = %this.id, timer = handle.id(), "Flush timer armed");
    }

    fn disarm(&self, state: &mut State<T>) {
        if let Some(armed) = state.timer.take() {
            self.scheduler.cancel(armed.handle);
        }
    }

    fn on_timer(&self, generation: u64) {
        let batch = {
            let mut state = self.lock();
            let armed = state.timer;
            match armed {
                Some(armed) if armed.generation == generation => state.timer = None,
                // Superseded or cancelled after it was already running
                _ => return,
            }
            self.take_batch(&mut state, self.auto_clear)
        };

        if let Some(batch) = batch {
            self.emit_flush(&batch);
        }
    }

    fn flush(&self, clear: bool) -> bool {
        let batch = {
            let mut state = self.lock();
            self.disarm(&mut state);
            self.take_batch(&mut state, clear)
        };

        match batch {
            Some(batch) => {
                self.emit_flush(&batch);
                true
            }
            None => false,
        }
    }

    /// Copy out the pending batch, draining buffer and storage when `clear`.
    fn take_batch(&self, state: &mut State<T>, clear: bool) -> Option<Vec<T>> {
        if state.buffer.is_empty() {
            return None;
        }

        let batch = state.buffer.clone();
        state.unflushed = 0;
        if clear {
            state.buffer.clear();
            self.mirror(state);
        }

        state.stats.flushes += 1;
        state.stats.items_flushed += batch.len();
        tracing::debug!(collector = %self.id, items = batch.len(), cleared = clear, "Flushing batch");
        Some(batch)
    }

    fn mirror(&self, state: &mut State<T>) {
        if let Some(persistence) = &self.persistence {
            if !persistence.write(&state.buffer) {
                state.stats.persist_failures += 1;
            }
        }
    }

    /// Deliver a batch with no collector lock held
    fn emit_flush(&self, batch: &[T]) {
        let report = self.listeners.emit(CollectorEvent::Flush, batch);
        if report.failed > 0 {
            self.lock().stats.listener_failures += report.failed;
        }
    }
}

impl<T> Drop for Collector<T> {
    fn drop(&mut self) {
        let mut state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(armed) = state.timer.take() {
            self.shared.scheduler.cancel(armed.handle);
        }
    }
}

impl<T> std::fmt::Debug for Collector<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("id", &self.shared.id)
            .field("delay", &self.shared.delay)
            .field("reset_timer_on_push", &self.shared.reset_timer_on_push)
            .field("auto_clear", &self.shared.auto_clear)
            .field("persistence", &self.shared.persistence)
            .finish()
    }
}
