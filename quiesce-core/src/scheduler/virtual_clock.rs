//! Deterministic scheduler driven by explicit `advance` calls.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use super::{Scheduler, Task, TimerHandle};

/// Manually advanced clock.
///
/// Time only moves when [`advance`](VirtualClock::advance) is called. Tasks due
/// at the same instant run in the order they were scheduled, and tasks scheduled
/// while advancing run in the same call if they fall due before its target.
#[derive(Default)]
pub struct VirtualClock {
    state: Mutex<ClockState>,
}

#[derive(Default)]
struct ClockState {
    now: Duration,
    next_id: u64,
    /// Ordered by deadline, then by scheduling order
    queue: BTreeMap<(Duration, u64), Task>,
    deadlines: HashMap<u64, Duration>,
}

impl VirtualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time elapsed since the clock was created
    pub fn now(&self) -> Duration {
        self.lock().now
    }

    /// Number of tasks waiting to run
    pub fn pending(&self) -> usize {
        self.lock().queue.len()
    }

    /// Move time forward by `by`, running every task that falls due.
    ///
    /// Returns the number of tasks run.
    pub fn advance(&self, by: Duration) -> usize {
        let target = self.lock().now + by;
        let mut ran = 0;

        loop {
            // Never hold the lock while a task runs; tasks schedule and cancel.
            let task = {
                let mut state = self.lock();
                let due = match state.queue.keys().next() {
                    Some(&(deadline, id)) if deadline <= target => (deadline, id),
                    _ => break,
                };
                state.now = due.0;
                state.deadlines.remove(&due.1);
                state.queue.remove(&due)
            };

            if let Some(task) = task {
                task();
                ran += 1;
            }
        }

        self.lock().now = target;
        ran
    }

    /// Run tasks scheduled with zero delay without moving time.
    pub fn run_pending(&self) -> usize {
        self.advance(Duration::ZERO)
    }

    /// Convenience for `advance(Duration::from_millis(ms))`
    pub fn advance_ms(&self, ms: u64) -> usize {
        self.advance(Duration::from_millis(ms))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ClockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Scheduler for VirtualClock {
    fn schedule_after(&self, delay: Duration, task: Task) -> TimerHandle {
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;

        let deadline = state.now + delay;
        state.queue.insert((deadline, id), task);
        state.deadlines.insert(id, deadline);

        TimerHandle::new(id)
    }

    fn cancel(&self, handle: TimerHandle) {
        let mut state = self.lock();
        if let Some(deadline) = state.deadlines.remove(&handle.id()) {
            state.queue.remove(&(deadline, handle.id()));
        }
    }
}

impl std::fmt::Debug for VirtualClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("VirtualClock")
            .field("now", &state.now)
            .field("pending", &state.queue.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> Task) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_clone = Arc::clone(&log);
        let make = move |name: &'static str| -> Task {
            let log = Arc::clone(&log_clone);
            Box::new(move || log.lock().unwrap().push(name))
        };
        (log, make)
    }

    #[test]
    fn test_task_runs_only_when_due() {
        let clock = VirtualClock::new();
        let (log, task) = recorder();

        clock.schedule_after(Duration::from_millis(100), task("a"));

        assert_eq!(clock.advance_ms(99), 0);
        assert!(log.lock().unwrap().is_empty());

        assert_eq!(clock.advance_ms(1), 1);
        assert_eq!(*log.lock().unwrap(), vec!["a"]);
        assert_eq!(clock.now(), Duration::from_millis(100));
    }

    #[test]
    fn test_same_deadline_runs_in_schedule_order() {
        let clock = VirtualClock::new();
        let (log, task) = recorder();

        clock.schedule_after(Duration::from_millis(10), task("first"));
        clock.schedule_after(Duration::from_millis(10), task("second"));
        clock.schedule_after(Duration::from_millis(5), task("early"));

        clock.advance_ms(10);
        assert_eq!(*log.lock().unwrap(), vec!["early", "first", "second"]);
    }

    #[test]
    fn test_cancel_removes_task() {
        let clock = VirtualClock::new();
        let (log, task) = recorder();

        let handle = clock.schedule_after(Duration::from_millis(10), task("a"));
        clock.cancel(handle);
        clock.cancel(handle);

        assert_eq!(clock.pending(), 0);
        clock.advance_ms(50);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_zero_delay_waits_for_run_pending() {
        let clock = VirtualClock::new();
        let (log, task) = recorder();

        clock.schedule_after(Duration::ZERO, task("tick"));
        assert!(log.lock().unwrap().is_empty());

        assert_eq!(clock.run_pending(), 1);
        assert_eq!(*log.lock().unwrap(), vec!["tick"]);
    }

    #[test]
    fn test_task_scheduled_during_advance_runs_if_due() {
        let clock = Arc::new(VirtualClock::new());
        let (log, task) = recorder();

        let inner = task("inner");
        let clock_clone = Arc::clone(&clock);
        clock.schedule_after(
            Duration::from_millis(10),
            Box::new(move || {
                clock_clone.schedule_after(Duration::from_millis(10), inner);
            }),
        );

        assert_eq!(clock.advance_ms(20), 2);
        assert_eq!(*log.lock().unwrap(), vec!["inner"]);
    }
}
