//! Timer capability used by the collector
//!
//! The collector never touches a clock directly. It asks a [`Scheduler`] to run
//! a task after a delay and may cancel it through the returned [`TimerHandle`].
//!
//! Two implementations are provided:
//! - [`VirtualClock`]: manual, deterministic time for tests and simulations
//! - [`TokioScheduler`]: real time on a tokio runtime
//!
//! Tasks always run on their own task boundary, never nested inside the call
//! to [`Scheduler::schedule_after`].

mod runtime;
mod virtual_clock;

use std::time::Duration;

pub use runtime::TokioScheduler;
pub use virtual_clock::VirtualClock;

/// Work scheduled to run once a timer elapses
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Opaque handle to a scheduled task
///
/// Handles are unique per scheduler instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

impl TimerHandle {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }

    /// Numeric id, mainly useful in log output
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Host timer facility
pub trait Scheduler: Send + Sync {
    /// Run `task` once `delay` has elapsed.
    ///
    /// A zero delay means "at the next scheduling opportunity".
    fn schedule_after(&self, delay: Duration, task: Task) -> TimerHandle;

    /// Cancel a scheduled task. Cancelling a task that already ran, or was
    /// already cancelled, does nothing.
    fn cancel(&self, handle: TimerHandle);
}
