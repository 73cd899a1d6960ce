//! Real-time scheduler backed by a tokio runtime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use super::{Scheduler, Task, TimerHandle};
use crate::error::{Error, Result};

type TaskMap = Arc<Mutex<HashMap<u64, JoinHandle<()>>>>;

/// Runs each task on a spawned tokio task after sleeping for its delay.
///
/// Cancellation aborts the spawned task. A task that already woke up may still
/// run after `cancel` returns; callers that care check their own handle.
pub struct TokioScheduler {
    runtime: Handle,
    next_id: AtomicU64,
    tasks: TaskMap,
}

impl TokioScheduler {
    /// Schedule onto the given runtime
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            next_id: AtomicU64::new(0),
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Schedule onto the runtime this is called from
    pub fn current() -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::Config(format!("no tokio runtime available: {}", e)))?;
        Ok(Self::new(runtime))
    }

    /// Number of spawned tasks that have not yet run or been cancelled
    pub fn pending(&self) -> usize {
        lock(&self.tasks).len()
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_after(&self, delay: Duration, task: Task) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let tasks = Arc::clone(&self.tasks);

        // Held across spawn so the task cannot deregister before it is registered.
        let mut registered = lock(&self.tasks);
        let join = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            lock(&tasks).remove(&id);
            task();
        });
        registered.insert(id, join);

        TimerHandle::new(id)
    }

    fn cancel(&self, handle: TimerHandle) {
        if let Some(join) = lock(&self.tasks).remove(&handle.id()) {
            join.abort();
        }
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        for (_, join) in lock(&self.tasks).drain() {
            join.abort();
        }
    }
}

fn lock(tasks: &TaskMap) -> std::sync::MutexGuard<'_, HashMap<u64, JoinHandle<()>>> {
    tasks.lock().unwrap_or_else(PoisonError::into_inner)
}
