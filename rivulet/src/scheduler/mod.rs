// SPDX-License-Identifier: MIT OR Apache-2.0

//! Execution contexts deciding where producer and timer work runs.
//!
//! Three implementations are provided:
//!
//! - [`ImmediateScheduler`] runs work inline on the calling thread, useful for tests. It can't
//!   wait and rejects delayed or periodic work.
//! - [`ThreadScheduler`] spawns a dedicated thread for every task.
//! - [`PoolScheduler`] runs tasks on a tokio runtime, either owned or borrowed through a
//!   [`Handle`](tokio::runtime::Handle).
//!
//! Tasks are plain closures. They are expected to return quickly, long-running producers should
//! use periodic tasks instead of sleeping inside a task.
mod immediate;
mod pool;
mod thread;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tracing::warn;

use crate::SchedulerError;
use crate::config::Config;
use crate::utils::lock;

pub use immediate::ImmediateScheduler;
pub use pool::PoolScheduler;
pub use thread::ThreadScheduler;

/// Smallest period a periodic task can run with.
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

pub type Task = Box<dyn FnOnce() + Send + 'static>;

pub type PeriodicTask = Arc<dyn Fn() + Send + Sync + 'static>;

pub type SchedulerRef = Arc<dyn Scheduler>;

/// Execution context for producer and timer work.
pub trait Scheduler: Send + Sync + 'static {
    /// Runs `task` once after `delay`.
    fn schedule(&self, delay: Duration, task: Task) -> Result<TaskHandle, SchedulerError>;

    /// Runs `task` first after `initial` and then every `period` until cancelled.
    fn schedule_periodic(
        &self,
        initial: Duration,
        period: Duration,
        task: PeriodicTask,
    ) -> Result<TaskHandle, SchedulerError>;

    fn name(&self) -> &str;
}

/// Handle to cancel scheduled work.
///
/// Cancelling is idempotent. A cancelled task which did not start yet never runs, a periodic task
/// stops before its next run.
#[derive(Clone)]
pub struct TaskHandle {
    inner: Arc<TaskState>,
}

type Waker = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct TaskState {
    cancelled: AtomicBool,
    finished: AtomicBool,
    waker: Mutex<Option<Waker>>,
}

impl TaskHandle {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(TaskState::default()),
        }
    }

    pub(crate) fn finished() -> Self {
        let handle = Self::new();
        handle.finish();
        handle
    }

    /// Installs a callback interrupting the task while it waits, for example by aborting it or
    /// unparking its thread.
    pub(crate) fn set_waker(&self, waker: impl FnOnce() + Send + 'static) {
        let mut slot = lock(&self.inner.waker);
        if self.is_cancelled() {
            drop(slot);
            waker();
        } else {
            *slot = Some(Box::new(waker));
        }
    }

    pub(crate) fn finish(&self) {
        self.inner.finished.store(true, Ordering::SeqCst);
        lock(&self.inner.waker).take();
    }

    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }

        let waker = lock(&self.inner.waker).take();
        if let Some(waker) = waker {
            waker();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.inner.finished.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("cancelled", &self.is_cancelled())
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Process-wide scheduler used when no other one was given.
///
/// Lazily builds a [`PoolScheduler`] from the default [`Config`]. If no runtime can be built we
/// fall back to dedicated threads.
pub fn default_scheduler() -> SchedulerRef {
    static DEFAULT: OnceLock<SchedulerRef> = OnceLock::new();

    DEFAULT
        .get_or_init(|| {
            let config = Config::default();
            match PoolScheduler::from_config(&config) {
                Ok(pool) => Arc::new(pool),
                Err(err) => {
                    warn!("falling back to thread scheduler: {err}");
                    Arc::new(ThreadScheduler::from_config(&config))
                }
            }
        })
        .clone()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    use super::{TaskHandle, default_scheduler};

    #[test]
    fn waker_runs_once_on_cancel() {
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = TaskHandle::new();

        let counter_clone = counter.clone();
        handle.set_waker(move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });

        handle.cancel();
        handle.cancel();
        assert!(handle.is_cancelled());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn waker_after_cancel_runs_immediately() {
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = TaskHandle::new();
        handle.cancel();

        let counter_clone = counter.clone();
        handle.set_waker(move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn default_scheduler_is_shared() {
        let scheduler = default_scheduler();
        assert!(Arc::ptr_eq(&scheduler, &default_scheduler()));

        let (tx, rx) = mpsc::channel();
        scheduler
            .schedule(
                Duration::from_millis(5),
                Box::new(move || {
                    tx.send(()).unwrap();
                }),
            )
            .unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }
}
