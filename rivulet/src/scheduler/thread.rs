// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::SchedulerError;
use crate::config::Config;
use crate::scheduler::{MIN_PERIOD, PeriodicTask, Scheduler, Task, TaskHandle};

/// Runs every task on its own, dedicated thread.
#[derive(Debug)]
pub struct ThreadScheduler {
    thread_name: String,
    shutdown: Arc<AtomicBool>,
}

impl ThreadScheduler {
    pub fn new(thread_name: impl Into<String>) -> Self {
        Self {
            thread_name: thread_name.into(),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.thread_name.clone())
    }

    /// Stops accepting work. Pending tasks which did not run yet are dropped.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn spawn<F>(&self, handle: &TaskHandle, f: F) -> Result<(), SchedulerError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_shutdown() {
            return Err(SchedulerError::Shutdown);
        }

        let thread: JoinHandle<()> = thread::Builder::new()
            .name(self.thread_name.clone())
            .spawn(f)
            .map_err(|err| SchedulerError::Spawn(err.to_string()))?;

        let unparker = thread.thread().clone();
        handle.set_waker(move || unparker.unpark());

        Ok(())
    }
}

impl Default for ThreadScheduler {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Parks the current thread until `deadline`, returns `false` if the task got cancelled or the
/// scheduler shut down in the meantime.
fn wait_until(deadline: Instant, handle: &TaskHandle, shutdown: &AtomicBool) -> bool {
    loop {
        if handle.is_cancelled() || shutdown.load(Ordering::SeqCst) {
            return false;
        }

        let now = Instant::now();
        if now >= deadline {
            return true;
        }

        thread::park_timeout(deadline - now);
    }
}

impl Scheduler for ThreadScheduler {
    fn schedule(&self, delay: Duration, task: Task) -> Result<TaskHandle, SchedulerError> {
        let handle = TaskHandle::new();
        let task_handle = handle.clone();
        let shutdown = self.shutdown.clone();
        let deadline = Instant::now() + delay;

        self.spawn(&handle, move || {
            if wait_until(deadline, &task_handle, &shutdown) {
                task();
            } else {
                trace!("dropping cancelled task");
            }
            task_handle.finish();
        })?;

        Ok(handle)
    }

    fn schedule_periodic(
        &self,
        initial: Duration,
        period: Duration,
        task: PeriodicTask,
    ) -> Result<TaskHandle, SchedulerError> {
        let handle = TaskHandle::new();
        let task_handle = handle.clone();
        let shutdown = self.shutdown.clone();
        let period = period.max(MIN_PERIOD);
        let mut deadline = Instant::now() + initial;

        self.spawn(&handle, move || {
            while wait_until(deadline, &task_handle, &shutdown) {
                task();
                deadline += period;
            }
            task_handle.finish();
        })?;

        Ok(handle)
    }

    fn name(&self) -> &str {
        &self.thread_name
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use crate::SchedulerError;
    use crate::scheduler::Scheduler;

    use super::ThreadScheduler;

    #[test]
    fn runs_on_dedicated_thread() {
        let scheduler = ThreadScheduler::new("test-worker");
        let (tx, rx) = std::sync::mpsc::channel();

        scheduler
            .schedule(
                Duration::from_millis(5),
                Box::new(move || {
                    let name = thread::current().name().map(|name| name.to_string());
                    tx.send(name).unwrap();
                }),
            )
            .unwrap();

        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("test-worker"));
    }

    #[test]
    fn cancelled_task_never_runs() {
        let scheduler = ThreadScheduler::new("test-worker");
        let counter = Arc::new(AtomicUsize::new(0));

        let counter_clone = counter.clone();
        let handle = scheduler
            .schedule(
                Duration::from_millis(200),
                Box::new(move || {
                    counter_clone.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        handle.cancel();

        thread::sleep(Duration::from_millis(300));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn periodic_until_cancelled() {
        let scheduler = ThreadScheduler::new("test-worker");
        let counter = Arc::new(AtomicUsize::new(0));

        let counter_clone = counter.clone();
        let handle = scheduler
            .schedule_periodic(
                Duration::ZERO,
                Duration::from_millis(10),
                Arc::new(move || {
                    counter_clone.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        thread::sleep(Duration::from_millis(100));
        handle.cancel();
        thread::sleep(Duration::from_millis(50));
        let runs = counter.load(Ordering::SeqCst);
        assert!(runs > 0);

        thread::sleep(Duration::from_millis(100));
        assert_eq!(counter.load(Ordering::SeqCst), runs);
    }

    #[test]
    fn rejects_work_after_shutdown() {
        let scheduler = ThreadScheduler::new("test-worker");
        scheduler.shutdown();

        let result = scheduler.schedule(Duration::ZERO, Box::new(|| ()));
        assert_eq!(result.unwrap_err(), SchedulerError::Shutdown);
    }

    #[test]
    fn shutdown_drops_pending_tasks() {
        let scheduler = ThreadScheduler::new("test-worker");
        let counter = Arc::new(AtomicUsize::new(0));

        let counter_clone = counter.clone();
        let delayed = scheduler
            .schedule(
                Duration::from_millis(100),
                Box::new(move || {
                    counter_clone.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        let counter_clone = counter.clone();
        let periodic = scheduler
            .schedule_periodic(
                Duration::from_millis(100),
                Duration::from_millis(10),
                Arc::new(move || {
                    counter_clone.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        scheduler.shutdown();

        // Waiting threads only notice the shutdown when they wake up at their deadline.
        thread::sleep(Duration::from_millis(300));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(delayed.is_finished());
        assert!(periodic.is_finished());
    }
}
