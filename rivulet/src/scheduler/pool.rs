// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::debug;

use crate::SchedulerError;
use crate::config::Config;
use crate::scheduler::{MIN_PERIOD, PeriodicTask, Scheduler, Task, TaskHandle};
use crate::utils::lock;

/// Runs tasks on the worker pool of a tokio runtime.
///
/// The scheduler either owns its runtime (see [`PoolScheduler::new`]) or borrows one through a
/// [`Handle`]. Timers are tokio timers, so a runtime with a paused clock drives delayed and
/// periodic work deterministically.
pub struct PoolScheduler {
    name: String,
    handle: Handle,
    runtime: Mutex<Option<Runtime>>,
    shutdown: Arc<AtomicBool>,
}

impl PoolScheduler {
    /// Builds a multi-threaded runtime with the given number of workers.
    pub fn new(workers: usize, thread_name: impl Into<String>) -> Result<Self, SchedulerError> {
        let name = thread_name.into();
        let runtime = Builder::new_multi_thread()
            .worker_threads(workers.max(1))
            .thread_name(name.clone())
            .enable_time()
            .build()
            .map_err(|err| SchedulerError::Spawn(err.to_string()))?;

        debug!(workers, name = %name, "pool scheduler started");

        Ok(Self {
            name,
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, SchedulerError> {
        Self::new(config.pool_workers, config.thread_name.clone())
    }

    /// Schedules work on an existing runtime.
    ///
    /// The runtime needs the time driver enabled for delayed or periodic work.
    pub fn from_handle(handle: Handle) -> Self {
        Self {
            name: "pool".into(),
            handle,
            runtime: Mutex::new(None),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Stops accepting work and drops all pending tasks.
    ///
    /// An owned runtime is shut down in the background, tasks which are currently running are
    /// not interrupted.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(runtime) = lock(&self.runtime).take() {
            runtime.shutdown_background();
        }

        debug!(name = %self.name, "pool scheduler shut down");
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    fn check_available(&self) -> Result<(), SchedulerError> {
        if self.is_shutdown() {
            Err(SchedulerError::Shutdown)
        } else {
            Ok(())
        }
    }
}

impl Scheduler for PoolScheduler {
    fn schedule(&self, delay: Duration, task: Task) -> Result<TaskHandle, SchedulerError> {
        self.check_available()?;

        let handle = TaskHandle::new();
        let task_handle = handle.clone();
        let shutdown = self.shutdown.clone();

        let join = self.handle.spawn(async move {
            if !delay.is_zero() {
                time::sleep(delay).await;
            }

            if !task_handle.is_cancelled() && !shutdown.load(Ordering::SeqCst) {
                task();
            }
            task_handle.finish();
        });

        let abort = join.abort_handle();
        handle.set_waker(move || abort.abort());

        Ok(handle)
    }

    fn schedule_periodic(
        &self,
        initial: Duration,
        period: Duration,
        task: PeriodicTask,
    ) -> Result<TaskHandle, SchedulerError> {
        self.check_available()?;

        let handle = TaskHandle::new();
        let task_handle = handle.clone();
        let shutdown = self.shutdown.clone();
        let period = period.max(MIN_PERIOD);

        let join = self.handle.spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + initial, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if task_handle.is_cancelled() || shutdown.load(Ordering::SeqCst) {
                    break;
                }
                task();
            }
            task_handle.finish();
        });

        let abort = join.abort_handle();
        handle.set_waker(move || abort.abort());

        Ok(handle)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for PoolScheduler {
    fn drop(&mut self) {
        // Dropping a runtime blocks, which is not allowed from inside an async context. Shutting
        // down in the background is.
        if let Some(runtime) = lock(&self.runtime).take() {
            runtime.shutdown_background();
        }
    }
}

impl fmt::Debug for PoolScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolScheduler")
            .field("name", &self.name)
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::runtime::Handle;
    use tokio::sync::oneshot;
    use tokio::time;

    use crate::SchedulerError;
    use crate::channel::Channel;
    use crate::scheduler::Scheduler;
    use crate::test_utils::Recorder;

    use super::PoolScheduler;

    #[tokio::test(start_paused = true)]
    async fn delayed_task() {
        let scheduler = PoolScheduler::from_handle(Handle::current());
        let (tx, rx) = oneshot::channel();

        let started = time::Instant::now();
        scheduler
            .schedule(
                Duration::from_secs(3),
                Box::new(move || {
                    let _ = tx.send(());
                }),
            )
            .unwrap();

        rx.await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_task_stops_on_cancel() {
        let scheduler = PoolScheduler::from_handle(Handle::current());
        let counter = Arc::new(AtomicUsize::new(0));

        let counter_clone = counter.clone();
        let handle = scheduler
            .schedule_periodic(
                Duration::from_millis(10),
                Duration::from_millis(10),
                Arc::new(move || {
                    counter_clone.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        // Ticks at 10, 20, 30, 40 and 50ms.
        time::sleep(Duration::from_millis(55)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 5);

        handle.cancel();
        time::sleep(Duration::from_secs(1)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn owned_runtime_shutdown() {
        let scheduler = PoolScheduler::new(1, "test-pool").unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        let counter_clone = counter.clone();
        scheduler
            .schedule(
                Duration::from_secs(60),
                Box::new(move || {
                    counter_clone.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        scheduler.shutdown();
        assert!(scheduler.is_shutdown());
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        let result = scheduler.schedule(Duration::ZERO, Box::new(|| ()));
        assert_eq!(result.unwrap_err(), SchedulerError::Shutdown);
    }

    #[test]
    fn owned_runtime_drops_pending_tasks() {
        let scheduler = PoolScheduler::new(1, "test-pool").unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        let counter_clone = counter.clone();
        scheduler
            .schedule(
                Duration::from_millis(50),
                Box::new(move || {
                    counter_clone.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        scheduler.shutdown();
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_drops_pending_tasks() {
        let scheduler = PoolScheduler::from_handle(Handle::current());
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
        time::sleep(Duration::from_millis(300)).await;

        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(delayed.is_finished());
        assert!(periodic.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_silences_interval() {
        let scheduler = Arc::new(PoolScheduler::from_handle(Handle::current()));
        let recorder = Recorder::new();
        let _subscription = Channel::interval(Duration::from_millis(10), scheduler.clone())
            .subscribe(recorder.clone());

        // Ticks at 10, 20 and 30ms.
        time::sleep(Duration::from_millis(35)).await;
        assert_eq!(recorder.values(), vec![0, 1, 2]);

        scheduler.shutdown();
        time::sleep(Duration::from_secs(1)).await;
        assert_eq!(recorder.values(), vec![0, 1, 2]);
        assert!(!recorder.is_terminated());
    }
}
