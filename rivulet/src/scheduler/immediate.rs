// SPDX-License-Identifier: MIT OR Apache-2.0

use std::time::Duration;

use crate::SchedulerError;
use crate::scheduler::{PeriodicTask, Scheduler, Task, TaskHandle};

/// Runs every task inline on the calling thread.
///
/// Waiting is not possible without blocking the caller, so any task with a delay and all
/// periodic tasks are rejected with [`SchedulerError::TimeNotSupported`].
#[derive(Clone, Copy, Debug, Default)]
pub struct ImmediateScheduler;

impl ImmediateScheduler {
    pub fn new() -> Self {
        Self
    }
}

impl Scheduler for ImmediateScheduler {
    fn schedule(&self, delay: Duration, task: Task) -> Result<TaskHandle, SchedulerError> {
        if !delay.is_zero() {
            return Err(SchedulerError::TimeNotSupported);
        }

        task();
        Ok(TaskHandle::finished())
    }

    fn schedule_periodic(
        &self,
        _initial: Duration,
        _period: Duration,
        _task: PeriodicTask,
    ) -> Result<TaskHandle, SchedulerError> {
        Err(SchedulerError::TimeNotSupported)
    }

    fn name(&self) -> &str {
        "immediate"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use crate::SchedulerError;
    use crate::scheduler::Scheduler;

    use super::ImmediateScheduler;

    #[test]
    fn runs_inline() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = ran.clone();

        let handle = ImmediateScheduler
            .schedule(
                Duration::ZERO,
                Box::new(move || ran_clone.store(true, Ordering::SeqCst)),
            )
            .unwrap();

        assert!(ran.load(Ordering::SeqCst));
        assert!(handle.is_finished());
    }

    #[test]
    fn rejects_timed_work() {
        let result = ImmediateScheduler.schedule(Duration::from_millis(10), Box::new(|| ()));
        assert_eq!(result.unwrap_err(), SchedulerError::TimeNotSupported);

        let result = ImmediateScheduler.schedule_periodic(
            Duration::ZERO,
            Duration::from_millis(10),
            Arc::new(|| ()),
        );
        assert_eq!(result.unwrap_err(), SchedulerError::TimeNotSupported);
    }
}
