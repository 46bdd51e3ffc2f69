// SPDX-License-Identifier: MIT OR Apache-2.0

//! Helpers for testing channels and operators.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::{Error, SchedulerError};
use crate::channel::Channel;
use crate::config::BackpressurePolicy;
use crate::event::{Event, Observer};
use crate::scheduler::{PeriodicTask, Scheduler, SchedulerRef, Task, TaskHandle};
use crate::unicast::Unicast;
use crate::utils::lock;

/// Initialises `tracing` output when `RUST_LOG` is set.
pub fn setup_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }
}

/// Observer keeping every event it receives, clones share the same log.
pub struct Recorder<T> {
    events: Arc<Mutex<Vec<Event<T>>>>,
}

impl<T> Recorder<T> {
    pub fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<T> Default for Recorder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Recorder<T> {
    fn clone(&self) -> Self {
        Self {
            events: self.events.clone(),
        }
    }
}

impl<T: Clone> Recorder<T> {
    pub fn events(&self) -> Vec<Event<T>> {
        lock(&self.events).clone()
    }

    pub fn values(&self) -> Vec<T> {
        lock(&self.events)
            .iter()
            .filter_map(|event| match event {
                Event::Next(value) => Some(value.clone()),
                _ => None,
            })
            .collect()
    }
}

impl<T> Recorder<T> {
    pub fn is_terminated(&self) -> bool {
        lock(&self.events).iter().any(Event::is_terminal)
    }
}

impl<T: Send + 'static> Observer<T> for Recorder<T> {
    fn on_next(&mut self, value: T) {
        lock(&self.events).push(Event::Next(value));
    }

    fn on_error(&mut self, error: Error) {
        lock(&self.events).push(Event::Error(error));
    }

    fn on_complete(&mut self) {
        lock(&self.events).push(Event::Complete);
    }
}

/// Sending half of a channel driven by hand, see [`manual`].
pub struct ManualSender<T> {
    inner: Unicast<T>,
}

impl<T: Send + 'static> ManualSender<T> {
    pub fn next(&self, value: T) -> bool {
        self.inner.push(value)
    }

    pub fn error(&self, error: Error) {
        self.inner.error(error);
    }

    pub fn complete(&self) {
        self.inner.complete();
    }
}

/// Channel which emits whatever is sent through the returned sender.
///
/// Only one subscriber is accepted, events sent before it subscribed are buffered.
pub fn manual<T: Send + 'static>() -> (ManualSender<T>, Channel<T>) {
    let inner = Unicast::new(BackpressurePolicy::default());
    let channel = inner.channel();
    (ManualSender { inner }, channel)
}

/// Scheduler remembering the handles of all work scheduled through it.
pub struct TrackingScheduler {
    inner: SchedulerRef,
    handles: Mutex<Vec<TaskHandle>>,
}

impl TrackingScheduler {
    pub fn new(inner: SchedulerRef) -> Arc<Self> {
        Arc::new(Self {
            inner,
            handles: Mutex::new(Vec::new()),
        })
    }

    pub fn handles(&self) -> Vec<TaskHandle> {
        lock(&self.handles).clone()
    }

    fn track(
        &self,
        result: Result<TaskHandle, SchedulerError>,
    ) -> Result<TaskHandle, SchedulerError> {
        if let Ok(handle) = &result {
            lock(&self.handles).push(handle.clone());
        }
        result
    }
}

impl Scheduler for TrackingScheduler {
    fn schedule(&self, delay: Duration, task: Task) -> Result<TaskHandle, SchedulerError> {
        self.track(self.inner.schedule(delay, task))
    }

    fn schedule_periodic(
        &self,
        initial: Duration,
        period: Duration,
        task: PeriodicTask,
    ) -> Result<TaskHandle, SchedulerError> {
        self.track(self.inner.schedule_periodic(initial, period, task))
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

/// Simulates a remote call answering with one event per character of `color`.
///
/// The first event arrives right away and the following ones every `period`, the channel
/// completes one `period` after the last event. The color "pink" is rejected with an error.
pub fn remote_operation(
    color: &'static str,
    period: Duration,
    scheduler: SchedulerRef,
) -> Channel<String> {
    Channel::create(move |subscriber| {
        let emitted = AtomicUsize::new(0);
        let target = subscriber.clone();
        let task: PeriodicTask = Arc::new(move || {
            if color == "pink" {
                target.error(Error::producer("Pink is not allowed"));
                return;
            }

            let index = emitted.fetch_add(1, Ordering::SeqCst);
            if index < color.len() {
                target.next(format!("{color}{index}"));
            } else {
                target.complete();
            }
        });

        match scheduler.schedule_periodic(Duration::ZERO, period, task) {
            Ok(handle) => {
                subscriber.add_teardown(move || handle.cancel());
            }
            Err(err) => subscriber.error(err.into()),
        }
    })
}
