// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::Error;
use crate::event::{Event, Observer};
use crate::subscription::{Subscription, TeardownKey};
use crate::utils::lock;

/// Producer-side emitter of one subscription.
///
/// Producing logic pushes events into the subscriber from whatever execution context it runs on.
/// The subscriber serialises the observer callbacks behind a single lock and guarantees the
/// channel contract: no event after cancellation, at most one terminal event and nothing after
/// it. After the terminal event was delivered the subscription is cancelled to release all
/// producer resources.
pub struct Subscriber<T> {
    inner: Arc<SubscriberInner<T>>,
}

struct SubscriberInner<T> {
    observer: Mutex<Box<dyn Observer<T>>>,
    terminated: AtomicBool,
    subscription: Subscription,
}

impl<T> Clone for Subscriber<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> Subscriber<T> {
    pub(crate) fn new<O>(observer: O, subscription: Subscription) -> Self
    where
        O: Observer<T>,
    {
        Self {
            inner: Arc::new(SubscriberInner {
                observer: Mutex::new(Box::new(observer)),
                terminated: AtomicBool::new(false),
                subscription,
            }),
        }
    }

    /// Delivers a value, returns `false` if the subscriber does not accept events anymore.
    pub fn next(&self, value: T) -> bool {
        if self.is_closed() {
            return false;
        }

        let mut observer = lock(&self.inner.observer);
        // Re-check, cancellation or termination might have happened while waiting for the lock.
        if self.is_closed() {
            return false;
        }
        observer.on_next(value);
        true
    }

    pub fn error(&self, error: Error) {
        self.terminate(Event::Error(error));
    }

    pub fn complete(&self) {
        self.terminate(Event::Complete);
    }

    pub fn emit(&self, event: Event<T>) -> bool {
        match event {
            Event::Next(value) => self.next(value),
            terminal => {
                self.terminate(terminal);
                false
            }
        }
    }

    fn terminate(&self, event: Event<T>) {
        if self.is_closed() {
            return;
        }

        {
            let mut observer = lock(&self.inner.observer);
            if self.inner.terminated.swap(true, Ordering::SeqCst) || self.is_cancelled() {
                return;
            }
            observer.on_event(event);
        }

        self.inner.subscription.cancel();
    }

    /// Returns `true` after a terminal event or cancellation.
    pub fn is_closed(&self) -> bool {
        self.inner.terminated.load(Ordering::SeqCst) || self.is_cancelled()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.subscription.is_cancelled()
    }

    pub fn subscription(&self) -> &Subscription {
        &self.inner.subscription
    }

    /// Registers work to run when the subscription is cancelled or terminates.
    pub fn add_teardown(&self, teardown: impl FnOnce() + Send + 'static) -> TeardownKey {
        self.inner.subscription.add_teardown(teardown)
    }
}

impl<T: Send + 'static> Observer<T> for Subscriber<T> {
    fn on_next(&mut self, value: T) {
        self.next(value);
    }

    fn on_error(&mut self, error: Error) {
        self.error(error);
    }

    fn on_complete(&mut self) {
        self.complete();
    }
}

impl<T> fmt::Debug for Subscriber<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("terminated", &self.inner.terminated.load(Ordering::SeqCst))
            .field("subscription", &self.inner.subscription)
            .finish()
    }
}
