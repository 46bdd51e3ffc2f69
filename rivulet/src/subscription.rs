// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::utils::lock;

type Teardown = Box<dyn FnOnce() + Send>;

/// Identifies a teardown registered on a [`Subscription`] so it can be removed again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TeardownKey(u64);

/// Handle of an active consumer attachment to a channel.
///
/// Cancelling is idempotent. It flips an atomic flag every emitter checks before delivering, and
/// then runs all registered teardowns (stopping timers, cancelling upstream and derived
/// subscriptions). Teardowns registered after cancellation run immediately.
#[derive(Clone, Default)]
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
}

#[derive(Default)]
struct SubscriptionInner {
    cancelled: AtomicBool,
    next_key: AtomicU64,
    teardowns: Mutex<Vec<(TeardownKey, Teardown)>>,
}

impl Subscription {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }

        // Run teardowns outside of the lock, they might cancel other subscriptions which in turn
        // cancel this one again.
        let teardowns = mem::take(&mut *lock(&self.inner.teardowns));
        for (_, teardown) in teardowns {
            teardown();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Registers work to run on cancellation.
    pub fn add_teardown(&self, teardown: impl FnOnce() + Send + 'static) -> TeardownKey {
        let key = TeardownKey(self.inner.next_key.fetch_add(1, Ordering::Relaxed));

        let mut teardowns = lock(&self.inner.teardowns);
        if self.is_cancelled() {
            drop(teardowns);
            teardown();
        } else {
            teardowns.push((key, Box::new(teardown)));
        }

        key
    }

    /// Cancels `child` together with this subscription.
    pub fn add(&self, child: Subscription) -> TeardownKey {
        self.add_teardown(move || child.cancel())
    }

    /// Forgets a teardown without running it.
    pub fn remove(&self, key: TeardownKey) {
        lock(&self.inner.teardowns).retain(|(k, _)| *k != key);
    }

    #[cfg(test)]
    pub(crate) fn teardown_count(&self) -> usize {
        lock(&self.inner.teardowns).len()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::Subscription;

    #[test]
    fn cancel_is_idempotent() {
        let counter = Arc::new(AtomicUsize::new(0));
        let subscription = Subscription::new();

        let counter_clone = counter.clone();
        subscription.add_teardown(move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });

        subscription.cancel();
        subscription.cancel();
        assert!(subscription.is_cancelled());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn teardown_after_cancel_runs_immediately() {
        let subscription = Subscription::new();
        subscription.cancel();

        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();
        subscription.add_teardown(move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancels_children_transitively() {
        let parent = Subscription::new();
        let child = Subscription::new();
        let grandchild = Subscription::new();
        child.add(grandchild.clone());
        parent.add(child.clone());

        parent.cancel();
        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
    }

    #[test]
    fn removed_teardown_does_not_run() {
        let subscription = Subscription::new();
        let child = Subscription::new();
        let key = subscription.add(child.clone());
        subscription.remove(key);
        assert_eq!(subscription.teardown_count(), 0);

        subscription.cancel();
        assert!(!child.is_cancelled());
    }
}
