// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tracing::{trace, warn};

use crate::Error;
use crate::channel::Channel;
use crate::config::BackpressurePolicy;
use crate::subscriber::Subscriber;
use crate::subscription::Subscription;
use crate::utils::lock;

/// Hot inner channel fed by an operator and consumed by at most one subscriber.
///
/// Windows and groups are handed downstream as soon as they open, but their consumer might
/// subscribe later (or never). Events arriving in the meantime are handled according to the
/// [`BackpressurePolicy`], the terminal event is always kept and replayed.
pub(crate) struct Unicast<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Unicast<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

struct Shared<T> {
    state: Mutex<State<T>>,
    policy: BackpressurePolicy,
    /// Cancelled when the producing operator abandons this channel.
    closer: Subscription,
}

struct State<T> {
    buffer: VecDeque<T>,
    terminal: Option<Result<(), Error>>,
    subscriber: Option<Subscriber<T>>,
    subscribed: bool,
    dropped: u64,
}

impl<T: Send + 'static> Unicast<T> {
    pub fn new(policy: BackpressurePolicy) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    buffer: VecDeque::new(),
                    terminal: None,
                    subscriber: None,
                    subscribed: false,
                    dropped: 0,
                }),
                policy,
                closer: Subscription::new(),
            }),
        }
    }

    /// Channel view handed to the consumer.
    pub fn channel(&self) -> Channel<T> {
        let shared = self.shared.clone();
        Channel::create(move |subscriber| shared.attach(subscriber))
    }

    /// Delivers or retains a value. Returns `false` if nobody will ever see it.
    pub fn push(&self, value: T) -> bool {
        if self.shared.closer.is_cancelled() {
            return false;
        }

        let mut state = lock(&self.shared.state);
        if state.terminal.is_some() {
            return false;
        }

        if let Some(subscriber) = &state.subscriber {
            return subscriber.next(value);
        }

        match self.shared.policy {
            BackpressurePolicy::Buffer { capacity } if state.buffer.len() < capacity => {
                state.buffer.push_back(value);
                true
            }
            BackpressurePolicy::Buffer { capacity } => {
                state.dropped += 1;
                warn!(
                    capacity,
                    dropped = state.dropped,
                    "inner buffer full, dropping event"
                );
                false
            }
            BackpressurePolicy::Drop => {
                state.dropped += 1;
                trace!(dropped = state.dropped, "no subscriber yet, dropping event");
                false
            }
        }
    }

    pub fn complete(&self) {
        self.terminate(Ok(()));
    }

    pub fn error(&self, error: Error) {
        self.terminate(Err(error));
    }

    fn terminate(&self, result: Result<(), Error>) {
        let mut state = lock(&self.shared.state);
        if state.terminal.is_some() {
            return;
        }

        match state.subscriber.take() {
            Some(subscriber) => {
                state.terminal = Some(Ok(()));
                match result {
                    Ok(()) => subscriber.complete(),
                    Err(err) => subscriber.error(err),
                }
            }
            None => state.terminal = Some(result),
        }
    }

    /// Subscription cancelling this channel, to be linked with the producing operator.
    ///
    /// Cancelling it stops all delivery, a subscribed consumer is cancelled as well.
    pub fn closer(&self) -> Subscription {
        self.shared.closer.clone()
    }

    /// Returns `true` if a consumer subscribed and cancelled since.
    pub fn is_consumer_cancelled(&self) -> bool {
        lock(&self.shared.state)
            .subscriber
            .as_ref()
            .is_some_and(|subscriber| subscriber.is_cancelled())
    }
}

impl<T: Send + 'static> Shared<T> {
    fn attach(&self, subscriber: Subscriber<T>) {
        let mut state = lock(&self.state);
        if state.subscribed {
            drop(state);
            subscriber.error(Error::AlreadySubscribed);
            return;
        }
        state.subscribed = true;
        self.closer.add(subscriber.subscription().clone());

        while let Some(value) = state.buffer.pop_front() {
            if !subscriber.next(value) {
                state.buffer.clear();
                break;
            }
        }

        match state.terminal.clone() {
            Some(Ok(())) => subscriber.complete(),
            Some(Err(err)) => subscriber.error(err),
            None => state.subscriber = Some(subscriber),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::Error;
    use crate::config::BackpressurePolicy;
    use crate::event::Event;
    use crate::test_utils::Recorder;

    use super::Unicast;

    #[test]
    fn replays_buffer_to_late_subscriber() {
        let unicast = Unicast::new(BackpressurePolicy::Buffer { capacity: 2 });
        assert!(unicast.push(1));
        assert!(unicast.push(2));
        assert!(!unicast.push(3));

        let recorder = Recorder::new();
        unicast.channel().subscribe(recorder.clone());
        assert!(unicast.push(4));
        unicast.complete();

        assert_eq!(
            recorder.events(),
            vec![Event::Next(1), Event::Next(2), Event::Next(4), Event::Complete]
        );
    }

    #[test]
    fn drop_policy_discards_early_events() {
        let unicast = Unicast::new(BackpressurePolicy::Drop);
        assert!(!unicast.push(1));
        unicast.error(Error::producer("failed"));

        let recorder = Recorder::new();
        unicast.channel().subscribe(recorder.clone());
        assert_eq!(
            recorder.events(),
            vec![Event::Error(Error::Producer("failed".into()))]
        );
    }

    #[test]
    fn single_subscriber_only() {
        let unicast = Unicast::<u32>::new(BackpressurePolicy::default());
        let first = Recorder::new();
        let second = Recorder::new();
        unicast.channel().subscribe(first.clone());
        unicast.channel().subscribe(second.clone());

        assert!(first.events().is_empty());
        assert_eq!(second.events(), vec![Event::Error(Error::AlreadySubscribed)]);
    }

    #[test]
    fn closer_cancels_consumer() {
        let unicast = Unicast::new(BackpressurePolicy::default());
        let recorder = Recorder::new();
        let subscription = unicast.channel().subscribe(recorder.clone());
        unicast.push(1);

        unicast.closer().cancel();
        assert!(subscription.is_cancelled());
        assert!(!unicast.push(2));
        unicast.complete();
        assert_eq!(recorder.events(), vec![Event::Next(1)]);
    }

    #[test]
    fn notices_cancelled_consumer() {
        let unicast = Unicast::<u32>::new(BackpressurePolicy::default());
        let recorder = Recorder::new();
        let subscription = unicast.channel().subscribe(recorder);
        assert!(!unicast.is_consumer_cancelled());

        subscription.cancel();
        assert!(unicast.is_consumer_cancelled());
        assert!(!unicast.push(1));
    }
}
