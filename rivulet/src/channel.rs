// SPDX-License-Identifier: MIT OR Apache-2.0

//! Push-based, cold channels and the basic transformers between them.
//!
//! A [`Channel`] is a recipe for producing events. Every call to [`Channel::subscribe`] runs the
//! producing logic again for a fresh [`Subscriber`], which might start background work on a
//! [`Scheduler`](crate::scheduler::Scheduler). That work is bound to the returned
//! [`Subscription`] and released on cancellation or after the terminal event.
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_channel::{mpsc, oneshot};
use futures_util::{Stream, ready};
use pin_project::{pin_project, pinned_drop};
use tracing::trace;

use crate::Error;
use crate::event::{Event, Observer, from_fn};
use crate::scheduler::SchedulerRef;
use crate::subscriber::Subscriber;
use crate::subscription::Subscription;
use crate::utils::lock;

type Producer<T> = dyn Fn(Subscriber<T>) + Send + Sync;

/// Ordered, push-based sequence of events with at most one terminal signal.
pub struct Channel<T> {
    producer: Arc<Producer<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            producer: self.producer.clone(),
        }
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel").finish_non_exhaustive()
    }
}

impl<T: Send + 'static> Channel<T> {
    /// Creates a channel from producing logic which is run once per subscription.
    ///
    /// The producer may emit synchronously or hand the subscriber over to other execution
    /// contexts. Background work needs to be registered with [`Subscriber::add_teardown`] so it
    /// is stopped on cancellation.
    pub fn create<F>(producer: F) -> Self
    where
        F: Fn(Subscriber<T>) + Send + Sync + 'static,
    {
        Self {
            producer: Arc::new(producer),
        }
    }

    pub fn subscribe<O>(&self, observer: O) -> Subscription
    where
        O: Observer<T>,
    {
        let subscription = Subscription::new();
        self.subscribe_with(observer, subscription.clone());
        subscription
    }

    pub fn subscribe_fn<F>(&self, f: F) -> Subscription
    where
        F: FnMut(Event<T>) + Send + 'static,
    {
        self.subscribe(from_fn(f))
    }

    /// Subscribes with a subscription created by the caller, letting it register the
    /// subscription before the first event can arrive.
    pub(crate) fn subscribe_with<O>(&self, observer: O, subscription: Subscription)
    where
        O: Observer<T>,
    {
        let subscriber = Subscriber::new(observer, subscription);
        if subscriber.is_closed() {
            return;
        }
        (self.producer)(subscriber);
    }

    /// Subscribes on behalf of `downstream`, the upstream subscription is cancelled together
    /// with it.
    pub(crate) fn subscribe_for<U, O>(
        &self,
        downstream: &Subscriber<U>,
        observer: O,
    ) -> Subscription
    where
        U: Send + 'static,
        O: Observer<T>,
    {
        let upstream = Subscription::new();
        downstream.subscription().add(upstream.clone());
        self.subscribe_with(observer, upstream.clone());
        upstream
    }

    /// Builds a channel which subscribes to this one with an observer derived from the
    /// downstream subscriber.
    pub(crate) fn lift<U, O, F>(self, make_observer: F) -> Channel<U>
    where
        U: Send + 'static,
        O: Observer<T>,
        F: Fn(Subscriber<U>) -> O + Send + Sync + 'static,
    {
        Channel::create(move |downstream: Subscriber<U>| {
            let observer = make_observer(downstream.clone());
            self.subscribe_for(&downstream, observer);
        })
    }

    pub fn empty() -> Self {
        Self::create(|subscriber| subscriber.complete())
    }

    pub fn error(error: Error) -> Self {
        Self::create(move |subscriber| subscriber.error(error.clone()))
    }

    /// Channel which never signals anything.
    pub fn never() -> Self {
        Self::create(|subscriber: Subscriber<T>| {
            // Keep the subscriber alive until the subscription is cancelled.
            let keep = subscriber.clone();
            subscriber.add_teardown(move || drop(keep));
        })
    }

    pub fn from_iter<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = T> + Clone + Send + Sync + 'static,
    {
        Self::create(move |subscriber| {
            for value in iter.clone() {
                if !subscriber.next(value) {
                    return;
                }
            }
            subscriber.complete();
        })
    }

    pub fn just(values: impl IntoIterator<Item = T>) -> Self
    where
        T: Clone + Sync,
    {
        Self::from_iter(values.into_iter().collect::<Vec<T>>())
    }

    pub fn map<U, F>(self, f: F) -> Channel<U>
    where
        U: Send + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.lift(move |downstream: Subscriber<U>| {
            let f = f.clone();
            from_fn(move |event: Event<T>| match event {
                Event::Next(value) => {
                    downstream.next(f(value));
                }
                Event::Error(err) => downstream.error(err),
                Event::Complete => downstream.complete(),
            })
        })
    }

    pub fn filter<F>(self, predicate: F) -> Channel<T>
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let predicate = Arc::new(predicate);
        self.lift(move |downstream: Subscriber<T>| {
            let predicate = predicate.clone();
            from_fn(move |event: Event<T>| match event {
                Event::Next(value) => {
                    if predicate(&value) {
                        downstream.next(value);
                    }
                }
                other => {
                    downstream.emit(other);
                }
            })
        })
    }

    /// Forwards the first `count` events and completes, cancelling upstream.
    pub fn take(self, count: usize) -> Channel<T> {
        Channel::create(move |downstream: Subscriber<T>| {
            if count == 0 {
                downstream.complete();
                return;
            }

            let mut remaining = count;
            let forward = downstream.clone();
            self.subscribe_for(
                &downstream,
                from_fn(move |event: Event<T>| match event {
                    Event::Next(value) => {
                        remaining -= 1;
                        forward.next(value);
                        if remaining == 0 {
                            forward.complete();
                        }
                    }
                    other => {
                        forward.emit(other);
                    }
                }),
            );
        })
    }

    /// Forwards events until one matches `predicate`, that event is the last one before
    /// completion.
    pub fn take_until<F>(self, predicate: F) -> Channel<T>
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let predicate = Arc::new(predicate);
        self.lift(move |downstream: Subscriber<T>| {
            let predicate = predicate.clone();
            from_fn(move |event: Event<T>| match event {
                Event::Next(value) => {
                    let last = predicate(&value);
                    downstream.next(value);
                    if last {
                        downstream.complete();
                    }
                }
                other => {
                    downstream.emit(other);
                }
            })
        })
    }

    /// Emits the number of events once this channel completed.
    pub fn count(self) -> Channel<u64> {
        self.lift(move |downstream: Subscriber<u64>| {
            let mut count = 0;
            from_fn(move |event: Event<T>| match event {
                Event::Next(_) => count += 1,
                Event::Error(err) => downstream.error(err),
                Event::Complete => {
                    downstream.next(count);
                    downstream.complete();
                }
            })
        })
    }

    /// Emits all events as one list once this channel completed.
    pub fn collect_list(self) -> Channel<Vec<T>> {
        self.lift(move |downstream: Subscriber<Vec<T>>| {
            let mut values = Vec::new();
            from_fn(move |event: Event<T>| match event {
                Event::Next(value) => values.push(value),
                Event::Error(err) => downstream.error(err),
                Event::Complete => {
                    downstream.next(mem::take(&mut values));
                    downstream.complete();
                }
            })
        })
    }

    /// Turns every signal, including the terminal one, into a value and completes afterwards.
    pub fn materialize(self) -> Channel<Event<T>> {
        self.lift(move |downstream: Subscriber<Event<T>>| {
            from_fn(move |event: Event<T>| {
                let terminal = event.is_terminal();
                downstream.next(event);
                if terminal {
                    downstream.complete();
                }
            })
        })
    }

    pub fn do_on_next<F>(self, f: F) -> Channel<T>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.lift(move |downstream: Subscriber<T>| {
            let f = f.clone();
            from_fn(move |event: Event<T>| {
                if let Event::Next(value) = &event {
                    f(value);
                }
                downstream.emit(event);
            })
        })
    }

    /// Runs `f` right before subscribing upstream.
    pub fn do_on_subscribe<F>(self, f: F) -> Channel<T>
    where
        F: Fn() + Send + Sync + 'static,
    {
        Channel::create(move |downstream: Subscriber<T>| {
            f();
            self.subscribe_for(&downstream, downstream.clone());
        })
    }

    /// Runs `f` right before the completion is forwarded.
    pub fn do_on_complete<F>(self, f: F) -> Channel<T>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.lift(move |downstream: Subscriber<T>| {
            let f = f.clone();
            from_fn(move |event: Event<T>| {
                if let Event::Complete = event {
                    f();
                }
                downstream.emit(event);
            })
        })
    }

    /// Replaces an error with the channel returned by `handler`.
    pub fn on_error_resume<F>(self, handler: F) -> Channel<T>
    where
        F: Fn(Error) -> Channel<T> + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        self.lift(move |downstream: Subscriber<T>| {
            let handler = handler.clone();
            from_fn(move |event: Event<T>| match event {
                Event::Error(err) => {
                    trace!("resuming after error: {err}");
                    handler(err).subscribe_for(&downstream, downstream.clone());
                }
                other => {
                    downstream.emit(other);
                }
            })
        })
    }

    /// Subscribes upstream from a task on `scheduler`.
    pub fn subscribe_on(self, scheduler: SchedulerRef) -> Channel<T> {
        self.delay_subscription(Duration::ZERO, scheduler)
    }

    /// Subscribes upstream from a task on `scheduler` once `delay` elapsed.
    pub fn delay_subscription(self, delay: Duration, scheduler: SchedulerRef) -> Channel<T> {
        Channel::create(move |downstream: Subscriber<T>| {
            let source = self.clone();
            let target = downstream.clone();
            let result = scheduler.schedule(
                delay,
                Box::new(move || {
                    source.subscribe_for(&target, target.clone());
                }),
            );

            match result {
                Ok(handle) => {
                    downstream.add_teardown(move || handle.cancel());
                }
                Err(err) => downstream.error(err.into()),
            }
        })
    }

    /// Pairs up events of both channels in order. Completes as soon as one side completed and
    /// all of its events were paired.
    pub fn zip_with<U, R, F>(self, other: Channel<U>, combiner: F) -> Channel<R>
    where
        U: Send + 'static,
        R: Send + 'static,
        F: Fn(T, U) -> R + Send + Sync + 'static,
    {
        let combiner = Arc::new(combiner);
        Channel::create(move |downstream: Subscriber<R>| {
            let state = Arc::new(Mutex::new(ZipState::<T, U>::default()));

            let left = {
                let state = state.clone();
                let combiner = combiner.clone();
                let downstream = downstream.clone();
                from_fn(move |event: Event<T>| {
                    let mut state = lock(&state);
                    match event {
                        Event::Next(value) => state.left.push_back(value),
                        Event::Error(err) => return downstream.error(err),
                        Event::Complete => state.left_done = true,
                    }
                    state.drain(&downstream, combiner.as_ref());
                })
            };
            let right = {
                let state = state.clone();
                let combiner = combiner.clone();
                let downstream = downstream.clone();
                from_fn(move |event: Event<U>| {
                    let mut state = lock(&state);
                    match event {
                        Event::Next(value) => state.right.push_back(value),
                        Event::Error(err) => return downstream.error(err),
                        Event::Complete => state.right_done = true,
                    }
                    state.drain(&downstream, combiner.as_ref());
                })
            };

            self.subscribe_for(&downstream, left);
            other.subscribe_for(&downstream, right);
        })
    }

    /// Mirrors whichever channel signals first, all others are cancelled.
    ///
    /// Racing no channels at all completes right away.
    pub fn race(channels: Vec<Channel<T>>) -> Channel<T> {
        Channel::create(move |downstream: Subscriber<T>| {
            if channels.is_empty() {
                trace!("nothing to race");
                downstream.complete();
                return;
            }

            let subscriptions: Arc<Vec<Subscription>> =
                Arc::new(channels.iter().map(|_| Subscription::new()).collect());
            for subscription in subscriptions.iter() {
                downstream.subscription().add(subscription.clone());
            }

            let winner = Arc::new(AtomicUsize::new(NO_WINNER));
            for (index, channel) in channels.iter().enumerate() {
                let current = winner.load(Ordering::SeqCst);
                if downstream.is_closed() || (current != NO_WINNER && current != index) {
                    break;
                }

                let observer = RaceObserver {
                    index,
                    winner: winner.clone(),
                    subscriptions: subscriptions.clone(),
                    downstream: downstream.clone(),
                };
                channel.subscribe_with(observer, subscriptions[index].clone());
            }
        })
    }

    /// Errors with [`Error::Timeout`] unless this channel signals within `duration`.
    pub fn timeout(self, duration: Duration, scheduler: SchedulerRef) -> Channel<T> {
        let timer = Channel::create(move |subscriber: Subscriber<T>| {
            let target = subscriber.clone();
            let result = scheduler.schedule(
                duration,
                Box::new(move || target.error(Error::Timeout(duration))),
            );
            match result {
                Ok(handle) => {
                    subscriber.add_teardown(move || handle.cancel());
                }
                Err(err) => subscriber.error(err.into()),
            }
        });

        Channel::race(vec![self, timer])
    }

    /// Subscribes and resolves with all values once the channel terminated.
    ///
    /// Dropping the future cancels the subscription.
    pub fn collect(&self) -> Collect<T> {
        let (tx, rx) = oneshot::channel();
        let mut tx = Some(tx);
        let mut values = Vec::new();

        let subscription = self.subscribe_fn(move |event| {
            let result = match event {
                Event::Next(value) => {
                    values.push(value);
                    return;
                }
                Event::Error(err) => Err(err),
                Event::Complete => Ok(mem::take(&mut values)),
            };

            if let Some(tx) = tx.take() {
                let _ = tx.send(result);
            }
        });

        Collect { rx, subscription }
    }

    /// Subscribes and exposes the events as a [`Stream`].
    ///
    /// The stream ends after the terminal event, an error is yielded as the last item. Dropping
    /// the stream cancels the subscription.
    pub fn into_stream(&self) -> ChannelStream<T> {
        let (tx, rx) = mpsc::unbounded();
        let subscription = self.subscribe_fn(move |event| {
            let _ = tx.unbounded_send(event);
        });

        ChannelStream {
            rx,
            subscription,
            done: false,
        }
    }
}

impl Channel<u64> {
    /// Emits `count` increasing numbers starting at `start`, stopping short of `u64::MAX`.
    pub fn range(start: u64, count: u64) -> Self {
        Self::from_iter(start..start.saturating_add(count))
    }

    /// Emits increasing numbers starting at zero, one every `period`.
    pub fn interval(period: Duration, scheduler: SchedulerRef) -> Self {
        Self::interval_with_delay(period, period, scheduler)
    }

    /// Emits increasing numbers starting at zero, the first after `initial` and then one every
    /// `period`.
    pub fn interval_with_delay(
        initial: Duration,
        period: Duration,
        scheduler: SchedulerRef,
    ) -> Self {
        Self::create(move |subscriber| {
            let counter = AtomicU64::new(0);
            let target = subscriber.clone();
            let result = scheduler.schedule_periodic(
                initial,
                period,
                Arc::new(move || {
                    target.next(counter.fetch_add(1, Ordering::SeqCst));
                }),
            );

            match result {
                Ok(handle) => {
                    subscriber.add_teardown(move || handle.cancel());
                }
                Err(err) => subscriber.error(err.into()),
            }
        })
    }

    /// Emits `0` after `delay` and completes.
    pub fn timer(delay: Duration, scheduler: SchedulerRef) -> Self {
        Self::create(move |subscriber| {
            let target = subscriber.clone();
            let result = scheduler.schedule(
                delay,
                Box::new(move || {
                    target.next(0);
                    target.complete();
                }),
            );

            match result {
                Ok(handle) => {
                    subscriber.add_teardown(move || handle.cancel());
                }
                Err(err) => subscriber.error(err.into()),
            }
        })
    }
}

struct ZipState<T, U> {
    left: VecDeque<T>,
    right: VecDeque<U>,
    left_done: bool,
    right_done: bool,
}

impl<T, U> Default for ZipState<T, U> {
    fn default() -> Self {
        Self {
            left: VecDeque::new(),
            right: VecDeque::new(),
            left_done: false,
            right_done: false,
        }
    }
}

impl<T, U> ZipState<T, U> {
    fn drain<R, F>(&mut self, downstream: &Subscriber<R>, combiner: &F)
    where
        R: Send + 'static,
        F: Fn(T, U) -> R,
    {
        while !self.left.is_empty() && !self.right.is_empty() {
            if let (Some(left), Some(right)) = (self.left.pop_front(), self.right.pop_front()) {
                downstream.next(combiner(left, right));
            }
        }

        if (self.left_done && self.left.is_empty()) || (self.right_done && self.right.is_empty()) {
            downstream.complete();
        }
    }
}

const NO_WINNER: usize = usize::MAX;

struct RaceObserver<T> {
    index: usize,
    winner: Arc<AtomicUsize>,
    subscriptions: Arc<Vec<Subscription>>,
    downstream: Subscriber<T>,
}

impl<T> RaceObserver<T> {
    /// Returns `true` if this participant won the race, cancelling all others on the first win.
    fn claim(&self) -> bool {
        match self
            .winner
            .compare_exchange(NO_WINNER, self.index, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => {
                for (index, subscription) in self.subscriptions.iter().enumerate() {
                    if index != self.index {
                        subscription.cancel();
                    }
                }
                true
            }
            Err(winner) => winner == self.index,
        }
    }
}

impl<T: Send + 'static> Observer<T> for RaceObserver<T> {
    fn on_next(&mut self, value: T) {
        if self.claim() {
            self.downstream.next(value);
        }
    }

    fn on_error(&mut self, error: Error) {
        if self.claim() {
            self.downstream.error(error);
        }
    }

    fn on_complete(&mut self) {
        if self.claim() {
            self.downstream.complete();
        }
    }
}

/// Future returned by [`Channel::collect`].
#[pin_project(PinnedDrop)]
#[must_use = "futures do nothing unless polled"]
pub struct Collect<T> {
    #[pin]
    rx: oneshot::Receiver<Result<Vec<T>, Error>>,
    subscription: Subscription,
}

impl<T> Future for Collect<T> {
    type Output = Result<Vec<T>, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match ready!(this.rx.poll(cx)) {
            Ok(result) => Poll::Ready(result),
            // Producer dropped its subscriber without ever terminating.
            Err(oneshot::Canceled) => Poll::Ready(Err(Error::Dropped)),
        }
    }
}

#[pinned_drop]
impl<T> PinnedDrop for Collect<T> {
    fn drop(self: Pin<&mut Self>) {
        self.subscription.cancel();
    }
}

/// Stream returned by [`Channel::into_stream`].
#[pin_project(PinnedDrop)]
#[must_use = "streams do nothing unless polled"]
pub struct ChannelStream<T> {
    #[pin]
    rx: mpsc::UnboundedReceiver<Event<T>>,
    subscription: Subscription,
    done: bool,
}

impl<T> ChannelStream<T> {
    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }
}

impl<T> Stream for ChannelStream<T> {
    type Item = Result<T, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        if *this.done {
            return Poll::Ready(None);
        }

        match ready!(this.rx.poll_next(cx)) {
            Some(Event::Next(value)) => Poll::Ready(Some(Ok(value))),
            Some(Event::Error(err)) => {
                *this.done = true;
                Poll::Ready(Some(Err(err)))
            }
            Some(Event::Complete) | None => {
                *this.done = true;
                Poll::Ready(None)
            }
        }
    }
}

#[pinned_drop]
impl<T> PinnedDrop for ChannelStream<T> {
    fn drop(self: Pin<&mut Self>) {
        self.subscription.cancel();
    }
}
