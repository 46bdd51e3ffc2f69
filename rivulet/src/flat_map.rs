// SPDX-License-Identifier: MIT OR Apache-2.0

//! Mapping every event to an inner channel and merging the inner channels.
//!
//! At most `max_concurrency` inner channels are subscribed at the same time, further events wait
//! in a queue in arrival order and are mapped and subscribed as soon as an active inner channel
//! completes. Events of different inner channels can interleave, with a concurrency of one they
//! appear strictly in the order of the events they were mapped from.
//!
//! The merged channel completes after the parent and all inner channels completed. The first
//! error of the parent, any inner channel or the mapper terminates it, cancelling everything
//! still active.
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

use crate::Error;
use crate::channel::Channel;
use crate::config::{Config, DEFAULT_MAX_CONCURRENCY};
use crate::event::{Event, Observer};
use crate::operator::Operator;
use crate::subscriber::Subscriber;
use crate::subscription::{Subscription, TeardownKey};
use crate::utils::lock;

type Mapper<T, U> = dyn Fn(T) -> Result<Channel<U>, Error> + Send + Sync;

/// Concurrency-bounded flat map, see the [module documentation](self).
pub struct FlatMap<T, U> {
    mapper: Arc<Mapper<T, U>>,
    max_concurrency: usize,
}

impl<T, U> FlatMap<T, U> {
    /// A `max_concurrency` of zero is treated as one.
    pub fn new<F>(mapper: F, max_concurrency: usize) -> Self
    where
        F: Fn(T) -> Channel<U> + Send + Sync + 'static,
    {
        Self::try_new(move |value| Ok(mapper(value)), max_concurrency)
    }

    /// Flat map with a mapper which might fail, a failure terminates the merged channel.
    pub fn try_new<F>(mapper: F, max_concurrency: usize) -> Self
    where
        F: Fn(T) -> Result<Channel<U>, Error> + Send + Sync + 'static,
    {
        Self {
            mapper: Arc::new(mapper),
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Flat map limited to the concurrency configured in `config`.
    pub fn with_config<F>(mapper: F, config: &Config) -> Self
    where
        F: Fn(T) -> Channel<U> + Send + Sync + 'static,
    {
        Self::new(mapper, config.max_concurrency)
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }
}

impl<T, U> Operator<T> for FlatMap<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    type Output = U;

    fn apply(&self, input: Channel<T>) -> Channel<U> {
        let mapper = self.mapper.clone();
        let max_concurrency = self.max_concurrency;

        input.lift(move |downstream: Subscriber<U>| OuterObserver {
            merge: Arc::new(Merge {
                state: Mutex::new(MergeState {
                    queue: VecDeque::new(),
                    active: 0,
                    upstream_done: false,
                    done: false,
                    draining: false,
                }),
                mapper: mapper.clone(),
                max_concurrency,
                downstream,
            }),
        })
    }
}

struct MergeState<T> {
    /// Events waiting for a free slot.
    queue: VecDeque<T>,
    active: usize,
    upstream_done: bool,
    done: bool,
    /// Set while one thread subscribes queued events, others only update the state.
    draining: bool,
}

struct Merge<T, U> {
    state: Mutex<MergeState<T>>,
    mapper: Arc<Mapper<T, U>>,
    max_concurrency: usize,
    downstream: Subscriber<U>,
}

enum Step<T> {
    Subscribe(T),
    Complete,
    Idle,
}

impl<T, U> Merge<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    fn push(self: &Arc<Self>, value: T) {
        {
            let mut state = lock(&self.state);
            if state.done {
                return;
            }
            state.queue.push_back(value);
        }
        self.drain();
    }

    fn upstream_complete(self: &Arc<Self>) {
        lock(&self.state).upstream_done = true;
        self.drain();
    }

    fn inner_complete(self: &Arc<Self>, key: TeardownKey) {
        lock(&self.state).active -= 1;
        self.downstream.subscription().remove(key);
        self.drain();
    }

    fn fail(&self, error: Error) {
        {
            let mut state = lock(&self.state);
            if state.done {
                return;
            }
            state.done = true;
            state.queue.clear();
        }

        debug!("flat map failed: {error}");
        self.downstream.error(error);
    }

    /// Subscribes queued events while slots are free and completes once everything is done.
    ///
    /// Inner channels are subscribed without holding the state lock, they might emit and
    /// complete synchronously. Re-entrant calls only mark the state as changed through the
    /// `draining` flag and leave the work to the running loop.
    fn drain(self: &Arc<Self>) {
        {
            let mut state = lock(&self.state);
            if state.draining {
                return;
            }
            state.draining = true;
        }

        loop {
            let step = {
                let mut state = lock(&self.state);
                if state.done || self.downstream.is_closed() {
                    state.queue.clear();
                    state.draining = false;
                    return;
                }

                if state.active < self.max_concurrency
                    && let Some(value) = state.queue.pop_front()
                {
                    state.active += 1;
                    Step::Subscribe(value)
                } else if state.active == 0 && state.queue.is_empty() && state.upstream_done {
                    state.done = true;
                    state.draining = false;
                    Step::Complete
                } else {
                    state.draining = false;
                    Step::Idle
                }
            };

            match step {
                Step::Subscribe(value) => self.subscribe_inner(value),
                Step::Complete => {
                    self.downstream.complete();
                    return;
                }
                Step::Idle => return,
            }
        }
    }

    fn subscribe_inner(self: &Arc<Self>, value: T) {
        let channel = match (self.mapper)(value) {
            Ok(channel) => channel,
            Err(err) => {
                self.fail(err);
                return;
            }
        };

        // Register first, the inner channel might complete while subscribing.
        let subscription = Subscription::new();
        let key = self.downstream.subscription().add(subscription.clone());
        trace!(max_concurrency = self.max_concurrency, "subscribing inner channel");

        channel.subscribe_with(
            InnerObserver {
                merge: self.clone(),
                key,
            },
            subscription,
        );
    }
}

struct OuterObserver<T, U> {
    merge: Arc<Merge<T, U>>,
}

impl<T, U> Observer<T> for OuterObserver<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    fn on_next(&mut self, value: T) {
        self.merge.push(value);
    }

    fn on_error(&mut self, error: Error) {
        self.merge.fail(error);
    }

    fn on_complete(&mut self) {
        self.merge.upstream_complete();
    }
}

struct InnerObserver<T, U> {
    merge: Arc<Merge<T, U>>,
    key: TeardownKey,
}

impl<T, U> Observer<U> for InnerObserver<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    fn on_next(&mut self, value: U) {
        self.merge.downstream.next(value);
    }

    fn on_error(&mut self, error: Error) {
        self.merge.fail(error);
    }

    fn on_complete(&mut self) {
        self.merge.inner_complete(self.key);
    }
}

impl<T: Send + 'static> Channel<T> {
    /// Maps every event to a channel and merges at most `max_concurrency` of them at a time,
    /// see [`FlatMap`].
    pub fn flat_map<U, F>(self, mapper: F, max_concurrency: usize) -> Channel<U>
    where
        U: Send + 'static,
        F: Fn(T) -> Channel<U> + Send + Sync + 'static,
    {
        self.apply(FlatMap::new(mapper, max_concurrency))
    }

    pub fn try_flat_map<U, F>(self, mapper: F, max_concurrency: usize) -> Channel<U>
    where
        U: Send + 'static,
        F: Fn(T) -> Result<Channel<U>, Error> + Send + Sync + 'static,
    {
        self.apply(FlatMap::try_new(mapper, max_concurrency))
    }

    /// Flat map with the default concurrency of [`DEFAULT_MAX_CONCURRENCY`].
    pub fn flat_map_unbounded<U, F>(self, mapper: F) -> Channel<U>
    where
        U: Send + 'static,
        F: Fn(T) -> Channel<U> + Send + Sync + 'static,
    {
        self.flat_map(mapper, DEFAULT_MAX_CONCURRENCY)
    }

    /// Flat map subscribing one inner channel at a time, preserving the order of the parent.
    pub fn concat_map<U, F>(self, mapper: F) -> Channel<U>
    where
        U: Send + 'static,
        F: Fn(T) -> Channel<U> + Send + Sync + 'static,
    {
        self.flat_map(mapper, 1)
    }

    /// Maps the values and the terminal event of this channel to channels and merges them.
    ///
    /// An error of this channel is handed to `on_error` instead of terminating the result, the
    /// result completes after the channel returned by the terminal mapper completed.
    pub fn flat_map_signals<U, N, E, C>(
        self,
        on_next: N,
        on_error: E,
        on_complete: C,
    ) -> Channel<U>
    where
        U: Send + 'static,
        N: Fn(T) -> Channel<U> + Send + Sync + 'static,
        E: Fn(Error) -> Channel<U> + Send + Sync + 'static,
        C: Fn() -> Channel<U> + Send + Sync + 'static,
    {
        self.materialize().flat_map_unbounded(move |event| match event {
            Event::Next(value) => on_next(value),
            Event::Error(err) => on_error(err),
            Event::Complete => on_complete(),
        })
    }
}
