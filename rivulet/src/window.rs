// SPDX-License-Identifier: MIT OR Apache-2.0

//! Slicing a channel into batches and windows.
//!
//! Count-based operators consume every event exactly once: after `size` events the current batch
//! or window is closed and the next one opens with the following event.
//!
//! Time-based windows open every `timeshift` and close `timespan` after they opened:
//!
//! - `timeshift < timespan`: windows overlap and an event is delivered to every open window, so
//!   it shows up in up to `ceil(timespan / timeshift)` windows.
//! - `timeshift > timespan`: there are gaps where no window is open, events arriving in a gap
//!   are dropped.
//! - `timeshift == timespan`: windows tile the channel, one closes the moment the next opens.
//!
//! When the parent channel terminates, all open windows receive the terminal event in the order
//! they opened before the outer channel terminates as well.
use std::collections::VecDeque;
use std::mem;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, trace};

use crate::Error;
use crate::channel::Channel;
use crate::config::BackpressurePolicy;
use crate::event::{Event, Observer, from_fn};
use crate::operator::Operator;
use crate::scheduler::{MIN_PERIOD, PeriodicTask, SchedulerRef};
use crate::subscriber::Subscriber;
use crate::subscription::TeardownKey;
use crate::unicast::Unicast;
use crate::utils::lock;

/// Emits lists of `size` consecutive events, the last one possibly shorter.
#[derive(Clone, Copy, Debug)]
pub struct Buffer {
    size: usize,
}

impl Buffer {
    /// A size of zero is treated as one.
    pub fn new(size: usize) -> Self {
        Self { size: size.max(1) }
    }
}

impl<T: Send + 'static> Operator<T> for Buffer {
    type Output = Vec<T>;

    fn apply(&self, input: Channel<T>) -> Channel<Vec<T>> {
        let size = self.size;
        input.lift(move |downstream: Subscriber<Vec<T>>| {
            let mut batch = Vec::with_capacity(size);
            from_fn(move |event: Event<T>| match event {
                Event::Next(value) => {
                    batch.push(value);
                    if batch.len() == size {
                        downstream.next(mem::replace(&mut batch, Vec::with_capacity(size)));
                    }
                }
                Event::Error(err) => downstream.error(err),
                Event::Complete => {
                    if !batch.is_empty() {
                        downstream.next(mem::take(&mut batch));
                    }
                    downstream.complete();
                }
            })
        })
    }
}

/// Splits a channel into windows of `size` consecutive events.
///
/// A window also closes when its consumer cancels, the next event then opens a fresh window.
/// With an unbounded size windows are delimited by consumer cancellation alone.
#[derive(Clone, Copy, Debug)]
pub struct Window {
    size: usize,
    policy: BackpressurePolicy,
}

impl Window {
    /// A size of zero is treated as one.
    pub fn new(size: usize) -> Self {
        Self::with_policy(size, BackpressurePolicy::default())
    }

    pub fn with_policy(size: usize, policy: BackpressurePolicy) -> Self {
        Self {
            size: size.max(1),
            policy,
        }
    }
}

impl<T: Send + 'static> Operator<T> for Window {
    type Output = Channel<T>;

    fn apply(&self, input: Channel<T>) -> Channel<Channel<T>> {
        let size = self.size;
        let policy = self.policy;

        input.lift(move |downstream: Subscriber<Channel<T>>| {
            let mut current: Option<(Unicast<T>, TeardownKey)> = None;
            let mut count = 0;
            let mut index: u64 = 0;

            from_fn(move |event: Event<T>| match event {
                Event::Next(value) => {
                    if let Some((window, key)) = &current
                        && window.is_consumer_cancelled()
                    {
                        downstream.subscription().remove(*key);
                        trace!(index, "window consumer cancelled, opening next window");
                        current = None;
                        count = 0;
                    }

                    let (window, key) = current.get_or_insert_with(|| {
                        let window = Unicast::new(policy);
                        let key = downstream.subscription().add(window.closer());
                        debug!(index, "window opened");
                        downstream.next(window.channel());
                        index += 1;
                        (window, key)
                    });

                    window.push(value);
                    count += 1;

                    if count == size {
                        window.complete();
                        downstream.subscription().remove(*key);
                        trace!("window closed after {size} events");
                        current = None;
                        count = 0;
                    }
                }
                Event::Error(err) => {
                    if let Some((window, key)) = current.take() {
                        window.error(err.clone());
                        downstream.subscription().remove(key);
                    }
                    downstream.error(err);
                }
                Event::Complete => {
                    if let Some((window, key)) = current.take() {
                        window.complete();
                        downstream.subscription().remove(key);
                    }
                    downstream.complete();
                }
            })
        })
    }
}

/// Splits a channel into windows opening every `timeshift` and lasting `timespan`.
#[derive(Clone)]
pub struct TimedWindow {
    timespan: Duration,
    timeshift: Duration,
    scheduler: SchedulerRef,
    policy: BackpressurePolicy,
}

impl TimedWindow {
    /// Durations shorter than [`MIN_PERIOD`] are raised to it.
    pub fn new(timespan: Duration, timeshift: Duration, scheduler: SchedulerRef) -> Self {
        Self::with_policy(timespan, timeshift, scheduler, BackpressurePolicy::default())
    }

    pub fn with_policy(
        timespan: Duration,
        timeshift: Duration,
        scheduler: SchedulerRef,
        policy: BackpressurePolicy,
    ) -> Self {
        if timespan < MIN_PERIOD || timeshift < MIN_PERIOD {
            debug!(?timespan, ?timeshift, "raising window durations to {MIN_PERIOD:?}");
        }

        Self {
            timespan: timespan.max(MIN_PERIOD),
            timeshift: timeshift.max(MIN_PERIOD),
            scheduler,
            policy,
        }
    }
}

impl<T: Clone + Send + 'static> Operator<T> for TimedWindow {
    type Output = Channel<T>;

    fn apply(&self, input: Channel<T>) -> Channel<Channel<T>> {
        let config = self.clone();

        Channel::create(move |downstream: Subscriber<Channel<T>>| {
            let windows = Arc::new(TimedWindows {
                state: Mutex::new(TimedState {
                    open: VecDeque::new(),
                    next_index: 0,
                    done: false,
                    dropped: 0,
                }),
                downstream: downstream.clone(),
                config: config.clone(),
            });

            let tiling = config.timespan == config.timeshift;

            // The first window opens with the subscription.
            if let Some(index) = windows.open() {
                if !tiling {
                    windows.schedule_close(index);
                }
            }

            let opener = windows.clone();
            let task: PeriodicTask = if tiling {
                Arc::new(move || opener.rotate())
            } else {
                Arc::new(move || {
                    if let Some(index) = opener.open() {
                        opener.schedule_close(index);
                    }
                })
            };

            match config
                .scheduler
                .schedule_periodic(config.timeshift, config.timeshift, task)
            {
                Ok(handle) => {
                    downstream.add_teardown(move || handle.cancel());
                }
                Err(err) => {
                    windows.terminate(Err(err.into()));
                    return;
                }
            }

            input.subscribe_for(&downstream, TimedWindowObserver { windows });
        })
    }
}

struct OpenWindow<T> {
    index: u64,
    window: Unicast<T>,
    key: TeardownKey,
}

struct TimedState<T> {
    open: VecDeque<OpenWindow<T>>,
    next_index: u64,
    done: bool,
    dropped: u64,
}

struct TimedWindows<T> {
    state: Mutex<TimedState<T>>,
    downstream: Subscriber<Channel<T>>,
    config: TimedWindow,
}

impl<T: Clone + Send + 'static> TimedWindows<T> {
    fn open(&self) -> Option<u64> {
        let mut state = lock(&self.state);
        self.open_locked(&mut state)
    }

    fn open_locked(&self, state: &mut TimedState<T>) -> Option<u64> {
        if state.done || self.downstream.is_closed() {
            return None;
        }

        let index = state.next_index;
        state.next_index += 1;

        let window = Unicast::new(self.config.policy);
        let key = self.downstream.subscription().add(window.closer());
        state.open.push_back(OpenWindow {
            index,
            window: window.clone(),
            key,
        });

        debug!(index, "window opened");
        self.downstream.next(window.channel());
        Some(index)
    }

    fn close(&self, index: u64) {
        let mut state = lock(&self.state);
        if let Some(position) = state.open.iter().position(|open| open.index == index) {
            if let Some(open) = state.open.remove(position) {
                self.finish(open, &Ok(()));
            }
        }
    }

    /// Closes all open windows and opens the next one in one step.
    fn rotate(&self) {
        let mut state = lock(&self.state);
        for open in mem::take(&mut state.open) {
            self.finish(open, &Ok(()));
        }
        self.open_locked(&mut state);
    }

    fn finish(&self, open: OpenWindow<T>, result: &Result<(), Error>) {
        match result {
            Ok(()) => open.window.complete(),
            Err(err) => open.window.error(err.clone()),
        }
        self.downstream.subscription().remove(open.key);
        debug!(index = open.index, "window closed");
    }

    fn schedule_close(self: &Arc<Self>, index: u64) {
        let windows = self.clone();
        let result = self
            .config
            .scheduler
            .schedule(self.config.timespan, Box::new(move || windows.close(index)));

        match result {
            Ok(handle) => {
                let state = lock(&self.state);
                match state.open.iter().find(|open| open.index == index) {
                    Some(open) => {
                        // Abandoning the window stops its timer as well.
                        open.window.closer().add_teardown(move || handle.cancel());
                    }
                    None => handle.cancel(),
                }
            }
            Err(err) => self.terminate(Err(err.into())),
        }
    }

    fn next(&self, value: T) {
        let mut state = lock(&self.state);
        if state.open.is_empty() {
            state.dropped += 1;
            trace!(dropped = state.dropped, "no window open, dropping event");
            return;
        }

        for open in &state.open {
            open.window.push(value.clone());
        }
    }

    fn terminate(&self, result: Result<(), Error>) {
        let mut state = lock(&self.state);
        if state.done {
            return;
        }
        state.done = true;

        for open in mem::take(&mut state.open) {
            self.finish(open, &result);
        }

        match result {
            Ok(()) => self.downstream.complete(),
            Err(err) => self.downstream.error(err),
        }
    }
}

struct TimedWindowObserver<T> {
    windows: Arc<TimedWindows<T>>,
}

impl<T: Clone + Send + 'static> Observer<T> for TimedWindowObserver<T> {
    fn on_next(&mut self, value: T) {
        self.windows.next(value);
    }

    fn on_error(&mut self, error: Error) {
        self.windows.terminate(Err(error));
    }

    fn on_complete(&mut self) {
        self.windows.terminate(Ok(()));
    }
}

impl<T: Send + 'static> Channel<T> {
    /// Emits lists of `size` consecutive events, see [`Buffer`].
    pub fn buffer(self, size: usize) -> Channel<Vec<T>> {
        self.apply(Buffer::new(size))
    }

    /// Splits into windows of `size` consecutive events, see [`Window`].
    pub fn window(self, size: usize) -> Channel<Channel<T>> {
        self.apply(Window::new(size))
    }

    pub fn window_with(self, size: usize, policy: BackpressurePolicy) -> Channel<Channel<T>> {
        self.apply(Window::with_policy(size, policy))
    }

    /// Splits into windows which are only delimited by their consumer cancelling.
    ///
    /// The first event opens a window, every event after the window's consumer cancelled opens
    /// the next one.
    pub fn window_until_cancelled(self) -> Channel<Channel<T>> {
        self.apply(Window::new(usize::MAX))
    }
}

impl<T: Clone + Send + 'static> Channel<T> {
    /// Splits into windows opening every `timeshift` and lasting `timespan`, see
    /// [`TimedWindow`].
    pub fn window_timed(
        self,
        timespan: Duration,
        timeshift: Duration,
        scheduler: SchedulerRef,
    ) -> Channel<Channel<T>> {
        self.apply(TimedWindow::new(timespan, timeshift, scheduler))
    }

    pub fn window_timed_with(
        self,
        timespan: Duration,
        timeshift: Duration,
        scheduler: SchedulerRef,
        policy: BackpressurePolicy,
    ) -> Channel<Channel<T>> {
        self.apply(TimedWindow::with_policy(timespan, timeshift, scheduler, policy))
    }

    /// Emits the events of every time window as one list once the window closed.
    pub fn buffer_timed(
        self,
        timespan: Duration,
        timeshift: Duration,
        scheduler: SchedulerRef,
    ) -> Channel<Vec<T>> {
        self.window_timed(timespan, timeshift, scheduler)
            .flat_map_unbounded(|window| window.collect_list())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::runtime::Handle;
    use tokio::time;

    use crate::Error;
    use crate::channel::Channel;
    use crate::event::Event;
    use crate::scheduler::{PoolScheduler, SchedulerRef};
    use crate::test_utils::{Recorder, TrackingScheduler};

    fn pool() -> SchedulerRef {
        Arc::new(PoolScheduler::from_handle(Handle::current()))
    }

    /// Numbers 0, 1, 2, .. emitted at 5ms, 15ms, 25ms, .. so they never coincide with window
    /// boundaries on multiples of 10ms.
    fn ticks(scheduler: SchedulerRef) -> Channel<u64> {
        Channel::interval_with_delay(ms(5), ms(10), scheduler)
    }

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    #[tokio::test]
    async fn buffer_batches() {
        for size in 1..6 {
            for len in 0..12 {
                let batches = Channel::range(0, len).buffer(size).collect().await.unwrap();
                assert_eq!(batches.len(), (len as usize).div_ceil(size));
                assert!(batches.iter().all(|batch| batch.len() <= size));
                assert_eq!(
                    batches.concat(),
                    (0..len).collect::<Vec<u64>>(),
                    "size {size}, len {len}"
                );
            }
        }
    }

    #[tokio::test]
    async fn buffer_forwards_error() {
        let result = Channel::<u64>::error(Error::producer("boom"))
            .buffer(2)
            .collect()
            .await;
        assert_eq!(result, Err(Error::Producer("boom".into())));
    }

    #[tokio::test]
    async fn count_windows() {
        let opened = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicUsize::new(0));

        let result = {
            let opened = opened.clone();
            let completed = completed.clone();
            Channel::range(1, 7)
                .window(3)
                .concat_map(move |window| {
                    let opened = opened.clone();
                    let completed = completed.clone();
                    window
                        .do_on_subscribe(move || {
                            opened.fetch_add(1, Ordering::SeqCst);
                        })
                        .do_on_complete(move || {
                            completed.fetch_add(1, Ordering::SeqCst);
                        })
                        .collect_list()
                })
                .collect()
                .await
        };

        assert_eq!(result, Ok(vec![vec![1, 2, 3], vec![4, 5, 6], vec![7]]));
        assert_eq!(opened.load(Ordering::SeqCst), 3);
        assert_eq!(completed.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn late_window_subscription_is_buffered() {
        // Subscribe to the windows only after the parent completed.
        let windows = Channel::range(0, 5).window(2).collect().await.unwrap();
        assert_eq!(windows.len(), 3);

        let mut lists = Vec::new();
        for window in windows {
            lists.push(window.collect().await.unwrap());
        }
        assert_eq!(lists, vec![vec![0, 1], vec![2, 3], vec![4]]);
    }

    #[tokio::test]
    async fn cancelled_window_reopens() {
        let result = Channel::range(0, 10)
            .window(4)
            .concat_map(|window| window.take(2).collect_list())
            .collect()
            .await;

        assert_eq!(
            result,
            Ok(vec![vec![0, 1], vec![2, 3], vec![4, 5], vec![6, 7], vec![8, 9]])
        );
    }

    #[tokio::test]
    async fn windows_delimited_by_cancellation() {
        let windows = Recorder::new();
        let (tx, source) = crate::test_utils::manual::<u64>();

        let subscription = source
            .window_until_cancelled()
            .do_on_next({
                let windows = windows.clone();
                move |window| {
                    window.clone().take(1).subscribe(windows.clone());
                }
            })
            .subscribe(Recorder::new());

        tx.next(1);
        tx.next(2);
        tx.next(3);
        tx.complete();

        assert!(subscription.is_cancelled());
        assert_eq!(
            windows.events(),
            vec![
                Event::Next(1),
                Event::Complete,
                Event::Next(2),
                Event::Complete,
                Event::Next(3),
                Event::Complete,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn gaps_lose_events() {
        let result = ticks(pool())
            .window_timed(ms(40), ms(100), pool())
            .flat_map_unbounded(|window| window.collect_list())
            .take(3)
            .collect()
            .await;

        assert_eq!(
            result,
            Ok(vec![vec![0, 1, 2, 3], vec![10, 11, 12, 13], vec![20, 21, 22, 23]])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn overlaps_duplicate_events() {
        let result = ticks(pool())
            .buffer_timed(ms(30), ms(10), pool())
            .take(4)
            .collect()
            .await
            .unwrap();

        assert_eq!(
            result,
            vec![vec![0, 1, 2], vec![1, 2, 3], vec![2, 3, 4], vec![3, 4, 5]]
        );

        // Once enough windows are open, every event is in ceil(30 / 10) windows.
        for value in 2..4 {
            let windows = result.iter().filter(|list| list.contains(&value)).count();
            assert_eq!(windows, 3);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn equal_span_and_shift_tile() {
        let result = ticks(pool())
            .buffer_timed(ms(20), ms(20), pool())
            .take(3)
            .collect()
            .await;

        assert_eq!(result, Ok(vec![vec![0, 1], vec![2, 3], vec![4, 5]]));
    }

    #[tokio::test(start_paused = true)]
    async fn parent_completion_closes_windows_in_order() {
        let result = ticks(pool())
            .take(3)
            .buffer_timed(ms(30), ms(10), pool())
            .collect()
            .await;

        assert_eq!(result, Ok(vec![vec![0, 1, 2], vec![1, 2], vec![2]]));
    }

    #[tokio::test(start_paused = true)]
    async fn parent_error_reaches_open_windows() {
        let windows = Recorder::new();
        let result = ticks(pool())
            .take(2)
            .concat_map(|_| Channel::<u64>::error(Error::producer("boom")))
            .window_timed(ms(30), ms(10), pool())
            .do_on_next({
                let windows = windows.clone();
                move |window| {
                    window.subscribe(windows.clone());
                }
            })
            .collect()
            .await;

        assert!(matches!(result, Err(Error::Producer(_))));
        assert_eq!(
            windows.events(),
            vec![Event::Error(Error::Producer("boom".into()))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_window_timers() {
        let scheduler = TrackingScheduler::new(pool());
        let recorder = Recorder::new();

        let subscription = ticks(scheduler.clone())
            .window_timed(ms(30), ms(10), scheduler.clone())
            .flat_map_unbounded(|window| window)
            .subscribe(recorder.clone());

        time::sleep(ms(35)).await;
        subscription.cancel();
        let seen = recorder.events().len();
        assert!(seen > 0);

        time::sleep(Duration::from_secs(1)).await;
        assert_eq!(recorder.events().len(), seen);
        assert!(
            scheduler
                .handles()
                .iter()
                .all(|handle| handle.is_cancelled() || handle.is_finished())
        );
        assert!(scheduler.handles().iter().any(|handle| handle.is_cancelled()));
    }
}
