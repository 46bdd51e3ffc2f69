// SPDX-License-Identifier: MIT OR Apache-2.0

#![cfg_attr(doctest, doc=include_str!("../README.md"))]

//! Push-based reactive channels with windowing, grouping and concurrency-bounded flat maps.
//!
//! A [`Channel`] is a cold description of an event source: nothing happens until it is
//! subscribed, and every subscription runs the producing logic anew. Subscribers receive any
//! number of values followed by at most one terminal event, see [`Event`]. Operators derive new
//! channels from existing ones and can be composed and reused through the [`Operator`] trait.
//!
//! Where work runs is decided by a [`Scheduler`](scheduler::Scheduler): inline, on a dedicated
//! thread or on a tokio runtime. Timers of interval sources and time-based windows are scheduled
//! the same way, so a tokio runtime with a paused clock makes them fully deterministic.
//!
//! Cancelling a [`Subscription`] stops all producers, timers and inner channels which were
//! started on its behalf.
mod channel;
mod config;
mod error;
mod event;
mod flat_map;
mod group;
mod operator;
pub mod scheduler;
mod subscriber;
mod subscription;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;
mod unicast;
mod utils;
mod window;

pub use channel::{Channel, ChannelStream, Collect};
pub use config::{
    BackpressurePolicy, Config, DEFAULT_INNER_BUFFER_CAPACITY, DEFAULT_MAX_CONCURRENCY,
};
pub use error::{Error, SchedulerError};
pub use event::{Event, FnObserver, LogObserver, Observer, from_fn};
pub use flat_map::FlatMap;
pub use group::{GroupBy, GroupedChannel};
pub use operator::{Chain, Operator, OperatorExt};
pub use subscriber::Subscriber;
pub use subscription::{Subscription, TeardownKey};
pub use window::{Buffer, TimedWindow, Window};
