// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt::Display;
use std::time::Duration;

use thiserror::Error;

/// Terminal failure signalled on a channel.
///
/// Errors are cloned whenever one upstream failure needs to reach several downstream channels, for
/// example every open window or group.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum Error {
    /// Source logic failed, for example a simulated remote call.
    #[error("producer failed: {0}")]
    Producer(String),

    /// Execution context was not able to run the work of a channel.
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// Grouping function could not classify an event.
    #[error("classifier failed: {0}")]
    Classifier(String),

    /// Flat-map function could not derive a channel from an event.
    #[error("mapper failed: {0}")]
    Mapper(String),

    /// Inner window or group channels accept only one subscriber.
    #[error("channel allows only a single subscriber")]
    AlreadySubscribed,

    /// Monitored channel did not signal before the timer fired.
    #[error("no signal within {0:?}")]
    Timeout(Duration),

    /// Producer dropped its subscriber without signalling a terminal event.
    #[error("channel dropped without terminal event")]
    Dropped,
}

impl Error {
    pub fn producer(cause: impl Display) -> Self {
        Self::Producer(cause.to_string())
    }

    pub fn classifier(cause: impl Display) -> Self {
        Self::Classifier(cause.to_string())
    }

    pub fn mapper(cause: impl Display) -> Self {
        Self::Mapper(cause.to_string())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum SchedulerError {
    /// Scheduler was shut down and does not accept any more work.
    #[error("scheduler has been shut down")]
    Shutdown,

    /// Operating system refused to give us a thread or runtime.
    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    /// Scheduler runs work inline and can't wait for a delay.
    #[error("scheduler is not capable of time-based scheduling")]
    TimeNotSupported,
}
