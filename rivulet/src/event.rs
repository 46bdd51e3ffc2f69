// SPDX-License-Identifier: MIT OR Apache-2.0

//! Signals travelling through a channel and the observers receiving them.
use std::fmt::Debug;

use tracing::{error, info};

use crate::Error;

/// One signal of a channel.
///
/// A channel emits any number of `Next` events followed by at most one terminal event (`Error` or
/// `Complete`). Nothing is delivered after the terminal event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event<T> {
    Next(T),
    Error(Error),
    Complete,
}

impl<T> Event<T> {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Event::Next(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Event<U> {
        match self {
            Event::Next(value) => Event::Next(f(value)),
            Event::Error(err) => Event::Error(err),
            Event::Complete => Event::Complete,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            Event::Next(value) => Some(value),
            _ => None,
        }
    }
}

/// Consumer of the events of a channel.
///
/// Callbacks of one subscription are never invoked concurrently, the emitting
/// [`Subscriber`](crate::Subscriber) serialises them.
pub trait Observer<T>: Send + 'static {
    fn on_next(&mut self, value: T);

    fn on_error(&mut self, error: Error);

    fn on_complete(&mut self);

    fn on_event(&mut self, event: Event<T>) {
        match event {
            Event::Next(value) => self.on_next(value),
            Event::Error(err) => self.on_error(err),
            Event::Complete => self.on_complete(),
        }
    }
}

/// Observer handing every event to a closure.
pub struct FnObserver<F> {
    f: F,
}

/// Turns a closure over [`Event`]s into an [`Observer`].
pub fn from_fn<T, F>(f: F) -> FnObserver<F>
where
    F: FnMut(Event<T>) + Send + 'static,
{
    FnObserver { f }
}

impl<T, F> Observer<T> for FnObserver<F>
where
    F: FnMut(Event<T>) + Send + 'static,
{
    fn on_next(&mut self, value: T) {
        (self.f)(Event::Next(value))
    }

    fn on_error(&mut self, error: Error) {
        (self.f)(Event::Error(error))
    }

    fn on_complete(&mut self) {
        (self.f)(Event::Complete)
    }
}

/// Observer writing every event to the logging sink.
#[derive(Clone, Debug)]
pub struct LogObserver {
    label: String,
}

impl LogObserver {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

impl<T: Debug> Observer<T> for LogObserver {
    fn on_next(&mut self, value: T) {
        info!(label = %self.label, "next: {value:?}");
    }

    fn on_error(&mut self, error: Error) {
        error!(label = %self.label, "error: {error}");
    }

    fn on_complete(&mut self) {
        info!(label = %self.label, "complete");
    }
}
