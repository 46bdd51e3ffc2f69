// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration for schedulers and operators.
//!
//! Operators take their parameters explicitly, the values here are what the plain constructors
//! (`flat_map_unbounded`, `group_by`, `window_timed`, ..) and the default scheduler fall back to.
use std::thread;

use serde::{Deserialize, Serialize};

/// Default maximum number of concurrently subscribed derived channels of a flat-map.
pub const DEFAULT_MAX_CONCURRENCY: usize = 256;

/// Default number of events an inner window or group channel retains until it is subscribed.
pub const DEFAULT_INNER_BUFFER_CAPACITY: usize = 256;

/// Policy for events reaching an inner window or group channel which has no subscriber yet.
///
/// Terminal events are always retained and replayed to a late subscriber.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Keep up to `capacity` events and replay them on subscription, events beyond are dropped.
    Buffer { capacity: usize },

    /// Drop every event arriving before the subscription.
    Drop,
}

impl Default for BackpressurePolicy {
    fn default() -> Self {
        BackpressurePolicy::Buffer {
            capacity: DEFAULT_INNER_BUFFER_CAPACITY,
        }
    }
}

/// Configuration parameters of the engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum number of concurrently active derived channels of an unbounded flat-map.
    pub max_concurrency: usize,

    /// Policy for inner window and group channels which are not subscribed yet.
    pub inner_backpressure: BackpressurePolicy,

    /// Number of worker threads of a pool scheduler.
    pub pool_workers: usize,

    /// Name given to threads spawned by schedulers.
    pub thread_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            inner_backpressure: BackpressurePolicy::default(),
            pool_workers: thread::available_parallelism()
                .map(|workers| workers.get())
                .unwrap_or(2),
            thread_name: "rivulet-worker".into(),
        }
    }
}
