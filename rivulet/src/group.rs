// SPDX-License-Identifier: MIT OR Apache-2.0

//! Partitioning a channel into keyed sub-channels.
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::Error;
use crate::channel::Channel;
use crate::config::{BackpressurePolicy, Config};
use crate::event::{Event, from_fn};
use crate::operator::Operator;
use crate::subscriber::Subscriber;
use crate::subscription::TeardownKey;
use crate::unicast::Unicast;

/// Sub-channel carrying all events of the parent classified with the same key.
pub struct GroupedChannel<K, T> {
    key: K,
    channel: Channel<T>,
}

impl<K, T> GroupedChannel<K, T> {
    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn channel(&self) -> Channel<T> {
        self.channel.clone()
    }

    pub fn into_parts(self) -> (K, Channel<T>) {
        (self.key, self.channel)
    }
}

impl<K: Clone, T> Clone for GroupedChannel<K, T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            channel: self.channel.clone(),
        }
    }
}

impl<K: fmt::Debug, T> fmt::Debug for GroupedChannel<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupedChannel")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

type Classifier<K, T> = dyn Fn(&T) -> Result<K, Error> + Send + Sync;

/// Emits one [`GroupedChannel`] per distinct key returned by the classifier.
///
/// A group is created lazily with the first event of its key and stays open until the parent
/// terminates. Groups complete in the order they were created, an error reaches every open group
/// before the outer channel. If the consumer of a group cancels, the group is removed and the
/// next event with that key opens a fresh one.
pub struct GroupBy<K, T> {
    classifier: Arc<Classifier<K, T>>,
    policy: BackpressurePolicy,
}

impl<K, T> GroupBy<K, T> {
    pub fn new<F>(classifier: F) -> Self
    where
        F: Fn(&T) -> Result<K, Error> + Send + Sync + 'static,
    {
        Self::with_policy(classifier, BackpressurePolicy::default())
    }

    /// Grouping with the inner backpressure policy configured in `config`.
    pub fn with_config<F>(classifier: F, config: &Config) -> Self
    where
        F: Fn(&T) -> Result<K, Error> + Send + Sync + 'static,
    {
        Self::with_policy(classifier, config.inner_backpressure)
    }

    pub fn with_policy<F>(classifier: F, policy: BackpressurePolicy) -> Self
    where
        F: Fn(&T) -> Result<K, Error> + Send + Sync + 'static,
    {
        Self {
            classifier: Arc::new(classifier),
            policy,
        }
    }
}

struct Group<T> {
    channel: Unicast<T>,
    closer: TeardownKey,
    created: u64,
}

struct Groups<K, T> {
    groups: HashMap<K, Group<T>>,
    created: u64,
    policy: BackpressurePolicy,
}

impl<K, T> Groups<K, T>
where
    K: Hash + Eq + Clone + Send + 'static,
    T: Send + 'static,
{
    fn push(&mut self, key: K, value: T, downstream: &Subscriber<GroupedChannel<K, T>>) {
        if self
            .groups
            .get(&key)
            .is_some_and(|group| group.channel.is_consumer_cancelled())
        {
            if let Some(group) = self.groups.remove(&key) {
                downstream.subscription().remove(group.closer);
                trace!(created = group.created, "group consumer cancelled, removing group");
            }
        }

        if !self.groups.contains_key(&key) {
            let channel = Unicast::new(self.policy);
            let closer = downstream.subscription().add(channel.closer());
            let created = self.created;
            self.created += 1;

            self.groups.insert(
                key.clone(),
                Group {
                    channel: channel.clone(),
                    closer,
                    created,
                },
            );

            debug!(created, open = self.groups.len(), "group created");
            downstream.next(GroupedChannel {
                key: key.clone(),
                channel: channel.channel(),
            });
        }

        if let Some(group) = self.groups.get(&key) {
            group.channel.push(value);
        }
    }

    /// Terminates all groups in creation order.
    fn terminate(
        &mut self,
        result: &Result<(), Error>,
        downstream: &Subscriber<GroupedChannel<K, T>>,
    ) {
        let mut groups: Vec<Group<T>> = self.groups.drain().map(|(_, group)| group).collect();
        groups.sort_by_key(|group| group.created);

        for group in groups {
            match result {
                Ok(()) => group.channel.complete(),
                Err(err) => group.channel.error(err.clone()),
            }
            downstream.subscription().remove(group.closer);
        }
    }
}

impl<K, T> Operator<T> for GroupBy<K, T>
where
    K: Hash + Eq + Clone + Send + 'static,
    T: Send + 'static,
{
    type Output = GroupedChannel<K, T>;

    fn apply(&self, input: Channel<T>) -> Channel<GroupedChannel<K, T>> {
        let classifier = self.classifier.clone();
        let policy = self.policy;

        input.lift(move |downstream: Subscriber<GroupedChannel<K, T>>| {
            let classifier = classifier.clone();
            let mut groups = Groups {
                groups: HashMap::new(),
                created: 0,
                policy,
            };

            from_fn(move |event: Event<T>| match event {
                Event::Next(value) => match classifier(&value) {
                    Ok(key) => groups.push(key, value, &downstream),
                    Err(err) => {
                        debug!("classifier failed: {err}");
                        let result = Err(err);
                        groups.terminate(&result, &downstream);
                        if let Err(err) = result {
                            downstream.error(err);
                        }
                    }
                },
                Event::Error(err) => {
                    let result = Err(err);
                    groups.terminate(&result, &downstream);
                    if let Err(err) = result {
                        downstream.error(err);
                    }
                }
                Event::Complete => {
                    groups.terminate(&Ok(()), &downstream);
                    downstream.complete();
                }
            })
        })
    }
}

impl<T: Send + 'static> Channel<T> {
    /// Partitions this channel by the key `classifier` returns, see [`GroupBy`].
    pub fn group_by<K, F>(self, classifier: F) -> Channel<GroupedChannel<K, T>>
    where
        K: Hash + Eq + Clone + Send + 'static,
        F: Fn(&T) -> K + Send + Sync + 'static,
    {
        self.apply(GroupBy::new(move |value: &T| Ok(classifier(value))))
    }

    /// Partitions this channel with a classifier which might fail. A failure terminates the
    /// outer channel and all open groups with the returned error.
    pub fn try_group_by<K, F>(self, classifier: F) -> Channel<GroupedChannel<K, T>>
    where
        K: Hash + Eq + Clone + Send + 'static,
        F: Fn(&T) -> Result<K, Error> + Send + Sync + 'static,
    {
        self.apply(GroupBy::new(classifier))
    }

    pub fn group_by_with<K, F>(
        self,
        classifier: F,
        policy: BackpressurePolicy,
    ) -> Channel<GroupedChannel<K, T>>
    where
        K: Hash + Eq + Clone + Send + 'static,
        F: Fn(&T) -> K + Send + Sync + 'static,
    {
        self.apply(GroupBy::with_policy(
            move |value: &T| Ok(classifier(value)),
            policy,
        ))
    }
}
