//! Publish/subscribe topics.
//!
//! A topic keeps a bounded history of published messages and copies each new
//! message into the backlog queue of every subscription whose filter accepts
//! it. Subscriptions can also be replayed from the retained history.
//!
//! Fan-out happens under the topic's write lock so each subscription sees
//! messages in publish order. Dead letters produced while offering are stored
//! after the lock is released.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::dead_letter::{DeadLetterEntry, DeadLetterStore};
use crate::broker::message::Message;
use crate::broker::metrics::{CounterSnapshot, Counters};
use crate::broker::queue::{Queue, QueueConfig};
use crate::utils::error::{BrokerError, Result};

pub type SubscriptionId = String;

pub const BACKLOG_FULL: &str = "subscription backlog full";

/// Decides whether a subscription wants a message.
///
/// A filter that returns an error or panics rejects the message for its own
/// subscription only; the publisher and other subscriptions never see the
/// fault.
#[derive(Clone)]
pub struct Filter(Arc<dyn Fn(&Message) -> std::result::Result<bool, String> + Send + Sync>);

impl Filter {
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&Message) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(move |message: &Message| {
            Ok::<bool, String>(predicate(message))
        }))
    }

    pub fn fallible<F, E>(predicate: F) -> Self
    where
        F: Fn(&Message) -> std::result::Result<bool, E> + Send + Sync + 'static,
        E: fmt::Display,
    {
        Self(Arc::new(move |message: &Message| {
            predicate(message).map_err(|e| e.to_string())
        }))
    }

    /// Matches messages carrying `key` with exactly `value`.
    pub fn header_equals(key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        let value = value.into();
        Self::new(move |message| message.header(&key) == Some(value.as_str()))
    }

    fn evaluate(&self, message: &Message) -> std::result::Result<bool, String> {
        match catch_unwind(AssertUnwindSafe(|| (self.0)(message))) {
            Ok(result) => result,
            Err(_) => Err("filter panicked".to_string()),
        }
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Filter(..)")
    }
}

/// How much history a topic keeps for replay. Both bounds apply when set.
#[derive(Debug, Clone, PartialEq)]
pub struct RetentionWindow {
    pub max_messages: Option<usize>,
    pub max_age: Option<Duration>,
}

impl Default for RetentionWindow {
    fn default() -> Self {
        Self {
            max_messages: Some(1000),
            max_age: None,
        }
    }
}

impl RetentionWindow {
    pub fn messages(max_messages: usize) -> Self {
        Self {
            max_messages: Some(max_messages),
            max_age: None,
        }
    }

    pub fn age(max_age: Duration) -> Self {
        Self {
            max_messages: None,
            max_age: Some(max_age),
        }
    }

    fn retains(&self, message: &Message, now: DateTime<Utc>) -> bool {
        match self.max_age {
            Some(max_age) => now
                .signed_duration_since(message.enqueued_at)
                .to_std()
                .map_or(true, |age| age <= max_age),
            None => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TopicConfig {
    pub retention: RetentionWindow,
    /// Backlog, visibility timeout and retry policy of each subscription.
    pub subscription: QueueConfig,
}

impl TopicConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.retention.max_messages == Some(0) {
            return Err("retention max_messages must be at least 1".to_string());
        }
        self.subscription.validate()
    }
}

/// One fan-out branch of a topic.
///
/// Every accepted message is copied into the subscription's own bounded
/// queue, so its retries, dead letters and pace are independent of every
/// other subscription.
pub struct Subscription {
    id: SubscriptionId,
    topic: String,
    filter: Option<Filter>,
    queue: Arc<Queue>,
    /// Topic sequence number of the first message delivered live.
    live_from: u64,
    created_at: DateTime<Utc>,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// The backlog queue consumers lease from.
    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        self.queue.snapshot()
    }

    pub fn accepts(&self, message: &Message) -> bool {
        let Some(filter) = &self.filter else {
            return true;
        };
        match filter.evaluate(message) {
            Ok(accepted) => accepted,
            Err(reason) => {
                warn!(
                    topic = %self.topic,
                    subscription = %self.id,
                    message_id = %message.id,
                    error = %reason,
                    "subscription filter failed, message not delivered"
                );
                false
            }
        }
    }

    /// Enqueues a copy into the backlog. A full backlog dead-letters the copy
    /// for this subscription only. Dead letters go into `failed`; returns
    /// whether the copy was enqueued.
    fn offer(&self, message: Message, now: DateTime<Utc>, failed: &mut Vec<DeadLetterEntry>) -> bool {
        match self.queue.enqueue_deferred(message.clone(), now, failed) {
            Ok(()) => true,
            Err(e) => {
                debug!(subscription = %self.id, error = %e, "subscription backlog rejected message");
                failed.push(self.queue.dead_letter_unqueued(message, BACKLOG_FULL, now));
                false
            }
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("filtered", &self.filter.is_some())
            .field("live_from", &self.live_from)
            .finish()
    }
}

#[derive(Debug)]
struct Retained {
    seq: u64,
    message: Message,
}

#[derive(Debug, Default)]
struct TopicState {
    history: VecDeque<Retained>,
    subscriptions: Vec<Arc<Subscription>>,
    next_seq: u64,
    last_enqueued_at: Option<DateTime<Utc>>,
}

/// Publish/subscribe distribution unit with a bounded replay history.
pub struct Topic {
    name: String,
    config: TopicConfig,
    state: RwLock<TopicState>,
    dead_letters: Arc<DeadLetterStore>,
    counters: Counters,
}

impl Topic {
    pub fn new(name: impl Into<String>, config: TopicConfig, dead_letters: Arc<DeadLetterStore>) -> Self {
        Self {
            name: name.into(),
            config,
            state: RwLock::new(TopicState::default()),
            dead_letters,
            counters: Counters::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &TopicConfig {
        &self.config
    }

    /// Retains the message and copies it to every subscription whose filter
    /// accepts it. Returns how many subscription backlogs took a copy.
    pub fn publish(&self, message: Message) -> usize {
        self.publish_at(message, Utc::now())
    }

    pub(crate) fn publish_at(&self, mut message: Message, now: DateTime<Utc>) -> usize {
        let mut failed = Vec::new();
        let offered = {
            let mut state = self.state.write();

            // Keep publish stamps monotonic so replay order and `enqueued_at`
            // order agree even if the wall clock steps back.
            let stamp = state
                .last_enqueued_at
                .map_or(message.enqueued_at, |last| last.max(message.enqueued_at));
            message.enqueued_at = stamp;
            state.last_enqueued_at = Some(stamp);

            let seq = state.next_seq;
            state.next_seq += 1;
            state.history.push_back(Retained {
                seq,
                message: message.clone(),
            });
            self.evict(&mut state, now);
            self.counters.record_published();

            let mut offered = 0;
            for subscription in &state.subscriptions {
                if subscription.accepts(&message)
                    && subscription.offer(message.clone(), now, &mut failed)
                {
                    offered += 1;
                }
            }
            offered
        };
        self.dead_letters.push_all(failed);
        debug!(topic = %self.name, message_id = %message.id, offered, "message published");
        offered
    }

    /// Registers a subscription that sees messages published from now on.
    pub fn subscribe(&self, filter: Option<Filter>) -> Arc<Subscription> {
        self.subscribe_with(filter, self.config.subscription.clone())
    }

    pub fn subscribe_with(&self, filter: Option<Filter>, backlog: QueueConfig) -> Arc<Subscription> {
        let id = Uuid::new_v4().to_string();
        let queue = Queue::for_subscription(
            format!("{}/{}", self.name, id),
            &id,
            backlog,
            Arc::clone(&self.dead_letters),
        );

        let mut state = self.state.write();
        let subscription = Arc::new(Subscription {
            id,
            topic: self.name.clone(),
            filter,
            queue: Arc::new(queue),
            live_from: state.next_seq,
            created_at: Utc::now(),
        });
        state.subscriptions.push(Arc::clone(&subscription));
        info!(topic = %self.name, subscription = %subscription.id, "subscription created");
        subscription
    }

    pub fn unsubscribe(&self, subscription_id: &str) -> Option<Arc<Subscription>> {
        let mut state = self.state.write();
        let index = state
            .subscriptions
            .iter()
            .position(|subscription| subscription.id == subscription_id)?;
        let removed = state.subscriptions.remove(index);
        info!(topic = %self.name, subscription = %subscription_id, "subscription removed");
        Some(removed)
    }

    pub fn subscription(&self, subscription_id: &str) -> Option<Arc<Subscription>> {
        self.state
            .read()
            .subscriptions
            .iter()
            .find(|subscription| subscription.id == subscription_id)
            .cloned()
    }

    pub fn subscriptions(&self) -> Vec<Arc<Subscription>> {
        self.state.read().subscriptions.clone()
    }

    /// Redelivers retained messages stamped at or after `since` that the
    /// subscription's filter accepts, in publish order.
    ///
    /// Messages the subscription already received live are skipped. Replayed
    /// copies are counted under `replayed`, not as topic publishes or live
    /// deliveries. Copies that do not fit in the backlog are dead-lettered
    /// like live ones. Returns the number of copies enqueued.
    pub fn replay_since(&self, subscription_id: &str, since: DateTime<Utc>) -> Result<usize> {
        self.replay_since_at(subscription_id, since, Utc::now())
    }

    pub(crate) fn replay_since_at(
        &self,
        subscription_id: &str,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let mut failed = Vec::new();
        let replayed = {
            let state = self.state.read();
            let subscription = state
                .subscriptions
                .iter()
                .find(|subscription| subscription.id == subscription_id)
                .ok_or_else(|| BrokerError::UnknownSubscription(subscription_id.to_string()))?;

            let mut replayed = 0;
            for retained in &state.history {
                if retained.seq >= subscription.live_from {
                    break;
                }
                let message = &retained.message;
                if message.enqueued_at < since
                    || !self.config.retention.retains(message, now)
                    || !subscription.accepts(message)
                {
                    continue;
                }
                let mut copy = message.clone();
                copy.replayed = true;
                if subscription.offer(copy, now, &mut failed) {
                    replayed += 1;
                }
            }
            replayed
        };
        self.dead_letters.push_all(failed);
        debug!(topic = %self.name, subscription = %subscription_id, replayed, "replay finished");
        Ok(replayed)
    }

    pub fn retained_len(&self) -> usize {
        self.state.read().history.len()
    }

    /// Topic-level counters: publishes once per message, deliveries summed
    /// over subscriptions.
    pub fn snapshot(&self) -> (CounterSnapshot, Vec<(SubscriptionId, CounterSnapshot)>) {
        let subscriptions = self.subscriptions();
        let mut total = self.counters.snapshot(0);
        let mut per_subscription = Vec::with_capacity(subscriptions.len());
        for subscription in subscriptions {
            let snapshot = subscription.snapshot();
            total.absorb_deliveries(&snapshot);
            per_subscription.push((subscription.id.clone(), snapshot));
        }
        (total, per_subscription)
    }

    fn evict(&self, state: &mut TopicState, now: DateTime<Utc>) {
        let retention = &self.config.retention;
        if let Some(max) = retention.max_messages {
            while state.history.len() > max {
                state.history.pop_front();
            }
        }
        while state
            .history
            .front()
            .is_some_and(|retained| !retention.retains(&retained.message, now))
        {
            state.history.pop_front();
        }
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topic")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("retained", &self.retained_len())
            .finish()
    }
}
