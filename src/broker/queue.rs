//! Point-to-point queue with visibility-timeout leasing.
//!
//! A message moves through `available -> leased -> {acked | available |
//! dead-lettered}`. Leasing hides a message from other consumers until its
//! visibility timeout passes; a consumer that neither acks nor nacks in time
//! loses the lease and the message is retried as if it had been nacked.
//!
//! Concurrency and usage notes:
//! - All state lives behind one lock per queue; enqueue, lease, ack, nack
//!   and the expiry sweep are atomic with respect to each other. Queues do
//!   not share locks.
//! - There is no timer thread. Expired leases and elapsed backoff delays are
//!   processed lazily at the start of every `enqueue` and `lease`.
//! - Messages waiting out a backoff delay still count against capacity.
//! - Dead letters are handed to the shared store only after the queue lock
//!   is released.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::sync::futures::Notified;
use tracing::{debug, warn};

use crate::broker::dead_letter::{DeadLetterEntry, DeadLetterStore};
use crate::broker::message::{Message, MessageId, deadline};
use crate::broker::metrics::{CounterSnapshot, Counters};
use crate::broker::retry::RetryPolicy;
use crate::utils::error::{BrokerError, Result};

pub const VISIBILITY_TIMEOUT_EXPIRED: &str = "visibility timeout expired";
pub const MESSAGE_EXPIRED: &str = "message expired";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderingMode {
    /// Strict `enqueued_at` order; priorities are ignored.
    #[default]
    Fifo,
    /// Highest priority first, `enqueued_at` order among equals.
    Priority,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    pub capacity: usize,
    pub ordering: OrderingMode,
    pub visibility_timeout: Duration,
    pub retry: RetryPolicy,
}

impl QueueConfig {
    pub const DEFAULT_CAPACITY: usize = 10_000;
    pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.capacity == 0 {
            return Err("capacity must be at least 1".to_string());
        }
        if self.visibility_timeout.is_zero() {
            return Err("visibility_timeout must be greater than zero".to_string());
        }
        self.retry.validate()
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: Self::DEFAULT_CAPACITY,
            ordering: OrderingMode::default(),
            visibility_timeout: Self::DEFAULT_VISIBILITY_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub available: usize,
    /// Nacked messages waiting out their backoff delay.
    pub delayed: usize,
    pub in_flight: usize,
}

/// A message plus its queue-local insertion sequence, which breaks ties
/// between equal `enqueued_at` stamps.
#[derive(Debug)]
struct Slot {
    seq: u64,
    message: Message,
}

#[derive(Debug)]
struct Ready {
    rank: i64,
    slot: Slot,
}

// Max-heap: higher rank first, then earlier enqueued_at, then lower seq.
impl Ord for Ready {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank
            .cmp(&other.rank)
            .then_with(|| other.slot.message.enqueued_at.cmp(&self.slot.message.enqueued_at))
            .then_with(|| other.slot.seq.cmp(&self.slot.seq))
    }
}

impl PartialOrd for Ready {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Ready {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ready {}

#[derive(Debug)]
struct Delayed {
    visible_at: DateTime<Utc>,
    slot: Slot,
}

// Reversed so the earliest `visible_at` sits on top of the heap.
impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .visible_at
            .cmp(&self.visible_at)
            .then_with(|| other.slot.seq.cmp(&self.slot.seq))
    }
}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Delayed {}

#[derive(Debug)]
struct Lease {
    slot: Slot,
    consumer_id: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct QueueState {
    available: BinaryHeap<Ready>,
    delayed: BinaryHeap<Delayed>,
    leased: HashMap<MessageId, Lease>,
    /// Every id currently held in `available`, `delayed` or `leased`.
    ids: HashSet<MessageId>,
    next_seq: u64,
}

impl QueueState {
    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

pub struct Queue {
    name: String,
    config: QueueConfig,
    /// Set when this queue is the backlog of a topic subscription.
    subscription: Option<String>,
    state: Mutex<QueueState>,
    dead_letters: Arc<DeadLetterStore>,
    counters: Counters,
    notify: Notify,
}

impl Queue {
    pub fn new(
        name: impl Into<String>,
        config: QueueConfig,
        dead_letters: Arc<DeadLetterStore>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            subscription: None,
            state: Mutex::new(QueueState::default()),
            dead_letters,
            counters: Counters::default(),
            notify: Notify::new(),
        }
    }

    pub(crate) fn for_subscription(
        name: impl Into<String>,
        subscription_id: &str,
        config: QueueConfig,
        dead_letters: Arc<DeadLetterStore>,
    ) -> Self {
        Self {
            subscription: Some(subscription_id.to_string()),
            ..Self::new(name, config, dead_letters)
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Adds a message to the available set.
    ///
    /// Fails with `QueueFull` at capacity. A message whose id is already
    /// held by this queue is accepted without being stored twice.
    pub fn enqueue(&self, message: Message) -> Result<()> {
        self.enqueue_at(message, Utc::now())
    }

    pub(crate) fn enqueue_at(&self, message: Message, now: DateTime<Utc>) -> Result<()> {
        let mut failed = Vec::new();
        let result = self.enqueue_deferred(message, now, &mut failed);
        self.dead_letters.push_all(failed);
        result
    }

    /// Same as `enqueue_at`, but dead letters produced by the sweep are
    /// appended to `failed` for the caller to store once its own locks are
    /// released.
    pub(crate) fn enqueue_deferred(
        &self,
        mut message: Message,
        now: DateTime<Utc>,
        failed: &mut Vec<DeadLetterEntry>,
    ) -> Result<()> {
        {
            let mut state = self.state.lock();
            self.sweep_locked(&mut state, now, failed);

            if state.ids.contains(&message.id) {
                debug!(queue = %self.name, message_id = %message.id, "duplicate enqueue ignored");
                return Ok(());
            }
            if state.ids.len() >= self.config.capacity {
                return Err(BrokerError::QueueFull {
                    queue: self.name.clone(),
                    capacity: self.config.capacity,
                });
            }

            message.attempts = 0;
            message.max_attempts = self.config.retry.max_attempts;
            if message.replayed {
                self.counters.record_replayed();
            } else {
                self.counters.record_published();
            }

            state.ids.insert(message.id.clone());
            let seq = state.next_seq();
            self.make_ready(&mut state, Slot { seq, message });
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Takes the best available message and hides it for the visibility
    /// timeout.
    ///
    /// Expired candidates met on the way are dead-lettered instead of being
    /// returned.
    pub fn lease(&self, consumer_id: &str) -> Option<Message> {
        self.lease_at(consumer_id, Utc::now())
    }

    pub(crate) fn lease_at(&self, consumer_id: &str, now: DateTime<Utc>) -> Option<Message> {
        let mut failed = Vec::new();
        let leased = {
            let mut state = self.state.lock();
            self.sweep_locked(&mut state, now, &mut failed);
            self.take_next(&mut state, consumer_id, now, &mut failed)
        };
        self.dead_letters.push_all(failed);
        leased
    }

    /// Removes a leased message for good.
    pub fn ack(&self, message_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        let lease = state
            .leased
            .remove(message_id)
            .ok_or_else(|| self.not_leased(message_id))?;
        state.ids.remove(message_id);
        if lease.slot.message.replayed {
            self.counters.record_replay_acked();
        } else {
            self.counters.record_acked();
        }
        debug!(queue = %self.name, message_id = %message_id, "message acked");
        Ok(())
    }

    /// Returns a leased message for another attempt after its backoff delay,
    /// or dead-letters it with `reason` once the attempt budget is spent.
    pub fn nack(&self, message_id: &str, reason: &str) -> Result<()> {
        self.nack_at(message_id, reason, Utc::now())
    }

    pub(crate) fn nack_at(&self, message_id: &str, reason: &str, now: DateTime<Utc>) -> Result<()> {
        let mut failed = Vec::new();
        {
            let mut state = self.state.lock();
            let lease = state
                .leased
                .remove(message_id)
                .ok_or_else(|| self.not_leased(message_id))?;
            self.retry_or_dead_letter(&mut state, lease.slot, reason, now, &mut failed);
        }
        self.dead_letters.push_all(failed);
        self.notify.notify_one();
        Ok(())
    }

    /// Dead-letters a leased message right away, whatever attempts remain.
    pub fn reject(&self, message_id: &str, reason: &str) -> Result<()> {
        self.reject_at(message_id, reason, Utc::now())
    }

    pub(crate) fn reject_at(&self, message_id: &str, reason: &str, now: DateTime<Utc>) -> Result<()> {
        let entry = {
            let mut state = self.state.lock();
            let lease = state
                .leased
                .remove(message_id)
                .ok_or_else(|| self.not_leased(message_id))?;
            state.ids.remove(message_id);
            self.record_failed(&lease.slot.message);
            self.dead_letter(lease.slot.message, reason, now)
        };
        self.dead_letters.push(entry);
        Ok(())
    }

    /// Recovers expired leases and releases elapsed backoff delays without
    /// waiting for the next enqueue or lease.
    pub fn sweep(&self) {
        self.sweep_at(Utc::now());
    }

    pub(crate) fn sweep_at(&self, now: DateTime<Utc>) {
        let mut failed = Vec::new();
        {
            let mut state = self.state.lock();
            self.sweep_locked(&mut state, now, &mut failed);
        }
        self.dead_letters.push_all(failed);
    }

    pub fn depth(&self) -> QueueDepth {
        let state = self.state.lock();
        QueueDepth {
            available: state.available.len(),
            delayed: state.delayed.len(),
            in_flight: state.leased.len(),
        }
    }

    /// Messages held in any non-terminal state.
    pub fn len(&self) -> usize {
        self.state.lock().ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().leased.len()
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.state.lock().ids.contains(message_id)
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        self.counters.snapshot(self.in_flight())
    }

    /// Resolves when a message may have become available.
    pub(crate) fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }

    pub(crate) fn record_duplicate(&self) {
        self.counters.record_duplicate();
    }

    /// Builds the dead letter for a message that never made it into the
    /// queue. Storing it is left to the caller.
    pub(crate) fn dead_letter_unqueued(
        &self,
        message: Message,
        reason: &str,
        now: DateTime<Utc>,
    ) -> DeadLetterEntry {
        self.dead_letter(message, reason, now)
    }

    fn take_next(
        &self,
        state: &mut QueueState,
        consumer_id: &str,
        now: DateTime<Utc>,
        failed: &mut Vec<DeadLetterEntry>,
    ) -> Option<Message> {
        while let Some(Ready { mut slot, .. }) = state.available.pop() {
            if slot.message.is_expired(now) {
                state.ids.remove(&slot.message.id);
                failed.push(self.dead_letter(slot.message, MESSAGE_EXPIRED, now));
                continue;
            }

            slot.message.attempts += 1;
            let message = slot.message.clone();
            if !message.replayed {
                self.counters.record_delivered();
            }
            debug!(
                queue = %self.name,
                message_id = %message.id,
                consumer = %consumer_id,
                attempt = message.attempts,
                "message leased"
            );
            state.leased.insert(
                message.id.clone(),
                Lease {
                    slot,
                    consumer_id: consumer_id.to_string(),
                    expires_at: deadline(now, self.config.visibility_timeout),
                },
            );
            return Some(message);
        }
        None
    }

    fn make_ready(&self, state: &mut QueueState, slot: Slot) {
        let rank = match self.config.ordering {
            OrderingMode::Fifo => 0,
            OrderingMode::Priority => i64::from(slot.message.priority),
        };
        state.available.push(Ready { rank, slot });
    }

    fn retry_or_dead_letter(
        &self,
        state: &mut QueueState,
        slot: Slot,
        reason: &str,
        now: DateTime<Utc>,
        failed: &mut Vec<DeadLetterEntry>,
    ) {
        self.record_failed(&slot.message);
        let attempts = slot.message.attempts;
        if !self.config.retry.allows_retry(attempts) {
            state.ids.remove(&slot.message.id);
            failed.push(self.dead_letter(slot.message, reason, now));
            return;
        }

        let delay = self.config.retry.backoff(attempts);
        debug!(
            queue = %self.name,
            message_id = %slot.message.id,
            attempts,
            delay_ms = delay.as_millis() as u64,
            reason,
            "message scheduled for redelivery"
        );
        if delay.is_zero() {
            self.make_ready(state, slot);
        } else {
            state.delayed.push(Delayed {
                visible_at: deadline(now, delay),
                slot,
            });
        }
    }

    fn sweep_locked(&self, state: &mut QueueState, now: DateTime<Utc>, failed: &mut Vec<DeadLetterEntry>) {
        let expired: Vec<MessageId> = state
            .leased
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in expired {
            if let Some(lease) = state.leased.remove(&id) {
                debug!(
                    queue = %self.name,
                    message_id = %id,
                    consumer = %lease.consumer_id,
                    "lease expired"
                );
                self.retry_or_dead_letter(state, lease.slot, VISIBILITY_TIMEOUT_EXPIRED, now, failed);
            }
        }

        while state
            .delayed
            .peek()
            .is_some_and(|delayed| delayed.visible_at <= now)
        {
            if let Some(Delayed { slot, .. }) = state.delayed.pop() {
                self.make_ready(state, slot);
            }
        }
    }

    fn record_failed(&self, message: &Message) {
        if message.replayed {
            self.counters.record_replay_failed();
        } else {
            self.counters.record_failed();
        }
    }

    /// Counts and logs a terminal failure and builds its entry. Callers push
    /// the entry to the store after releasing the queue lock.
    fn dead_letter(&self, message: Message, reason: &str, now: DateTime<Utc>) -> DeadLetterEntry {
        warn!(
            queue = %self.name,
            message_id = %message.id,
            attempts = message.attempts,
            reason,
            "message dead-lettered"
        );
        if message.replayed {
            self.counters.record_replay_dead_lettered();
        } else {
            self.counters.record_dead_lettered();
        }
        DeadLetterEntry::new(message, self.subscription.clone(), reason, now)
    }

    fn not_leased(&self, message_id: &str) -> BrokerError {
        BrokerError::NotLeased {
            destination: self.name.clone(),
            message_id: message_id.to_string(),
        }
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("depth", &self.depth())
            .finish()
    }
}
