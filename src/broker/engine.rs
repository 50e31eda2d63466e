//! Broker engine
//!
//! The broker is an explicit registry of named destinations. Construct one,
//! declare queues and topics, then hand an `Arc<Broker>` to producers and
//! consumers. It is responsible for:
//! - creating destinations idempotently by name and rejecting conflicting
//!   redeclarations
//! - routing publishes to a queue (one consumer per message) or a topic
//!   (one copy per matching subscription)
//! - starting and stopping consumer groups for subscribers
//! - exposing dead letters, requeue, and metrics snapshots
//!
//! Concurrency and usage notes:
//! - The registry lock only guards the name map. Publishing clones the
//!   destination handle and releases the lock before touching the queue or
//!   topic, so destinations never contend with each other.
//! - `subscribe` spawns tokio tasks and must run inside a runtime.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::broker::consumer::{ConsumerGroup, GroupOptions, Handler};
use crate::broker::dead_letter::{DeadLetterEntry, DeadLetterStore};
use crate::broker::idempotency::IdempotencyRegistry;
use crate::broker::message::{Message, MessageId, PublishRequest};
use crate::broker::metrics::{DestinationKind, DestinationSnapshot, MetricsSnapshot};
use crate::broker::queue::{Queue, QueueConfig};
use crate::broker::topic::{Filter, SubscriptionId, Topic, TopicConfig};
use crate::config::{BrokerSettings, Settings};
use crate::persistence::DeadLetterArchive;
use crate::utils::error::{BrokerError, Result};

/// A named publish target.
#[derive(Debug, Clone)]
pub enum Destination {
    Queue(Arc<Queue>),
    Topic(Arc<Topic>),
}

impl Destination {
    pub fn name(&self) -> &str {
        match self {
            Destination::Queue(queue) => queue.name(),
            Destination::Topic(topic) => topic.name(),
        }
    }

    pub fn kind(&self) -> DestinationKind {
        match self {
            Destination::Queue(_) => DestinationKind::Queue,
            Destination::Topic(_) => DestinationKind::Topic,
        }
    }

    /// Queues store the message for one consumer; topics fan it out.
    pub fn publish(&self, message: Message) -> Result<()> {
        match self {
            Destination::Queue(queue) => queue.enqueue(message),
            Destination::Topic(topic) => {
                topic.publish(message);
                Ok(())
            }
        }
    }

    pub fn snapshot(&self) -> DestinationSnapshot {
        match self {
            Destination::Queue(queue) => DestinationSnapshot {
                kind: DestinationKind::Queue,
                counters: queue.snapshot(),
                subscriptions: Default::default(),
            },
            Destination::Topic(topic) => {
                let (counters, subscriptions) = topic.snapshot();
                DestinationSnapshot {
                    kind: DestinationKind::Topic,
                    counters,
                    subscriptions: subscriptions.into_iter().collect(),
                }
            }
        }
    }
}

/// Options for `Broker::subscribe`.
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub concurrency: usize,
    /// Topics only.
    pub filter: Option<Filter>,
    /// Topics only: replay retained messages stamped at or after this time.
    pub replay_since: Option<DateTime<Utc>>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            filter: None,
            replay_since: None,
        }
    }
}

impl SubscribeOptions {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_replay_since(mut self, since: DateTime<Utc>) -> Self {
        self.replay_since = Some(since);
        self
    }
}

/// What a subscriber id is attached to.
#[derive(Debug, Clone)]
struct SubscriberRecord {
    destination: String,
    /// Set for topic subscriptions, `None` for competing consumers on a queue.
    topic_subscription: Option<SubscriptionId>,
}

pub struct Broker {
    destinations: RwLock<HashMap<String, Destination>>,
    dead_letters: Arc<DeadLetterStore>,
    idempotency: Arc<IdempotencyRegistry>,
    consumers: Mutex<HashMap<SubscriptionId, (SubscriberRecord, ConsumerGroup)>>,
    poll_interval: Duration,
}

impl Broker {
    pub fn new() -> Self {
        Self::with_settings(&BrokerSettings::default())
    }

    pub fn with_settings(settings: &BrokerSettings) -> Self {
        let dead_letters = Arc::new(DeadLetterStore::new(settings.dead_letter_capacity));
        Self::with_dead_letter_store(settings, dead_letters)
    }

    /// Idempotency retention above `IdempotencyRegistry::MAX_RETENTION` is
    /// clamped; `from_settings` rejects it instead.
    pub fn with_dead_letter_store(settings: &BrokerSettings, dead_letters: Arc<DeadLetterStore>) -> Self {
        Self {
            destinations: RwLock::new(HashMap::new()),
            dead_letters,
            idempotency: Arc::new(IdempotencyRegistry::new(
                Duration::from_secs(settings.idempotency_retention_secs),
                settings.idempotency_max_entries,
            )),
            consumers: Mutex::new(HashMap::new()),
            poll_interval: Duration::from_millis(settings.poll_interval_ms.max(1)),
        }
    }

    /// Builds a broker from loaded settings and declares every configured
    /// queue and topic. Dead letters write through to `archive` when given.
    pub fn from_settings(settings: &Settings, archive: Option<Arc<dyn DeadLetterArchive>>) -> Result<Self> {
        settings.broker.validate().map_err(BrokerError::InvalidConfig)?;
        let dead_letters = match archive {
            Some(archive) => Arc::new(DeadLetterStore::with_archive(
                settings.broker.dead_letter_capacity,
                archive,
            )?),
            None => Arc::new(DeadLetterStore::new(settings.broker.dead_letter_capacity)),
        };
        let broker = Self::with_dead_letter_store(&settings.broker, dead_letters);

        for declared in &settings.queues {
            broker.create_queue(&declared.name, declared.to_config())?;
        }
        for declared in &settings.topics {
            broker.create_topic(&declared.name, declared.to_config())?;
        }
        Ok(broker)
    }

    /// Creates a queue, or returns the existing one when it was declared with
    /// the same configuration.
    pub fn create_queue(&self, name: &str, config: QueueConfig) -> Result<Arc<Queue>> {
        config.validate().map_err(BrokerError::InvalidConfig)?;

        let mut destinations = self.destinations.write();
        match destinations.get(name) {
            Some(Destination::Queue(existing)) if *existing.config() == config => {
                return Ok(Arc::clone(existing));
            }
            Some(Destination::Queue(_)) => {
                return Err(BrokerError::ConfigConflict {
                    name: name.to_string(),
                    reason: "queue exists with a different configuration".to_string(),
                });
            }
            Some(Destination::Topic(_)) => {
                return Err(BrokerError::ConfigConflict {
                    name: name.to_string(),
                    reason: "name is already used by a topic".to_string(),
                });
            }
            None => {}
        }

        let queue = Arc::new(Queue::new(name, config, Arc::clone(&self.dead_letters)));
        destinations.insert(name.to_string(), Destination::Queue(Arc::clone(&queue)));
        info!(queue = %name, "queue created");
        Ok(queue)
    }

    /// Creates a topic, or returns the existing one when it was declared with
    /// the same configuration.
    pub fn create_topic(&self, name: &str, config: TopicConfig) -> Result<Arc<Topic>> {
        config.validate().map_err(BrokerError::InvalidConfig)?;

        let mut destinations = self.destinations.write();
        match destinations.get(name) {
            Some(Destination::Topic(existing)) if *existing.config() == config => {
                return Ok(Arc::clone(existing));
            }
            Some(Destination::Topic(_)) => {
                return Err(BrokerError::ConfigConflict {
                    name: name.to_string(),
                    reason: "topic exists with a different configuration".to_string(),
                });
            }
            Some(Destination::Queue(_)) => {
                return Err(BrokerError::ConfigConflict {
                    name: name.to_string(),
                    reason: "name is already used by a queue".to_string(),
                });
            }
            None => {}
        }

        let topic = Arc::new(Topic::new(name, config, Arc::clone(&self.dead_letters)));
        destinations.insert(name.to_string(), Destination::Topic(Arc::clone(&topic)));
        info!(topic = %name, "topic created");
        Ok(topic)
    }

    pub fn destination(&self, name: &str) -> Result<Destination> {
        self.destinations
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownDestination(name.to_string()))
    }

    pub fn queue(&self, name: &str) -> Result<Arc<Queue>> {
        match self.destination(name)? {
            Destination::Queue(queue) => Ok(queue),
            Destination::Topic(_) => Err(BrokerError::UnknownDestination(format!("{name} (is a topic)"))),
        }
    }

    pub fn topic(&self, name: &str) -> Result<Arc<Topic>> {
        match self.destination(name)? {
            Destination::Topic(topic) => Ok(topic),
            Destination::Queue(_) => Err(BrokerError::UnknownDestination(format!("{name} (is a queue)"))),
        }
    }

    /// Destination names, sorted.
    pub fn destinations(&self) -> Vec<String> {
        let mut names: Vec<String> = self.destinations.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Publishes to a queue or topic and returns the message id.
    pub fn publish(&self, destination: &str, request: PublishRequest) -> Result<MessageId> {
        let target = self.destination(destination)?;
        let message = request.into_message(destination, Utc::now());
        let id = message.id.clone();
        target.publish(message)?;
        Ok(id)
    }

    /// Attaches `handler` to a destination and starts `options.concurrency`
    /// workers.
    ///
    /// On a queue the workers compete for messages with every other
    /// subscriber of that queue. On a topic a new subscription is created
    /// that sees messages published from now on, plus retained history when
    /// `replay_since` is set.
    pub fn subscribe<H>(&self, destination: &str, handler: H, options: SubscribeOptions) -> Result<SubscriptionId>
    where
        H: Handler,
    {
        let handler: Arc<dyn Handler> = Arc::new(handler);
        let group_options = GroupOptions {
            concurrency: options.concurrency,
            poll_interval: self.poll_interval,
        };

        match self.destination(destination)? {
            Destination::Queue(queue) => {
                if options.filter.is_some() || options.replay_since.is_some() {
                    return Err(BrokerError::InvalidConfig(
                        "filters and replay are only supported on topics".to_string(),
                    ));
                }
                let id = Message::new_id();
                let group = ConsumerGroup::start(
                    id.clone(),
                    queue,
                    handler,
                    Arc::clone(&self.idempotency),
                    group_options,
                );
                let record = SubscriberRecord {
                    destination: destination.to_string(),
                    topic_subscription: None,
                };
                self.consumers.lock().insert(id.clone(), (record, group));
                Ok(id)
            }
            Destination::Topic(topic) => {
                let subscription = topic.subscribe(options.filter);
                let id = subscription.id().to_string();
                if let Some(since) = options.replay_since
                    && let Err(e) = topic.replay_since(&id, since)
                {
                    topic.unsubscribe(&id);
                    return Err(e);
                }
                let group = ConsumerGroup::start(
                    id.clone(),
                    Arc::clone(subscription.queue()),
                    handler,
                    Arc::clone(&self.idempotency),
                    group_options,
                );
                let record = SubscriberRecord {
                    destination: destination.to_string(),
                    topic_subscription: Some(id.clone()),
                };
                self.consumers.lock().insert(id.clone(), (record, group));
                Ok(id)
            }
        }
    }

    /// Stops a subscriber's workers and, for topics, removes the
    /// subscription together with its backlog.
    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        let (record, group) = self
            .consumers
            .lock()
            .remove(subscription_id)
            .ok_or_else(|| BrokerError::UnknownSubscription(subscription_id.to_string()))?;

        if let Some(topic_subscription) = &record.topic_subscription
            && let Ok(topic) = self.topic(&record.destination)
        {
            topic.unsubscribe(topic_subscription);
        }
        group.stop().await;
        Ok(())
    }

    /// Replays retained history into an existing topic subscription.
    pub fn replay_since(&self, topic: &str, subscription_id: &str, since: DateTime<Utc>) -> Result<usize> {
        self.topic(topic)?.replay_since(subscription_id, since)
    }

    /// Leases from a queue on behalf of an external consumer.
    pub fn lease(&self, destination: &str, consumer_id: &str) -> Result<Option<Message>> {
        Ok(self.queue(destination)?.lease(consumer_id))
    }

    pub fn ack(&self, destination: &str, message_id: &str) -> Result<()> {
        self.queue(destination)?.ack(message_id)
    }

    pub fn nack(&self, destination: &str, message_id: &str, reason: &str) -> Result<()> {
        self.queue(destination)?.nack(message_id, reason)
    }

    pub fn dead_letter_store(&self) -> &Arc<DeadLetterStore> {
        &self.dead_letters
    }

    pub fn idempotency(&self) -> &Arc<IdempotencyRegistry> {
        &self.idempotency
    }

    /// Dead letters that originated from `destination`, oldest first.
    pub fn dead_letters(&self, destination: &str) -> Vec<DeadLetterEntry> {
        self.dead_letters.list(destination)
    }

    /// Publishes a dead-lettered message again as a brand-new message: new
    /// id, attempts reset, no expiry, positioned by its priority as of now.
    ///
    /// Copies that failed on a topic subscription go back to that
    /// subscription only, if it still exists. On failure the entry is put
    /// back into the store.
    pub fn requeue_dead_letter(&self, entry_id: &str) -> Result<MessageId> {
        let entry = self
            .dead_letters
            .take(entry_id)
            .ok_or_else(|| BrokerError::UnknownDeadLetter(entry_id.to_string()))?;

        match self.requeue_entry(&entry) {
            Ok(id) => {
                info!(entry_id = %entry_id, message_id = %id, "dead letter requeued");
                Ok(id)
            }
            Err(e) => {
                warn!(entry_id = %entry_id, error = %e, "dead letter requeue failed");
                self.dead_letters.restore(entry);
                Err(e)
            }
        }
    }

    fn requeue_entry(&self, entry: &DeadLetterEntry) -> Result<MessageId> {
        let original = &entry.message;
        let request = PublishRequest::new(original.payload.clone())
            .with_headers(original.headers.clone())
            .with_priority(original.priority);
        let destination = original.destination.as_str();

        if let Some(subscription_id) = &entry.subscription
            && let Some(subscription) = self.topic(destination)?.subscription(subscription_id)
        {
            let message = request.into_message(destination, Utc::now());
            let id = message.id.clone();
            subscription.queue().enqueue(message)?;
            return Ok(id);
        }
        self.publish(destination, request)
    }

    /// Counters for every destination, keyed by name.
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        let destinations: Vec<Destination> = self.destinations.read().values().cloned().collect();
        destinations
            .into_iter()
            .map(|destination| (destination.name().to_string(), destination.snapshot()))
            .collect()
    }

    /// Stops every consumer group. Destinations and their contents stay.
    pub async fn shutdown(&self) {
        let groups: Vec<(SubscriberRecord, ConsumerGroup)> =
            self.consumers.lock().drain().map(|(_, entry)| entry).collect();
        for (_, group) in groups {
            group.stop().await;
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.consumers.lock().len()
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("destinations", &self.destinations())
            .field("dead_letters", &self.dead_letters)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
