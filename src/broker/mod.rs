//! The `broker` module is the in-process message broker core.
//!
//! - `message`: the message envelope and the producer-facing publish request
//! - `queue`: bounded point-to-point queues with leasing, retry and expiry
//! - `topic`: fan-out topics with filtered subscriptions and replay
//! - `consumer`: worker pools that run handlers and settle leases
//! - `dead_letter`: the shared terminal store for failed messages
//! - `idempotency`: duplicate suppression for redelivered messages
//! - `engine`: the `Broker` registry tying destinations together

pub mod consumer;
pub mod dead_letter;
pub mod engine;
pub mod idempotency;
pub mod message;
pub mod metrics;
pub mod queue;
pub mod retry;
pub mod topic;

pub use consumer::{ConsumerGroup, GroupOptions, Handler, HandlerError, HandlerResult};
pub use dead_letter::{DeadLetterEntry, DeadLetterStore};
pub use engine::{Broker, Destination, SubscribeOptions};
pub use idempotency::IdempotencyRegistry;
pub use message::{Message, MessageId, PublishRequest};
pub use metrics::{CounterSnapshot, DestinationKind, DestinationSnapshot, MetricsSnapshot};
pub use queue::{OrderingMode, Queue, QueueConfig, QueueDepth};
pub use retry::RetryPolicy;
pub use topic::{Filter, RetentionWindow, Subscription, SubscriptionId, Topic, TopicConfig};
