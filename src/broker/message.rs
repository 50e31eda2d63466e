//! Message definitions for the broker
//!
//! `Message` is the envelope every queue, subscription and dead-letter entry
//! carries. The payload is opaque; the broker only reads the routing and
//! retry fields.
//!
//! Notes on fields:
//! - `id`: producer-supplied or generated (UUID v4); used for duplicate
//!   suppression and dead-letter tracking
//! - `destination`: the queue or topic name it was published to
//! - `priority`: higher is served first on priority queues; default 0
//! - `enqueued_at`: set by the broker on publish
//! - `expires_at`: optional deadline; a message found past it at lease time
//!   is dead-lettered without being handed to a consumer
//! - `attempts` / `max_attempts`: delivery attempts so far and the ceiling
//!   inherited from the owning queue

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type MessageId = String;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub destination: String,
    pub payload: Vec<u8>,
    pub headers: HashMap<String, String>,
    pub priority: i32,
    pub enqueued_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Set on copies delivered through a topic replay so they are counted
    /// apart from live deliveries.
    #[serde(skip)]
    pub(crate) replayed: bool,
}

impl Message {
    /// Generate a new message id.
    pub fn new_id() -> MessageId {
        Uuid::new_v4().to_string()
    }

    /// Whether the message has outlived its time-to-live at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }

    /// Whether this copy came from a topic replay rather than live delivery.
    pub fn is_replay(&self) -> bool {
        self.replayed
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}

/// What a producer hands to `Broker::publish`.
///
/// ```rust
/// use hopper::broker::PublishRequest;
/// use std::time::Duration;
///
/// let request = PublishRequest::new(b"{\"order\":42}".to_vec())
///     .with_header("tenant", "acme")
///     .with_priority(5)
///     .with_ttl(Duration::from_secs(60));
/// assert_eq!(request.priority, 5);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishRequest {
    pub id: Option<MessageId>,
    pub payload: Vec<u8>,
    pub headers: HashMap<String, String>,
    pub priority: i32,
    pub ttl: Option<Duration>,
}

impl PublishRequest {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            ..Self::default()
        }
    }

    /// Use a producer-chosen id instead of a generated one.
    pub fn with_id(mut self, id: impl Into<MessageId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Turns the request into a message addressed to `destination`.
    ///
    /// `attempts` starts at zero and `max_attempts` is left for the receiving
    /// queue to fill in.
    pub fn into_message(self, destination: &str, now: DateTime<Utc>) -> Message {
        Message {
            id: self.id.unwrap_or_else(Message::new_id),
            destination: destination.to_string(),
            payload: self.payload,
            headers: self.headers,
            priority: self.priority,
            enqueued_at: now,
            expires_at: self.ttl.map(|ttl| deadline(now, ttl)),
            attempts: 0,
            max_attempts: 0,
            replayed: false,
        }
    }
}

/// `now + duration`, saturating at the latest representable instant.
pub(crate) fn deadline(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
