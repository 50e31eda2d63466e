//! The `error` module defines the error types used within `hopper`.
//!
//! Errors that reflect caller misuse (unknown destination, conflicting
//! configuration, a full queue) are returned immediately. Errors that only
//! affect a single message are contained by the queue machinery and turned
//! into retries or dead letters, so they never show up here.

/// Failures of the dead-letter archive backend.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors returned by broker, queue and topic operations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("queue `{queue}` is full (capacity: {capacity})")]
    QueueFull { queue: String, capacity: usize },

    #[error("unknown destination: {0}")]
    UnknownDestination(String),

    #[error("destination `{name}` already exists with a different configuration: {reason}")]
    ConfigConflict { name: String, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Ack or nack for a message that is not currently leased. Usually a
    /// late ack after the visibility timeout already handed the message out
    /// again, or a duplicate settlement.
    #[error("message `{message_id}` is not leased on `{destination}`")]
    NotLeased {
        destination: String,
        message_id: String,
    },

    #[error("unknown subscription: {0}")]
    UnknownSubscription(String),

    #[error("unknown dead letter entry: {0}")]
    UnknownDeadLetter(String),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl BrokerError {
    /// Whether this outcome is only worth a warning and leaves broker state
    /// untouched.
    pub fn is_warning(&self) -> bool {
        matches!(self, BrokerError::NotLeased { .. })
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;
