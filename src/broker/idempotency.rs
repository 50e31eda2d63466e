//! Best-effort record of recently processed messages.
//!
//! Consumer groups consult the registry before invoking a handler so that a
//! message redelivered after a spurious visibility timeout (or published
//! twice under the same id) does not repeat its side effects. Entries are
//! keyed by a scope (the queue a consumer group drains) plus the message id,
//! so subscriptions of the same topic never suppress each other.
//!
//! Entries expire after the retention horizon and the cache is bounded, so
//! this is a de-duplication aid, not a ledger.

use std::time::Duration;

use chrono::{DateTime, Utc};
use moka::sync::Cache;
use tracing::warn;

pub struct IdempotencyRegistry {
    retention: Duration,
    processed: Cache<String, DateTime<Utc>>,
}

impl IdempotencyRegistry {
    pub const DEFAULT_RETENTION: Duration = Duration::from_secs(300);
    pub const DEFAULT_MAX_ENTRIES: u64 = 100_000;
    /// Longest accepted retention horizon (365 days).
    pub const MAX_RETENTION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

    /// Longer retentions are clamped to `MAX_RETENTION`.
    pub fn new(retention: Duration, max_entries: u64) -> Self {
        if retention > Self::MAX_RETENTION {
            warn!(
                requested_secs = retention.as_secs(),
                max_secs = Self::MAX_RETENTION.as_secs(),
                "idempotency retention clamped"
            );
        }
        let retention = retention.min(Self::MAX_RETENTION);
        let processed = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(retention)
            .build();
        Self {
            retention,
            processed,
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    pub fn is_processed(&self, scope: &str, message_id: &str) -> bool {
        self.is_processed_at(scope, message_id, Utc::now())
    }

    /// The cache evicts lazily, so the processed-at timestamp is checked
    /// against the horizon as well.
    pub fn is_processed_at(&self, scope: &str, message_id: &str, now: DateTime<Utc>) -> bool {
        match self.processed.get(&Self::key(scope, message_id)) {
            Some(processed_at) => now
                .signed_duration_since(processed_at)
                .to_std()
                .map_or(true, |age| age <= self.retention),
            None => false,
        }
    }

    pub fn mark_processed(&self, scope: &str, message_id: &str) {
        self.mark_processed_at(scope, message_id, Utc::now());
    }

    pub fn mark_processed_at(&self, scope: &str, message_id: &str, at: DateTime<Utc>) {
        self.processed.insert(Self::key(scope, message_id), at);
    }

    pub fn forget(&self, scope: &str, message_id: &str) {
        self.processed.invalidate(&Self::key(scope, message_id));
    }

    /// Runs pending evictions now instead of on the next cache access.
    pub fn purge_expired(&self) {
        self.processed.run_pending_tasks();
    }

    /// Approximate number of live entries.
    pub fn len(&self) -> u64 {
        self.processed.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn key(scope: &str, message_id: &str) -> String {
        format!("{scope}\u{1f}{message_id}")
    }
}

impl Default for IdempotencyRegistry {
    fn default() -> Self {
        Self::new(Self::DEFAULT_RETENTION, Self::DEFAULT_MAX_ENTRIES)
    }
}

impl std::fmt::Debug for IdempotencyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyRegistry")
            .field("retention", &self.retention)
            .finish()
    }
}
