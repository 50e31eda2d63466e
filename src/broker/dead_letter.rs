//! Dead-letter store
//!
//! Terminal holding area for messages that ran out of attempts, expired
//! before delivery, were rejected by their handler or could not be buffered
//! for a subscription. Entries are kept oldest-first and the oldest is
//! evicted once the store is at capacity. Nothing in the broker revives an
//! entry on its own; `Broker::requeue_dead_letter` is the operator's way
//! back.
//!
//! One store is shared by every queue and topic of a broker. It carries its
//! own lock, independent of the queues that feed it.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::broker::message::Message;
use crate::persistence::DeadLetterArchive;
use crate::utils::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeadLetterEntry {
    /// Time-ordered entry id, distinct from the message id.
    pub id: String,
    pub message: Message,
    /// Subscription whose copy failed, for messages that came through a topic.
    pub subscription: Option<String>,
    pub reason: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn new(
        message: Message,
        subscription: Option<String>,
        reason: impl Into<String>,
        failed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            attempts: message.attempts,
            message,
            subscription,
            reason: reason.into(),
            failed_at,
        }
    }

    pub fn destination(&self) -> &str {
        &self.message.destination
    }
}

pub struct DeadLetterStore {
    capacity: usize,
    entries: Mutex<VecDeque<DeadLetterEntry>>,
    archive: Option<Arc<dyn DeadLetterArchive>>,
}

impl DeadLetterStore {
    pub const DEFAULT_CAPACITY: usize = 10_000;

    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
            archive: None,
        }
    }

    /// Creates a store that writes through to `archive` and starts out with
    /// whatever the archive already holds (newest `capacity` entries).
    pub fn with_archive(capacity: usize, archive: Arc<dyn DeadLetterArchive>) -> Result<Self> {
        let capacity = capacity.max(1);
        let mut restored: VecDeque<DeadLetterEntry> = archive.load()?.into();
        while restored.len() > capacity {
            if let Some(evicted) = restored.pop_front() {
                archive.remove(&evicted.id)?;
            }
        }
        Ok(Self {
            capacity,
            entries: Mutex::new(restored),
            archive: Some(archive),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Adds an entry, evicting the oldest one when full. Returns the entry
    /// id.
    pub fn push(&self, entry: DeadLetterEntry) -> String {
        let id = entry.id.clone();
        self.insert(entry);
        id
    }

    pub(crate) fn push_all(&self, entries: Vec<DeadLetterEntry>) {
        for entry in entries {
            self.insert(entry);
        }
    }

    /// Puts back an entry that was taken but could not be requeued, at the
    /// position its id gives it among the remaining entries.
    pub(crate) fn restore(&self, entry: DeadLetterEntry) {
        self.insert(entry);
    }

    // Ids are UUIDv7: keeping entries in id order keeps them in failure order
    // and in the archive's key order. New entries normally land at the back.
    fn insert(&self, entry: DeadLetterEntry) {
        self.archive_store(&entry);

        let evicted = {
            let mut entries = self.entries.lock();
            let index = entries.partition_point(|held| held.id < entry.id);
            entries.insert(index, entry);
            if entries.len() > self.capacity {
                entries.pop_front()
            } else {
                None
            }
        };

        if let Some(evicted) = evicted {
            warn!(
                entry_id = %evicted.id,
                destination = %evicted.destination(),
                message_id = %evicted.message.id,
                "dead letter store full, evicted oldest entry"
            );
            self.archive_remove(&evicted.id);
        }
    }

    /// Entries that originated from `destination`, oldest first.
    pub fn list(&self, destination: &str) -> Vec<DeadLetterEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.destination() == destination)
            .cloned()
            .collect()
    }

    pub fn get(&self, entry_id: &str) -> Option<DeadLetterEntry> {
        self.entries
            .lock()
            .iter()
            .find(|entry| entry.id == entry_id)
            .cloned()
    }

    /// Removes and returns an entry.
    pub fn take(&self, entry_id: &str) -> Option<DeadLetterEntry> {
        let taken = {
            let mut entries = self.entries.lock();
            let index = entries.iter().position(|entry| entry.id == entry_id)?;
            entries.remove(index)
        };
        if taken.is_some() {
            self.archive_remove(entry_id);
        }
        taken
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Archive failures never block dead-lettering; the in-memory copy is
    // authoritative for the life of the process.
    fn archive_store(&self, entry: &DeadLetterEntry) {
        if let Some(archive) = &self.archive
            && let Err(e) = archive.store(entry)
        {
            warn!(entry_id = %entry.id, error = %e, "failed to archive dead letter");
        }
    }

    fn archive_remove(&self, entry_id: &str) {
        if let Some(archive) = &self.archive
            && let Err(e) = archive.remove(entry_id)
        {
            warn!(entry_id = %entry_id, error = %e, "failed to remove archived dead letter");
        }
    }
}

impl Default for DeadLetterStore {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

impl std::fmt::Debug for DeadLetterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterStore")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("archived", &self.archive.is_some())
            .finish()
    }
}
