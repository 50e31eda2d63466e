//! The `persistence` module lets dead letters outlive the process.
//!
//! The broker core is in-memory. A `DeadLetterArchive` is the external
//! store the dead-letter store reports to and restores from; `sled_store`
//! provides one backed by `sled`, an embedded key-value store.

pub mod sled_store;

use std::fmt::Debug;

use crate::broker::DeadLetterEntry;
use crate::utils::error::PersistenceError;

pub use sled_store::SledArchive;

pub trait DeadLetterArchive: Send + Sync + Debug {
    /// Writes (or overwrites) an entry.
    fn store(&self, entry: &DeadLetterEntry) -> Result<(), PersistenceError>;

    /// Deletes an entry; deleting a missing entry is not an error.
    fn remove(&self, entry_id: &str) -> Result<(), PersistenceError>;

    /// All archived entries, oldest first.
    fn load(&self) -> Result<Vec<DeadLetterEntry>, PersistenceError>;
}

#[cfg(test)]
mod tests;
