use sled::{Db, Tree};

use crate::broker::DeadLetterEntry;
use crate::persistence::DeadLetterArchive;
use crate::utils::error::PersistenceError;

const DEAD_LETTER_TREE: &str = "dead_letters";

/// Dead-letter archive on a sled database.
///
/// Entries are keyed by their entry id. Entry ids are UUIDv7, so sled's
/// lexicographic key order is also failure order.
#[derive(Clone)]
pub struct SledArchive {
    db: Db,
    entries: Tree,
}

impl SledArchive {
    pub fn open(path: &str) -> Result<Self, PersistenceError> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    pub fn from_db(db: Db) -> Result<Self, PersistenceError> {
        let entries = db.open_tree(DEAD_LETTER_TREE)?;
        Ok(Self { db, entries })
    }

    pub fn flush(&self) -> Result<(), PersistenceError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl DeadLetterArchive for SledArchive {
    fn store(&self, entry: &DeadLetterEntry) -> Result<(), PersistenceError> {
        let serialized = serde_json::to_vec(entry)?;
        self.entries.insert(entry.id.as_bytes(), serialized)?;
        Ok(())
    }

    fn remove(&self, entry_id: &str) -> Result<(), PersistenceError> {
        self.entries.remove(entry_id.as_bytes())?;
        Ok(())
    }

    fn load(&self) -> Result<Vec<DeadLetterEntry>, PersistenceError> {
        let mut loaded = Vec::with_capacity(self.entries.len());
        for item in self.entries.iter() {
            let (_, value) = item?;
            loaded.push(serde_json::from_slice(&value)?);
        }
        Ok(loaded)
    }
}

impl std::fmt::Debug for SledArchive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledArchive")
            .field("db", &"sled::Db")
            .field("entries", &self.entries.len())
            .finish()
    }
}
