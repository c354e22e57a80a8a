//! Storage trait and implementations backing a mesh base.
//!
//! A Store is an ordered key to byte-blob map with per-entry timestamps.
//! It knows nothing about mesh objects; the codec layer above it decides
//! what the bytes mean, keyed by the stored encoding id.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::keys::Timestamps;

pub mod fs;
pub mod memory;

pub use fs::FsStore;
pub use memory::MemoryStore;

/// A single persisted record.
///
/// Matches the external record layout: `(key, encodingId, timeCreated,
/// timeUpdated, timeRead, timeExpires, data)`, with the key held by the
/// caller. `time_expires == -1` means the entry never expires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreValue {
    pub encoding_id: String,
    pub time_created: i64,
    pub time_updated: i64,
    pub time_read: i64,
    pub time_expires: i64,
    pub data: Bytes,
}

impl StoreValue {
    pub fn new(encoding_id: impl Into<String>, timestamps: Timestamps, data: Bytes) -> Self {
        StoreValue {
            encoding_id: encoding_id.into(),
            time_created: timestamps.created,
            time_updated: timestamps.updated,
            time_read: timestamps.read,
            time_expires: timestamps.expires,
            data,
        }
    }

    pub fn timestamps(&self) -> Timestamps {
        Timestamps {
            created: self.time_created,
            updated: self.time_updated,
            read: self.time_read,
            expires: self.time_expires,
        }
    }
}

/// Error returned from [`Store`] operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// `put` on a key that is already present.
    #[error("key exists already: {0}")]
    KeyExists(String),
    /// `get`, `update` or `delete` on an absent key.
    #[error("key does not exist: {0}")]
    KeyNotFound(String),
    #[error("storage backend error: {0}")]
    Backend(#[from] redb::Error),
}

// redb surfaces distinct error types per operation; fold them all into the
// umbrella error so `?` works at call sites.
macro_rules! from_redb {
    ($($ty:ty),*) => {
        $(impl From<$ty> for StoreError {
            fn from(value: $ty) -> Self {
                StoreError::Backend(redb::Error::from(value))
            }
        })*
    };
}

from_redb!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError
);

/// An ordered key to byte-blob map with per-entry timestamps.
///
/// All writes are immediately durable from the Store's perspective;
/// transaction-scoped batching is the calling layer's concern. Writes to
/// the same key are serialized by the implementation.
pub trait Store: std::fmt::Debug + Send + Sync + 'static {
    /// Prepares the backing structure on first-ever use; a no-op if it
    /// already exists.
    fn initialize_if_necessary(&self) -> Result<(), StoreError>;

    /// Destructively re-creates the backing structure, dropping all data.
    fn initialize_hard(&self) -> Result<(), StoreError>;

    /// Inserts `value` under `key`. Fails with [`StoreError::KeyExists`] if
    /// the key is present.
    fn put(&self, key: &str, value: StoreValue) -> Result<(), StoreError>;

    /// Replaces the value under `key`. Fails with
    /// [`StoreError::KeyNotFound`] if the key is absent.
    fn update(&self, key: &str, value: StoreValue) -> Result<(), StoreError>;

    /// Inserts or replaces; never fails on existence. Returns `true` if an
    /// existing entry was updated, `false` if this was a fresh insert.
    fn put_or_update(&self, key: &str, value: StoreValue) -> Result<bool, StoreError>;

    /// Point lookup. Fails with [`StoreError::KeyNotFound`] if absent.
    fn get(&self, key: &str) -> Result<StoreValue, StoreError>;

    /// Removes the entry. Fails with [`StoreError::KeyNotFound`] if absent.
    fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Number of entries currently stored.
    fn size(&self) -> Result<u64, StoreError>;

    /// Opens a cursor over a stable snapshot of the store, ordered
    /// lexicographically by key, positioned before the first entry.
    fn cursor(&self) -> Result<StoreCursor, StoreError>;
}

/// Bidirectional cursor over a store snapshot.
///
/// The cursor sits in the gaps between entries: position `n` means the next
/// entry returned by [`next`](Self::next) is entry `n`. Entries are in the
/// store's stable total order (lexicographic by key).
#[derive(Debug, Clone)]
pub struct StoreCursor {
    entries: Vec<(String, StoreValue)>,
    position: usize,
}

impl StoreCursor {
    pub(crate) fn new(entries: Vec<(String, StoreValue)>) -> Self {
        StoreCursor {
            entries,
            position: 0,
        }
    }

    /// Moves forward, returning the entry just passed over.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<&(String, StoreValue)> {
        let entry = self.entries.get(self.position)?;
        self.position += 1;
        Some(entry)
    }

    /// Moves backward, returning the entry just passed over.
    pub fn previous(&mut self) -> Option<&(String, StoreValue)> {
        if self.position == 0 {
            return None;
        }
        self.position -= 1;
        self.entries.get(self.position)
    }

    /// Returns the entry [`next`](Self::next) would yield, without moving.
    pub fn peek_next(&self) -> Option<&(String, StoreValue)> {
        self.entries.get(self.position)
    }

    /// Returns the entry [`previous`](Self::previous) would yield, without
    /// moving.
    pub fn peek_previous(&self) -> Option<&(String, StoreValue)> {
        if self.position == 0 {
            return None;
        }
        self.entries.get(self.position - 1)
    }

    pub fn has_next(&self) -> bool {
        self.position < self.entries.len()
    }

    pub fn has_previous(&self) -> bool {
        self.position > 0
    }

    /// Positions the cursor just before the entry with `key`, so the next
    /// call to [`next`](Self::next) returns it.
    pub fn move_to(&mut self, key: &str) -> Result<(), StoreError> {
        match self.entries.iter().position(|(k, _)| k == key) {
            Some(idx) => {
                self.position = idx;
                Ok(())
            }
            None => Err(StoreError::KeyNotFound(key.to_owned())),
        }
    }

    /// Positions the cursor before the first entry.
    pub fn move_before_first(&mut self) {
        self.position = 0;
    }

    /// Positions the cursor after the last entry.
    pub fn move_after_last(&mut self) {
        self.position = self.entries.len();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
