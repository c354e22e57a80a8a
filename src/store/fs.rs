//! On-disk storage backed by redb.

use std::{path::Path, sync::Arc};

use bytes::Bytes;
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};

use super::{Store, StoreCursor, StoreError, StoreValue};

// One table for all entries.
// Key: &str
// Value: (encoding_id, time_created, time_updated, time_read, time_expires, data)
type EntryValue<'a> = (&'a str, i64, i64, i64, i64, &'a [u8]);

const ENTRIES_TABLE: TableDefinition<&str, EntryValue> = TableDefinition::new("entries-1");

/// A durable [`Store`] on the local filesystem.
///
/// Every operation runs in its own redb transaction, so each write is
/// immediately durable and writes to the same key are serialized by the
/// database.
#[derive(Debug, Clone)]
pub struct FsStore {
    db: Arc<Database>,
}

impl FsStore {
    /// Opens the database at `path`, creating file and table if needed.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = Database::create(path)?;
        let store = FsStore { db: Arc::new(db) };
        store.initialize_if_necessary()?;
        Ok(store)
    }

    fn read_entry(guard: redb::AccessGuard<'_, EntryValue<'static>>) -> StoreValue {
        let (encoding_id, created, updated, read, expires, data) = guard.value();
        StoreValue {
            encoding_id: encoding_id.to_owned(),
            time_created: created,
            time_updated: updated,
            time_read: read,
            time_expires: expires,
            data: Bytes::copy_from_slice(data),
        }
    }
}

fn as_tuple(value: &StoreValue) -> EntryValue<'_> {
    (
        value.encoding_id.as_str(),
        value.time_created,
        value.time_updated,
        value.time_read,
        value.time_expires,
        value.data.as_ref(),
    )
}

impl Store for FsStore {
    fn initialize_if_necessary(&self) -> Result<(), StoreError> {
        let write_tx = self.db.begin_write()?;
        // opening creates the table if absent, keeps it untouched otherwise
        let _ = write_tx.open_table(ENTRIES_TABLE)?;
        write_tx.commit()?;
        Ok(())
    }

    fn initialize_hard(&self) -> Result<(), StoreError> {
        let write_tx = self.db.begin_write()?;
        write_tx.delete_table(ENTRIES_TABLE)?;
        let _ = write_tx.open_table(ENTRIES_TABLE)?;
        write_tx.commit()?;
        Ok(())
    }

    fn put(&self, key: &str, value: StoreValue) -> Result<(), StoreError> {
        let write_tx = self.db.begin_write()?;
        {
            let mut table = write_tx.open_table(ENTRIES_TABLE)?;
            if table.get(key)?.is_some() {
                return Err(StoreError::KeyExists(key.to_owned()));
            }
            table.insert(key, as_tuple(&value))?;
        }
        write_tx.commit()?;
        Ok(())
    }

    fn update(&self, key: &str, value: StoreValue) -> Result<(), StoreError> {
        let write_tx = self.db.begin_write()?;
        {
            let mut table = write_tx.open_table(ENTRIES_TABLE)?;
            if table.get(key)?.is_none() {
                return Err(StoreError::KeyNotFound(key.to_owned()));
            }
            table.insert(key, as_tuple(&value))?;
        }
        write_tx.commit()?;
        Ok(())
    }

    fn put_or_update(&self, key: &str, value: StoreValue) -> Result<bool, StoreError> {
        let write_tx = self.db.begin_write()?;
        let updated;
        {
            let mut table = write_tx.open_table(ENTRIES_TABLE)?;
            updated = table.insert(key, as_tuple(&value))?.is_some();
        }
        write_tx.commit()?;
        Ok(updated)
    }

    fn get(&self, key: &str) -> Result<StoreValue, StoreError> {
        let read_tx = self.db.begin_read()?;
        let table = read_tx.open_table(ENTRIES_TABLE)?;
        match table.get(key)? {
            Some(guard) => Ok(Self::read_entry(guard)),
            None => Err(StoreError::KeyNotFound(key.to_owned())),
        }
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let write_tx = self.db.begin_write()?;
        {
            let mut table = write_tx.open_table(ENTRIES_TABLE)?;
            if table.remove(key)?.is_none() {
                return Err(StoreError::KeyNotFound(key.to_owned()));
            }
        }
        write_tx.commit()?;
        Ok(())
    }

    fn size(&self) -> Result<u64, StoreError> {
        let read_tx = self.db.begin_read()?;
        let table = read_tx.open_table(ENTRIES_TABLE)?;
        Ok(table.len()?)
    }

    fn cursor(&self) -> Result<StoreCursor, StoreError> {
        let read_tx = self.db.begin_read()?;
        let table = read_tx.open_table(ENTRIES_TABLE)?;
        let mut entries = Vec::with_capacity(table.len()? as usize);
        for item in table.iter()? {
            let (key, value) = item?;
            entries.push((key.value().to_owned(), Self::read_entry(value)));
        }
        Ok(StoreCursor::new(entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::{store_contract, value};

    #[test]
    fn contract() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::create(dir.path().join("store.redb")).unwrap();
        store_contract(&store);
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.redb");
        {
            let store = FsStore::create(&path).unwrap();
            store.put("persisted", value("data")).unwrap();
        }
        let store = FsStore::create(&path).unwrap();
        assert_eq!(store.get("persisted").unwrap().data.as_ref(), b"data");
        assert_eq!(store.size().unwrap(), 1);
    }
}
