//! In-memory storage, mostly for tests and ephemeral mesh bases.

use std::{collections::BTreeMap, sync::Arc};

use parking_lot::RwLock;

use super::{Store, StoreCursor, StoreError, StoreValue};

/// A [`Store`] keeping everything in an ordered map in memory.
///
/// Cheap to clone; clones share the same underlying map.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<RwLock<BTreeMap<String, StoreValue>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn initialize_if_necessary(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn initialize_hard(&self) -> Result<(), StoreError> {
        self.entries.write().clear();
        Ok(())
    }

    fn put(&self, key: &str, value: StoreValue) -> Result<(), StoreError> {
        let mut entries = self.entries.write();
        if entries.contains_key(key) {
            return Err(StoreError::KeyExists(key.to_owned()));
        }
        entries.insert(key.to_owned(), value);
        Ok(())
    }

    fn update(&self, key: &str, value: StoreValue) -> Result<(), StoreError> {
        let mut entries = self.entries.write();
        match entries.get_mut(key) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(StoreError::KeyNotFound(key.to_owned())),
        }
    }

    fn put_or_update(&self, key: &str, value: StoreValue) -> Result<bool, StoreError> {
        let mut entries = self.entries.write();
        Ok(entries.insert(key.to_owned(), value).is_some())
    }

    fn get(&self, key: &str) -> Result<StoreValue, StoreError> {
        self.entries
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::KeyNotFound(key.to_owned()))
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        match self.entries.write().remove(key) {
            Some(_) => Ok(()),
            None => Err(StoreError::KeyNotFound(key.to_owned())),
        }
    }

    fn size(&self) -> Result<u64, StoreError> {
        Ok(self.entries.read().len() as u64)
    }

    fn cursor(&self) -> Result<StoreCursor, StoreError> {
        let entries = self
            .entries
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(StoreCursor::new(entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::store_contract;

    #[test]
    fn contract() {
        let store = MemoryStore::new();
        store_contract(&store);
    }

    #[test]
    fn clones_share_state() {
        let store = MemoryStore::new();
        let other = store.clone();
        store.put("k", crate::store::tests::value("v")).unwrap();
        assert_eq!(other.get("k").unwrap().data.as_ref(), b"v");
    }
}
