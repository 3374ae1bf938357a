use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard},
};

use crate::protocol::{MappingKey, MappingRecord};

use super::{index_by_key, MappingStore, StoreError};

/// A store that lives and dies with the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<MappingKey, MappingRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, BTreeMap<MappingKey, MappingRecord>> {
        // a panic while holding the lock cannot leave the map half-updated
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl MappingStore for MemoryStore {
    async fn put(&self, record: &MappingRecord) -> Result<(), StoreError> {
        self.records().insert(record.key.clone(), record.clone());
        Ok(())
    }

    async fn delete(&self, key: &MappingKey) -> Result<(), StoreError> {
        self.records().remove(key);
        Ok(())
    }

    async fn get_all(&self) -> Result<Vec<MappingRecord>, StoreError> {
        Ok(self.records().values().cloned().collect())
    }

    async fn replace_all(&self, records: &[MappingRecord]) -> Result<(), StoreError> {
        let replacement = index_by_key(records).map_err(StoreError::DuplicateKey)?;
        *self.records() = replacement;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(key: &str, target: &str) -> MappingRecord {
        MappingRecord::new(key.parse::<MappingKey>().unwrap(), target)
    }

    #[tokio::test]
    async fn put_overwrites_and_delete_is_quiet() {
        let store = MemoryStore::new();
        store.put(&record("8001", "127.0.0.1:1")).await.unwrap();
        store.put(&record("8001", "127.0.0.1:2")).await.unwrap();
        assert_eq!(
            store.get_all().await.unwrap(),
            vec![record("8001", "127.0.0.1:2")]
        );

        store.delete(&"8001".parse().unwrap()).await.unwrap();
        store.delete(&"8001".parse().unwrap()).await.unwrap();
        assert!(store.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn replace_all_drops_previous_records() {
        let store = MemoryStore::new();
        store.put(&record("old", "127.0.0.1:1")).await.unwrap();

        let new = vec![record("8001", "127.0.0.1:2"), record("abc", "127.0.0.1:3")];
        store.replace_all(&new).await.unwrap();
        assert_eq!(store.get_all().await.unwrap(), new);
    }

    #[tokio::test]
    async fn replace_all_refuses_duplicate_keys() {
        let store = MemoryStore::new();
        store.put(&record("abc", "127.0.0.1:1")).await.unwrap();

        let res = store
            .replace_all(&[record("8001", "127.0.0.1:1"), record("8001", "127.0.0.1:2")])
            .await;
        assert!(matches!(res, Err(StoreError::DuplicateKey(key)) if key.port() == Some(8001)));
        assert_eq!(
            store.get_all().await.unwrap(),
            vec![record("abc", "127.0.0.1:1")]
        );
    }
}
