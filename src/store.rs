use std::{collections::BTreeMap, future::Future, io};

use thiserror::Error;

use crate::protocol::{MappingKey, MappingRecord};

mod json_file;
mod memory;

pub use json_file::JsonFileStore;
pub use memory::MemoryStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store I/O failed")]
    Io(#[from] io::Error),
    #[error("store contents could not be (de)serialized")]
    Serialization(#[from] serde_json::Error),
    #[error("store holds more than one record for key {0}")]
    Corrupt(MappingKey),
    #[error("more than one record given for key {0}")]
    DuplicateKey(MappingKey),
}

/// Indexes `records` by key. Returns the first key that appears twice.
fn index_by_key<'a>(
    records: impl IntoIterator<Item = &'a MappingRecord>,
) -> Result<BTreeMap<MappingKey, MappingRecord>, MappingKey> {
    let mut by_key = BTreeMap::new();
    for record in records {
        if by_key.insert(record.key.clone(), record.clone()).is_some() {
            return Err(record.key.clone());
        }
    }
    Ok(by_key)
}

/// Durable home of the mapping records. The registry is rebuilt from it on start.
///
/// Every call is its own transaction. Implementations serialize all access
/// behind one lock per store.
pub trait MappingStore: Send + Sync {
    /// Inserts or overwrites the record stored under `record.key`.
    fn put(&self, record: &MappingRecord)
        -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Removes the record under `key`. Removing an absent key is not an error.
    fn delete(&self, key: &MappingKey) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Every stored record, ordered by key.
    fn get_all(&self) -> impl Future<Output = Result<Vec<MappingRecord>, StoreError>> + Send;

    /// Atomically swaps the whole record set for `records`.
    ///
    /// A key given twice fails with [`StoreError::DuplicateKey`]. On failure the
    /// previous set is left untouched.
    fn replace_all(
        &self,
        records: &[MappingRecord],
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}
