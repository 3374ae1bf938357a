use std::{
    collections::BTreeMap,
    ffi::OsString,
    io,
    path::{Path, PathBuf},
};

use tokio::{fs, io::AsyncWriteExt, sync::Mutex};
use tracing::{debug, warn};

use crate::protocol::{MappingKey, MappingRecord};

use super::{index_by_key, MappingStore, StoreError};

/// Keeps the records as a JSON array in a single file.
///
/// Every mutation rewrites the file through a sibling temporary file and an
/// atomic rename, so a crash mid-write leaves either the old or the new
/// contents on disk, never a mix.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    /// Opens the store at `path`, creating the parent directory and an empty
    /// record set when nothing is there yet. Existing contents are validated.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let store = JsonFileStore {
            path,
            lock: Mutex::new(()),
        };
        match fs::metadata(&store.path).await {
            Ok(_) => {
                let records = store.load().await?;
                debug!("opened store {:?} with {} records", store.path, records.len());
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                store.commit(&BTreeMap::new()).await?;
                debug!("created empty store {:?}", store.path);
            }
            Err(err) => return Err(err.into()),
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(".tmp");
        PathBuf::from(name)
    }

    async fn load(&self) -> Result<BTreeMap<MappingKey, MappingRecord>, StoreError> {
        let content = match fs::read(&self.path).await {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(err) => return Err(err.into()),
        };
        let records: Vec<MappingRecord> = serde_json::from_slice(&content)?;
        index_by_key(&records).map_err(StoreError::Corrupt)
    }

    async fn commit(&self, records: &BTreeMap<MappingKey, MappingRecord>) -> Result<(), StoreError> {
        let records: Vec<&MappingRecord> = records.values().collect();
        let content = serde_json::to_vec_pretty(&records)?;

        let temp = self.temp_path();
        let written = async {
            let mut file = fs::File::create(&temp).await?;
            file.write_all(&content).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&temp, &self.path).await
        }
        .await;

        if let Err(err) = written {
            if let Err(cleanup) = fs::remove_file(&temp).await {
                if cleanup.kind() != io::ErrorKind::NotFound {
                    warn!("failed to remove {:?}: {}", temp, cleanup);
                }
            }
            return Err(err.into());
        }
        Ok(())
    }
}

impl MappingStore for JsonFileStore {
    async fn put(&self, record: &MappingRecord) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut records = self.load().await?;
        records.insert(record.key.clone(), record.clone());
        self.commit(&records).await
    }

    async fn delete(&self, key: &MappingKey) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut records = self.load().await?;
        if records.remove(key).is_none() {
            return Ok(());
        }
        self.commit(&records).await
    }

    async fn get_all(&self) -> Result<Vec<MappingRecord>, StoreError> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.into_values().collect())
    }

    async fn replace_all(&self, records: &[MappingRecord]) -> Result<(), StoreError> {
        let replacement = index_by_key(records).map_err(StoreError::DuplicateKey)?;
        let _guard = self.lock.lock().await;
        self.commit(&replacement).await
    }
}
