use std::{
    collections::{BTreeMap, HashMap},
    io,
    net::SocketAddr,
    sync::MutexGuard,
};

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    lifecycle::{ActiveMapping, ForwardOptions, LifecycleState, Route, RouteSource},
    mux::RouteTable,
    protocol::{AddressError, MappingKey, MappingRecord, TunnelId},
    store::{MappingStore, StoreError},
};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("mapping key {0} is already used")]
    KeyAlreadyUsed(MappingKey),
    #[error("mapping key {0} not found")]
    KeyNotFound(MappingKey),
    #[error(transparent)]
    InvalidAddress(#[from] AddressError),
    #[error("failed to listen on port {port}")]
    BindFailed {
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("failed to persist mapping change")]
    Persistence(#[from] StoreError),
}

/// Outcome of reseeding the registry from its store.
#[derive(Debug, Default)]
pub struct RestoreReport {
    pub restored: usize,
    /// Records that stayed in the store but could not be started.
    pub failed: Vec<MappingRecord>,
}

/// The live set of mappings, kept consistent with its store.
///
/// One lock serializes every operation on the table. Mutations hit the store
/// before they touch the table, and a failed store write leaves the table as
/// it was. Identifier lookups from the multiplex listener go through a separate
/// route map that is never held across an await, so they do not queue behind
/// a slow add or delete.
pub struct Registry<S> {
    store: S,
    options: ForwardOptions,
    mappings: Mutex<BTreeMap<MappingKey, ActiveMapping>>,
    routes: std::sync::Mutex<HashMap<TunnelId, RouteSource>>,
}

impl<S> Registry<S>
where
    S: MappingStore,
{
    pub fn new(store: S, options: ForwardOptions) -> Self {
        Registry {
            store,
            options,
            mappings: Mutex::new(BTreeMap::new()),
            routes: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn options(&self) -> &ForwardOptions {
        &self.options
    }

    fn routes(&self) -> MutexGuard<'_, HashMap<TunnelId, RouteSource>> {
        self.routes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, mapping: &ActiveMapping) {
        if let (Some(id), Some(source)) = (mapping.key().tunnel_id(), mapping.route_source()) {
            self.routes().insert(id.clone(), source);
        }
    }

    fn unpublish(&self, key: &MappingKey) {
        if let Some(id) = key.tunnel_id() {
            self.routes().remove(id);
        }
    }

    async fn activate(
        &self,
        record: MappingRecord,
        target: SocketAddr,
    ) -> Result<ActiveMapping, RegistryError> {
        let mut mapping = ActiveMapping::new(record, target);
        if let Err(source) = mapping.start(&self.options).await {
            return Err(RegistryError::BindFailed {
                port: mapping.key().port().unwrap_or_default(),
                source,
            });
        }
        Ok(mapping)
    }

    /// Validates, starts and persists a new mapping.
    ///
    /// The mapping is only registered once it is running and stored; on any
    /// failure whatever was acquired (e.g. the bound port) is released. The
    /// target is resolved before the table is locked.
    pub async fn add(&self, record: MappingRecord) -> Result<(), RegistryError> {
        if self.mappings.lock().await.contains_key(&record.key) {
            return Err(RegistryError::KeyAlreadyUsed(record.key));
        }
        let target = record.resolve_target().await?;

        let mut mappings = self.mappings.lock().await;
        if mappings.contains_key(&record.key) {
            return Err(RegistryError::KeyAlreadyUsed(record.key));
        }

        let mut mapping = self.activate(record, target).await?;
        if let Err(err) = self.store.put(mapping.record()).await {
            mapping.stop_accepting().await;
            drop(mappings);
            mapping.wait_stopped().await;
            return Err(err.into());
        }

        self.publish(&mapping);
        mappings.insert(mapping.key().clone(), mapping);
        Ok(())
    }

    /// Removes a mapping from the store and the table, then stops it.
    ///
    /// Returns once every session of the mapping has finished. The lock is only
    /// held until the mapping stops accepting, so draining sessions do not
    /// block other registry calls.
    pub async fn delete(&self, key: &MappingKey) -> Result<MappingRecord, RegistryError> {
        let mut mappings = self.mappings.lock().await;
        let Some(mut mapping) = mappings.remove(key) else {
            return Err(RegistryError::KeyNotFound(key.clone()));
        };

        if let Err(err) = self.store.delete(key).await {
            mappings.insert(key.clone(), mapping);
            return Err(err.into());
        }

        self.unpublish(key);
        mapping.stop_accepting().await;
        drop(mappings);
        mapping.wait_stopped().await;
        Ok(mapping.record().clone())
    }

    /// A snapshot of the current mapping records, ordered by key.
    pub async fn list(&self) -> Vec<MappingRecord> {
        let mappings = self.mappings.lock().await;
        mappings
            .values()
            .map(|mapping| mapping.record().clone())
            .collect()
    }

    pub async fn get(&self, key: &MappingKey) -> Option<MappingRecord> {
        let mappings = self.mappings.lock().await;
        mappings.get(key).map(|mapping| mapping.record().clone())
    }

    pub async fn state(&self, key: &MappingKey) -> Option<LifecycleState> {
        let mappings = self.mappings.lock().await;
        mappings.get(key).map(ActiveMapping::state)
    }

    /// Starts every record in the store without writing back to it.
    ///
    /// A record that fails to resolve or bind is logged and skipped; it stays
    /// in the store.
    pub async fn restore(&self) -> Result<RestoreReport, RegistryError> {
        let records = self.store.get_all().await?;
        let mut report = RestoreReport::default();

        for record in records {
            let target = match record.resolve_target().await {
                Ok(target) => target,
                Err(err) => {
                    warn!("failed to map {} -> {}: {}", record.key, record.target, err);
                    report.failed.push(record);
                    continue;
                }
            };

            let mut mappings = self.mappings.lock().await;
            if mappings.contains_key(&record.key) {
                debug!("mapping {} is already running", record.key);
                continue;
            }
            match self.activate(record.clone(), target).await {
                Ok(mapping) => {
                    info!("map {} -> {} OK", record.key, record.target);
                    self.publish(&mapping);
                    mappings.insert(record.key, mapping);
                    report.restored += 1;
                }
                Err(err) => {
                    warn!("failed to map {} -> {}: {}", record.key, record.target, err);
                    report.failed.push(record);
                }
            }
        }
        Ok(report)
    }

    /// Adds each record whose key is not registered yet. Failures are logged
    /// and skipped. Returns how many records were added.
    pub async fn add_missing(&self, records: impl IntoIterator<Item = MappingRecord>) -> usize {
        let mut added = 0;
        for record in records {
            let key = record.key.clone();
            match self.add(record).await {
                Ok(()) => added += 1,
                Err(RegistryError::KeyAlreadyUsed(_)) => debug!("mapping {} already present", key),
                Err(err) => warn!("failed to add mapping {}: {}", key, err),
            }
        }
        added
    }

    /// Overwrites the store with exactly the mappings that are live now.
    pub async fn sync_store(&self) -> Result<(), RegistryError> {
        let mappings = self.mappings.lock().await;
        let records: Vec<MappingRecord> = mappings
            .values()
            .map(|mapping| mapping.record().clone())
            .collect();
        self.store.replace_all(&records).await?;
        Ok(())
    }

    /// Stops every mapping and waits for all of them to drain. The store is not touched.
    pub async fn shutdown(&self) {
        let mut mappings = self.mappings.lock().await;
        let mut stopping: Vec<ActiveMapping> = std::mem::take(&mut *mappings).into_values().collect();
        self.routes().clear();
        for mapping in stopping.iter_mut() {
            mapping.stop_accepting().await;
        }
        drop(mappings);

        for mapping in stopping.iter_mut() {
            mapping.wait_stopped().await;
        }
        info!("all mappings stopped");
    }
}

impl<S> RouteTable for Registry<S>
where
    S: MappingStore,
{
    async fn route(&self, id: &TunnelId) -> Option<Route> {
        self.routes().get(id).and_then(RouteSource::route)
    }
}
