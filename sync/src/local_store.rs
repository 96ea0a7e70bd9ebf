//! Thread-safe record store that writes through to durable storage.
//!
//! Every mutation runs under one lock and returns only after the touched
//! modules are persisted, so a later `get` or `list` always sees it. If the
//! write fails the in-memory change is rolled back.

use crate::error::Result;
use crate::remote::ChangeSet;
use crate::storage::Storage;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tether_engine::{
    module_key, Clock, ConflictCase, ConflictResolver, Error, Fields, Module, ModuleSnapshot,
    Record, Schema, Store,
};
use tokio::sync::Mutex;

/// What applying a remote change set did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppliedChanges {
    /// Remote rows stored without a local counterpart
    pub inserted: usize,
    /// Rows present on both sides, after resolution
    pub conflicts: Vec<ConflictCase>,
    /// Local records removed by tombstones
    pub deleted: usize,
}

/// Durable handle over a [`Store`].
#[derive(Debug)]
pub struct LocalStore {
    store: Mutex<Store>,
    schema: Schema,
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
}

impl LocalStore {
    pub fn new(schema: Schema, storage: Arc<dyn Storage>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store: Mutex::new(Store::new(schema.clone())),
            schema,
            storage,
            clock,
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Replace in-memory state with what is persisted. Returns the number of
    /// records loaded.
    pub async fn load(&self) -> Result<usize> {
        let mut snapshots = Vec::with_capacity(Module::ALL.len());
        for module in Module::ALL {
            let snapshot = match self.storage.read(&module_key(module)).await? {
                Some(json) => ModuleSnapshot::from_json(&json)?,
                None => ModuleSnapshot::new(module),
            };
            if snapshot.module != module {
                return Err(Error::InvalidSnapshot(format!(
                    "{} document holds {} records",
                    module_key(module),
                    snapshot.module
                ))
                .into());
            }
            snapshots.push(snapshot);
        }

        let mut store = self.store.lock().await;
        let mut loaded = 0;
        for snapshot in snapshots {
            loaded += snapshot.record_count();
            store.import_module(snapshot)?;
        }

        tracing::debug!(records = loaded, "local store loaded");
        Ok(loaded)
    }

    pub async fn create(&self, module: Module, fields: Fields) -> Result<Record> {
        let record = self
            .mutate(&[module], |store, clock| store.create(module, fields, clock))
            .await?;
        tracing::debug!(module = %module, record_id = %record.id, "record created");
        Ok(record)
    }

    pub async fn create_with_id(
        &self,
        module: Module,
        id: impl Into<String>,
        fields: Fields,
    ) -> Result<Record> {
        let id = id.into();
        self.mutate(&[module], |store, clock| {
            store.create_with_id(module, id, fields, clock)
        })
        .await
    }

    /// Merge `patch` into a record. Fails with `NotFound` if it is absent.
    pub async fn update(&self, module: Module, id: &str, patch: &Fields) -> Result<Record> {
        let record = self
            .mutate(&[module], |store, clock| store.update(module, id, patch, clock))
            .await?;
        tracing::debug!(module = %module, record_id = %id, "record updated");
        Ok(record)
    }

    /// Delete a record. Fails with `NotFound` if it is absent.
    pub async fn remove(&self, module: Module, id: &str) -> Result<Record> {
        let record = self
            .mutate(&[module], |store, _| store.remove(module, id))
            .await?;
        tracing::debug!(module = %module, record_id = %id, "record removed");
        Ok(record)
    }

    /// Create several records; all are committed or none.
    pub async fn batch_create(&self, module: Module, drafts: Vec<Fields>) -> Result<Vec<Record>> {
        self.mutate(&[module], |store, clock| {
            store.batch_create(module, drafts, clock)
        })
        .await
    }

    pub async fn get(&self, module: Module, id: &str) -> Option<Record> {
        self.store.lock().await.get(module, id).cloned()
    }

    /// Records of a module matching `predicate`, in creation order.
    pub async fn list<F>(&self, module: Module, predicate: F) -> Vec<Record>
    where
        F: Fn(&Record) -> bool,
    {
        let store = self.store.lock().await;
        store
            .query(module)
            .filter(predicate)
            .all()
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn count(&self, module: Module) -> usize {
        self.store.lock().await.count(module)
    }

    /// Apply remote rows and tombstones. Rows that also exist locally go
    /// through `resolver`; identical copies are skipped.
    pub async fn apply_remote(
        &self,
        changes: &ChangeSet,
        resolver: &ConflictResolver,
    ) -> Result<AppliedChanges> {
        let touched: BTreeSet<Module> = changes
            .records
            .iter()
            .map(|r| r.module)
            .chain(changes.deleted.iter().map(|t| t.module))
            .collect();
        let touched: Vec<Module> = touched.into_iter().collect();

        self.mutate(&touched, |store, _| {
            let mut applied = AppliedChanges::default();

            for remote in &changes.records {
                match store.get(remote.module, &remote.id) {
                    None => {
                        store.put(remote.clone());
                        applied.inserted += 1;
                    }
                    Some(local) if local == remote => {}
                    Some(local) => {
                        let case = resolver.resolve(local, remote);
                        store.put(case.winner().clone());
                        applied.conflicts.push(case);
                    }
                }
            }

            for tombstone in &changes.deleted {
                if store.apply_tombstone(tombstone.module, &tombstone.id, tombstone.deleted_at) {
                    applied.deleted += 1;
                }
            }

            Ok(applied)
        })
        .await
    }

    /// Run `f` under the lock, persist `modules`, roll back on failure.
    async fn mutate<T, F>(&self, modules: &[Module], f: F) -> Result<T>
    where
        F: FnOnce(&mut Store, &dyn Clock) -> tether_engine::error::Result<T>,
    {
        let mut store = self.store.lock().await;
        let before: BTreeMap<Module, ModuleSnapshot> = modules
            .iter()
            .map(|&m| (m, store.export_module(m)))
            .collect();

        let value = f(&mut store, self.clock.as_ref())?;

        for (written, &module) in modules.iter().enumerate() {
            let json = store.export_module(module).to_json()?;
            if let Err(e) = self.storage.write(&module_key(module), json).await {
                tracing::warn!(module = %module, error = %e, "persist failed, rolling back");
                for &restored in &modules[..written] {
                    let json = before[&restored].to_json()?;
                    if let Err(e) = self.storage.write(&module_key(restored), json).await {
                        tracing::error!(module = %restored, error = %e, "rollback persist failed");
                    }
                }
                for snapshot in before.into_values() {
                    store.import_module(snapshot)?;
                }
                return Err(e.into());
            }
        }

        Ok(value)
    }
}
