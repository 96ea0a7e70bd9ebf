//! Store - the in-memory record container.
//!
//! The Store holds every record, grouped by module. It is the single source of
//! truth for the UI while offline: every mutation is visible to the next read.

use crate::{
    error::Result, snapshot::ModuleSnapshot, Clock, Error, Fields, Module, Record, RecordId,
    Schema, Timestamp,
};
use std::collections::HashMap;

/// The records of one module.
#[derive(Debug, Clone, Default)]
pub struct Collection {
    records: HashMap<RecordId, Record>,
}

impl Collection {
    pub fn new() -> Self {
        Self {
            records: HashMap::new(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&Record> {
        self.records.get(id)
    }

    pub fn insert(&mut self, record: Record) {
        self.records.insert(record.id.clone(), record);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// The main store holding all records.
///
/// `remove` is strict: deleting a missing id fails with [`Error::NotFound`],
/// the same as `update`.
#[derive(Debug, Clone)]
pub struct Store {
    schema: Schema,
    collections: HashMap<Module, Collection>,
}

impl Store {
    /// Create an empty store with a collection for every module.
    pub fn new(schema: Schema) -> Self {
        let collections = Module::ALL
            .into_iter()
            .map(|m| (m, Collection::new()))
            .collect();

        Self {
            schema,
            collections,
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    fn collection_mut(&mut self, module: Module) -> &mut Collection {
        self.collections.entry(module).or_default()
    }

    /// Create a record with a freshly generated id.
    pub fn create(&mut self, module: Module, fields: Fields, clock: &dyn Clock) -> Result<Record> {
        let id = uuid::Uuid::new_v4().to_string();
        self.create_with_id(module, id, fields, clock)
    }

    /// Create a record under a caller-chosen id.
    pub fn create_with_id(
        &mut self,
        module: Module,
        id: impl Into<RecordId>,
        fields: Fields,
        clock: &dyn Clock,
    ) -> Result<Record> {
        let id = id.into();
        self.schema.validate_fields(module, &fields)?;

        let collection = self.collection_mut(module);
        if collection.contains(&id) {
            return Err(Error::RecordAlreadyExists { module, id });
        }

        let record = Record::new(id, module, fields, clock.now());
        collection.insert(record.clone());
        Ok(record)
    }

    /// Merge `patch` into an existing record.
    pub fn update(
        &mut self,
        module: Module,
        id: &str,
        patch: &Fields,
        clock: &dyn Clock,
    ) -> Result<Record> {
        self.schema.validate_patch(module, patch)?;

        let record = self
            .collection_mut(module)
            .records
            .get_mut(id)
            .ok_or_else(|| Error::NotFound {
                module,
                id: id.to_string(),
            })?;

        record.apply_patch(patch, clock.now());
        Ok(record.clone())
    }

    /// Delete a record, returning what was removed.
    pub fn remove(&mut self, module: Module, id: &str) -> Result<Record> {
        self.collection_mut(module)
            .records
            .remove(id)
            .ok_or_else(|| Error::NotFound {
                module,
                id: id.to_string(),
            })
    }

    /// Create several records atomically: if any fails validation, none are
    /// committed.
    pub fn batch_create(
        &mut self,
        module: Module,
        drafts: Vec<Fields>,
        clock: &dyn Clock,
    ) -> Result<Vec<Record>> {
        for fields in &drafts {
            self.schema.validate_fields(module, fields)?;
        }

        let now = clock.now();
        let records: Vec<Record> = drafts
            .into_iter()
            .map(|fields| Record::new(uuid::Uuid::new_v4().to_string(), module, fields, now))
            .collect();

        let collection = self.collection_mut(module);
        for record in &records {
            collection.insert(record.clone());
        }

        Ok(records)
    }

    pub fn get(&self, module: Module, id: &str) -> Option<&Record> {
        self.collections.get(&module).and_then(|c| c.get(id))
    }

    pub fn count(&self, module: Module) -> usize {
        self.collections.get(&module).map_or(0, Collection::len)
    }

    /// Query records in a module.
    pub fn query(&self, module: Module) -> QueryBuilder<'_> {
        QueryBuilder::new(self.collections.get(&module))
    }

    /// Store a record exactly as given, keeping its timestamps.
    ///
    /// Used for remote rows and conflict outcomes, which already carry an
    /// authoritative `updated_at`.
    pub fn put(&mut self, record: Record) {
        self.collection_mut(record.module).insert(record);
    }

    /// Apply a remote deletion unless the local copy changed after it.
    ///
    /// Returns whether a record was removed.
    pub fn apply_tombstone(&mut self, module: Module, id: &str, deleted_at: Timestamp) -> bool {
        let collection = self.collection_mut(module);
        let edited_after = match collection.get(id) {
            Some(local) => local.updated_at > deleted_at,
            None => return false,
        };
        !edited_after && collection.records.remove(id).is_some()
    }

    /// Export one module's records in the persisted layout.
    pub fn export_module(&self, module: Module) -> ModuleSnapshot {
        let mut snapshot = ModuleSnapshot::new(module);
        if let Some(collection) = self.collections.get(&module) {
            for record in collection.records() {
                snapshot.add_record(record.clone());
            }
        }
        snapshot
    }

    /// Replace one module's records with the snapshot's.
    pub fn import_module(&mut self, snapshot: ModuleSnapshot) -> Result<()> {
        snapshot.validate()?;

        let mut collection = Collection::new();
        for (_, record) in snapshot.records {
            collection.insert(record);
        }
        self.collections.insert(snapshot.module, collection);
        Ok(())
    }
}

/// Builder for querying records in a module.
///
/// Results are ordered by creation time, then id, so listings are stable.
pub struct QueryBuilder<'a> {
    collection: Option<&'a Collection>,
    predicate: Option<Box<dyn Fn(&Record) -> bool + 'a>>,
}

impl<'a> QueryBuilder<'a> {
    fn new(collection: Option<&'a Collection>) -> Self {
        Self {
            collection,
            predicate: None,
        }
    }

    /// Keep only records matching `predicate`.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Record) -> bool + 'a,
    {
        self.predicate = Some(Box::new(predicate));
        self
    }

    /// Get all matching records.
    pub fn all(self) -> Vec<&'a Record> {
        let Some(collection) = self.collection else {
            return Vec::new();
        };

        let mut records: Vec<&Record> = match &self.predicate {
            Some(predicate) => collection.records().filter(|r| predicate(*r)).collect(),
            None => collection.records().collect(),
        };
        records.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        records
    }

    /// Get the first matching record.
    pub fn first(self) -> Option<&'a Record> {
        self.all().into_iter().next()
    }

    /// Count matching records.
    pub fn count(self) -> usize {
        match (&self.predicate, self.collection) {
            (_, None) => 0,
            (None, Some(collection)) => collection.len(),
            (Some(predicate), Some(collection)) => {
                collection.records().filter(|r| predicate(*r)).count()
            }
        }
    }
}
