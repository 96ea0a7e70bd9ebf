//! Persisted layout of the store, the queue and the sync cursor.
//!
//! Each module is stored as its own document with records indexed by id, so a
//! single write only touches the module that changed. Maps are `BTreeMap`s so
//! the same state always serializes to the same bytes.

use crate::{error::Result, ActionId, Error, Module, QueuedAction, Record, RecordId, Timestamp};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version of the persisted format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Storage key of the queue document.
pub const QUEUE_KEY: &str = "queue";

/// Storage key of the sync cursor document.
pub const SYNC_STATE_KEY: &str = "sync-state";

/// Storage key of a module's records document.
pub fn module_key(module: Module) -> String {
    format!("records.{module}")
}

/// All records of one module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleSnapshot {
    pub format_version: u32,
    pub module: Module,
    pub records: BTreeMap<RecordId, Record>,
}

impl ModuleSnapshot {
    pub fn new(module: Module) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            module,
            records: BTreeMap::new(),
        }
    }

    pub fn add_record(&mut self, record: Record) {
        self.records.insert(record.id.clone(), record);
    }

    pub fn get_record(&self, id: &str) -> Option<&Record> {
        self.records.get(id)
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Check that every record belongs here and is indexed under its own id.
    pub fn validate(&self) -> Result<()> {
        check_format_version(self.format_version)?;

        for (id, record) in &self.records {
            if record.module != self.module {
                return Err(Error::InvalidSnapshot(format!(
                    "{} record {} found in {} snapshot",
                    record.module, record.id, self.module
                )));
            }
            if *id != record.id {
                return Err(Error::InvalidSnapshot(format!(
                    "record {} indexed under {id}",
                    record.id
                )));
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        encode(self)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self = decode(json)?;
        check_format_version(snapshot.format_version)?;
        Ok(snapshot)
    }
}

/// The mutation queue, including the last assigned id so ids keep increasing
/// across restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    pub format_version: u32,
    pub last_id: ActionId,
    pub entries: Vec<QueuedAction>,
}

impl Default for QueueSnapshot {
    fn default() -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            last_id: 0,
            entries: Vec::new(),
        }
    }
}

impl QueueSnapshot {
    pub fn validate(&self) -> Result<()> {
        check_format_version(self.format_version)?;

        if let Some(action) = self.entries.iter().find(|a| a.id > self.last_id) {
            return Err(Error::InvalidSnapshot(format!(
                "queued action {} is newer than last assigned id {}",
                action.id, self.last_id
            )));
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        encode(self)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self = decode(json)?;
        check_format_version(snapshot.format_version)?;
        Ok(snapshot)
    }
}

/// Where the last pull from the remote left off.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCursor {
    pub format_version: u32,
    /// Remote-issued cursor; `None` means pull everything
    #[serde(default)]
    pub cursor: Option<Timestamp>,
    #[serde(default)]
    pub last_synced_at: Option<Timestamp>,
}

impl Default for SyncCursor {
    fn default() -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            cursor: None,
            last_synced_at: None,
        }
    }
}

impl SyncCursor {
    /// Move the cursor forward. A cursor older than the current one is ignored.
    pub fn advance(&mut self, cursor: Timestamp, synced_at: Timestamp) {
        self.cursor = Some(self.cursor.map_or(cursor, |current| current.max(cursor)));
        self.last_synced_at = Some(synced_at);
    }

    pub fn to_json(&self) -> Result<String> {
        encode(self)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let cursor: Self = decode(json)?;
        check_format_version(cursor.format_version)?;
        Ok(cursor)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| Error::InvalidSnapshot(e.to_string()))
}

fn decode<T: DeserializeOwned>(json: &str) -> Result<T> {
    serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))
}

fn check_format_version(version: u32) -> Result<()> {
    if version > SNAPSHOT_FORMAT_VERSION {
        return Err(Error::InvalidSnapshot(format!(
            "unsupported snapshot format version: {version} (max supported: {SNAPSHOT_FORMAT_VERSION})"
        )));
    }
    Ok(())
}
