//! Record types for business entities.

use crate::{Error, RecordId, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Type-specific fields of a record.
pub type Fields = serde_json::Map<String, serde_json::Value>;

/// The entity-type stores of the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Module {
    Customers,
    Tasks,
    Okrs,
    Invoices,
    Users,
    Notifications,
}

impl Module {
    /// Every module, in a stable order.
    pub const ALL: [Module; 6] = [
        Module::Customers,
        Module::Tasks,
        Module::Okrs,
        Module::Invoices,
        Module::Users,
        Module::Notifications,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Module::Customers => "customers",
            Module::Tasks => "tasks",
            Module::Okrs => "okrs",
            Module::Invoices => "invoices",
            Module::Users => "users",
            Module::Notifications => "notifications",
        }
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Module {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Module::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| Error::UnknownModule(s.to_string()))
    }
}

/// Identifies a record across modules.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordKey {
    pub module: Module,
    pub id: RecordId,
}

impl RecordKey {
    pub fn new(module: Module, id: impl Into<RecordId>) -> Self {
        Self {
            module,
            id: id.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.module, self.id)
    }
}

/// A business entity in the local store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Unique within its module, never reassigned
    pub id: RecordId,
    /// Entity type
    #[serde(rename = "type")]
    pub module: Module,
    /// Type-specific fields
    pub fields: Fields,
    /// When the record was first created (milliseconds since epoch)
    pub created_at: Timestamp,
    /// When the record was last modified (milliseconds since epoch)
    pub updated_at: Timestamp,
}

impl Record {
    /// Create a new record stamped at `timestamp`.
    pub fn new(
        id: impl Into<RecordId>,
        module: Module,
        fields: Fields,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            module,
            fields,
            created_at: timestamp,
            updated_at: timestamp,
        }
    }

    /// Version used for conflict comparison.
    pub fn version(&self) -> Timestamp {
        self.updated_at
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.module, self.id.clone())
    }

    /// Merge `patch` into the fields. A `null` value removes the field.
    pub fn apply_patch(&mut self, patch: &Fields, timestamp: Timestamp) {
        for (name, value) in patch {
            if value.is_null() {
                self.fields.remove(name);
            } else {
                self.fields.insert(name.clone(), value.clone());
            }
        }
        self.touch(timestamp);
    }

    /// Advance `updated_at`, keeping it strictly increasing even when the
    /// clock stalls or steps backwards.
    pub fn touch(&mut self, timestamp: Timestamp) {
        self.updated_at = timestamp.max(self.updated_at.saturating_add(1));
    }
}
