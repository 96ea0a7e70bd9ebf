//! Conflict resolution between a local and a remote copy of a record.
//!
//! A conflict exists when incremental sync returns a row that is also present
//! locally. Conflicts are data, never errors: every pair resolves to a
//! concrete [`ConflictCase`].
//!
//! # Policies
//!
//! - [`MergeStrategy::LastWriteWins`]: the copy with the later `updatedAt`
//!   wins outright, ties go to the remote copy.
//! - [`MergeStrategy::FieldMerge`]: union of both field sets, the later copy
//!   wins per field (remote on ties).
//!
//! Both are pure, and the result never has an earlier `updatedAt` than
//! either input.

use crate::{Module, Record};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Merge strategy for conflict resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MergeStrategy {
    /// Later `updatedAt` wins, ties favour remote (default)
    #[default]
    LastWriteWins,
    /// Field-by-field union, later copy wins per field
    FieldMerge,
}

/// Which copy the resolver kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Local,
    Remote,
    Merged,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Local => "local",
            Resolution::Remote => "remote",
            Resolution::Merged => "merged",
        }
    }
}

/// A resolved conflict: both copies plus the outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictCase {
    pub local: Record,
    pub remote: Record,
    pub outcome: Resolution,
    /// Present only when `outcome` is `Merged`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merged: Option<Record>,
}

impl ConflictCase {
    /// The record to keep.
    pub fn winner(&self) -> &Record {
        match (self.outcome, &self.merged) {
            (Resolution::Local, _) => &self.local,
            (Resolution::Remote, _) => &self.remote,
            (Resolution::Merged, Some(merged)) => merged,
            (Resolution::Merged, None) => &self.remote,
        }
    }

    pub fn into_winner(self) -> Record {
        match self.outcome {
            Resolution::Local => self.local,
            Resolution::Remote => self.remote,
            Resolution::Merged => self.merged.unwrap_or(self.remote),
        }
    }
}

/// Resolves local/remote pairs, with an optional strategy per module.
#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    default: MergeStrategy,
    overrides: HashMap<Module, MergeStrategy>,
}

impl ConflictResolver {
    pub fn new(default: MergeStrategy) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    /// Use `strategy` for one module instead of the default.
    pub fn with_strategy(mut self, module: Module, strategy: MergeStrategy) -> Self {
        self.overrides.insert(module, strategy);
        self
    }

    pub fn strategy_for(&self, module: Module) -> MergeStrategy {
        self.overrides.get(&module).copied().unwrap_or(self.default)
    }

    /// Resolve two copies of the same record.
    ///
    /// Both must share `id` and module.
    pub fn resolve(&self, local: &Record, remote: &Record) -> ConflictCase {
        debug_assert_eq!(local.key(), remote.key());

        match self.strategy_for(local.module) {
            MergeStrategy::LastWriteWins => last_write_wins(local, remote),
            MergeStrategy::FieldMerge => field_merge(local, remote),
        }
    }
}

fn remote_is_newer(local: &Record, remote: &Record) -> bool {
    remote.updated_at >= local.updated_at
}

fn last_write_wins(local: &Record, remote: &Record) -> ConflictCase {
    let outcome = if remote_is_newer(local, remote) {
        Resolution::Remote
    } else {
        Resolution::Local
    };

    ConflictCase {
        local: local.clone(),
        remote: remote.clone(),
        outcome,
        merged: None,
    }
}

fn field_merge(local: &Record, remote: &Record) -> ConflictCase {
    let (older, newer) = if remote_is_newer(local, remote) {
        (local, remote)
    } else {
        (remote, local)
    };

    let mut fields = older.fields.clone();
    for (name, value) in &newer.fields {
        fields.insert(name.clone(), value.clone());
    }

    let merged = Record {
        id: newer.id.clone(),
        module: newer.module,
        fields,
        created_at: local.created_at.min(remote.created_at),
        updated_at: local.updated_at.max(remote.updated_at),
    };

    // A merge that reproduces one side is reported as that side.
    let (outcome, merged) = if merged == *remote {
        (Resolution::Remote, None)
    } else if merged == *local {
        (Resolution::Local, None)
    } else {
        (Resolution::Merged, Some(merged))
    };

    ConflictCase {
        local: local.clone(),
        remote: remote.clone(),
        outcome,
        merged,
    }
}
