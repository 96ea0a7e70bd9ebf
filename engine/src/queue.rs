//! Offline mutation queue.
//!
//! Writes made while offline are captured as [`Mutation`]s and appended to the
//! [`MutationQueue`]. Each entry gets a strictly increasing id that fixes its
//! replay order.
//!
//! # State machine
//!
//! ```text
//! pending ──dequeue──▶ in-flight ──mark_done──▶ done (removed)
//!    ▲                     │
//!    │                     ├──schedule_retry──▶ pending (not before next_attempt_at)
//!    │                     │
//!    └──retry_failed── failed ◀──mark_failed──┘
//! ```
//!
//! `dequeue_next` never hands out an entry while an older entry for the same
//! `(module, id)` is still held: in flight, waiting out its backoff, or
//! failed. A failed entry stalls its record until it is retried or
//! discarded, so newer writes never land before older ones.

use crate::{
    error::Result, snapshot::QueueSnapshot, ActionId, Clock, Error, Fields, Module, Record,
    RecordId, RecordKey, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// The kind of write being replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Create,
    Update,
    Delete,
}

/// HTTP method of the replayed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }
}

/// Lifecycle state of a queued action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionStatus {
    Pending,
    InFlight,
    Failed,
    Done,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::InFlight => "in-flight",
            ActionStatus::Failed => "failed",
            ActionStatus::Done => "done",
        }
    }
}

/// A write to replay against the remote, as captured at enqueue time.
///
/// `data` is kept as serialized JSON text. The queue never looks inside it;
/// it is decoded only when the action is replayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mutation {
    /// Idempotency key, stable across retries
    pub op_id: String,
    pub kind: ActionKind,
    pub module: Module,
    pub record_id: RecordId,
    pub endpoint: String,
    pub method: HttpMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

impl Mutation {
    /// Create a mutation with no payload and a fresh op id.
    pub fn new(
        kind: ActionKind,
        module: Module,
        record_id: impl Into<RecordId>,
        endpoint: impl Into<String>,
        method: HttpMethod,
    ) -> Self {
        Self {
            op_id: uuid::Uuid::new_v4().to_string(),
            kind,
            module,
            record_id: record_id.into(),
            endpoint: endpoint.into(),
            method,
            data: None,
            headers: BTreeMap::new(),
        }
    }

    /// `POST /{module}` with the full record.
    pub fn create(record: &Record) -> Result<Self> {
        Self::new(
            ActionKind::Create,
            record.module,
            record.id.clone(),
            format!("/{}", record.module),
            HttpMethod::Post,
        )
        .with_data(record)
    }

    /// `PUT /{module}/{id}` with the changed fields.
    pub fn update(module: Module, id: &str, patch: &Fields) -> Result<Self> {
        Self::new(
            ActionKind::Update,
            module,
            id,
            format!("/{module}/{id}"),
            HttpMethod::Put,
        )
        .with_data(patch)
    }

    /// `DELETE /{module}/{id}`.
    pub fn delete(module: Module, id: &str) -> Self {
        Self::new(
            ActionKind::Delete,
            module,
            id,
            format!("/{module}/{id}"),
            HttpMethod::Delete,
        )
    }

    /// Attach a payload, serialized to opaque JSON text.
    pub fn with_data<T: Serialize + ?Sized>(mut self, data: &T) -> Result<Self> {
        let text = serde_json::to_string(data).map_err(|e| Error::InvalidPayload(e.to_string()))?;
        self.data = Some(text);
        Ok(self)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.module, self.record_id.clone())
    }

    /// Decode the opaque payload.
    pub fn payload(&self) -> Result<Option<serde_json::Value>> {
        self.data
            .as_deref()
            .map(|text| {
                serde_json::from_str(text)
                    .map_err(|e| Error::InvalidPayload(format!("undecodable payload: {e}")))
            })
            .transpose()
    }
}

/// A pending mutation owned by the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedAction {
    /// Assigned at enqueue, strictly increasing; defines replay order
    pub id: ActionId,
    #[serde(flatten)]
    pub mutation: Mutation,
    pub status: ActionStatus,
    /// Dispatches so far, counted when the action is taken in flight
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub enqueued_at: Timestamp,
    /// Earliest time a scheduled retry may be dispatched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<Timestamp>,
}

impl QueuedAction {
    pub fn key(&self) -> RecordKey {
        self.mutation.key()
    }

    /// Whether the action may be dispatched at `now`.
    pub fn is_ready(&self, now: Timestamp) -> bool {
        self.status == ActionStatus::Pending && self.next_attempt_at.map_or(true, |at| at <= now)
    }

    /// Pending or in flight.
    pub fn is_outstanding(&self) -> bool {
        matches!(
            self.status,
            ActionStatus::Pending | ActionStatus::InFlight
        )
    }
}

/// Ordered log of pending mutations.
#[derive(Debug, Clone, Default)]
pub struct MutationQueue {
    entries: BTreeMap<ActionId, QueuedAction>,
    last_id: ActionId,
    capacity: Option<usize>,
}

impl MutationQueue {
    /// Create an unbounded queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a queue that refuses new entries once `capacity` are held.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::default()
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    pub fn set_capacity(&mut self, capacity: Option<usize>) {
        self.capacity = capacity;
    }

    /// Append a mutation and return its id.
    ///
    /// A full queue fails loudly instead of dropping anything.
    pub fn enqueue(&mut self, mutation: Mutation, clock: &dyn Clock) -> Result<ActionId> {
        if let Some(capacity) = self.capacity {
            if self.entries.len() >= capacity {
                return Err(Error::QueueFull { capacity });
            }
        }

        self.last_id += 1;
        let id = self.last_id;
        self.entries.insert(
            id,
            QueuedAction {
                id,
                mutation,
                status: ActionStatus::Pending,
                attempts: 0,
                last_error: None,
                enqueued_at: clock.now(),
                next_attempt_at: None,
            },
        );
        Ok(id)
    }

    /// Take the oldest dispatchable entry in flight.
    ///
    /// Skips records whose oldest entry is in flight, failed, or waiting out
    /// its backoff, so per-record order is preserved while different records
    /// can be dispatched side by side.
    pub fn dequeue_next(&mut self, clock: &dyn Clock) -> Option<QueuedAction> {
        let now = clock.now();
        let mut blocked: HashSet<RecordKey> = HashSet::new();
        let mut chosen = None;

        for (id, action) in &self.entries {
            match action.status {
                ActionStatus::Done => continue,
                ActionStatus::InFlight | ActionStatus::Failed => {
                    blocked.insert(action.key());
                }
                ActionStatus::Pending => {
                    let key = action.key();
                    if blocked.contains(&key) {
                        continue;
                    }
                    if action.is_ready(now) {
                        chosen = Some(*id);
                        break;
                    }
                    blocked.insert(key);
                }
            }
        }

        let action = self.entries.get_mut(&chosen?)?;
        action.status = ActionStatus::InFlight;
        action.attempts += 1;
        action.next_attempt_at = None;
        Some(action.clone())
    }

    /// Remove a replayed entry. Returns `false` if it was already gone, which
    /// makes a repeated `mark_done` a no-op.
    pub fn mark_done(&mut self, id: ActionId) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Park an entry as failed until someone retries it by hand.
    pub fn mark_failed(&mut self, id: ActionId, error: impl Into<String>) -> Result<&QueuedAction> {
        let action = self.entries.get_mut(&id).ok_or(Error::ActionNotFound(id))?;
        action.status = ActionStatus::Failed;
        action.last_error = Some(error.into());
        action.next_attempt_at = None;
        Ok(action)
    }

    /// Return an in-flight entry to pending, not to be dispatched before `at`.
    pub fn schedule_retry(
        &mut self,
        id: ActionId,
        error: impl Into<String>,
        at: Timestamp,
    ) -> Result<&QueuedAction> {
        let action = self.entries.get_mut(&id).ok_or(Error::ActionNotFound(id))?;
        if action.status != ActionStatus::InFlight {
            return Err(Error::InvalidTransition {
                id,
                from: action.status.as_str(),
                to: ActionStatus::Pending.as_str(),
            });
        }

        action.status = ActionStatus::Pending;
        action.last_error = Some(error.into());
        action.next_attempt_at = Some(at);
        Ok(action)
    }

    /// Give a failed entry a fresh set of attempts.
    pub fn retry_failed(&mut self, id: ActionId) -> Result<&QueuedAction> {
        let action = self.entries.get_mut(&id).ok_or(Error::ActionNotFound(id))?;
        if action.status != ActionStatus::Failed {
            return Err(Error::InvalidTransition {
                id,
                from: action.status.as_str(),
                to: ActionStatus::Pending.as_str(),
            });
        }

        action.status = ActionStatus::Pending;
        action.attempts = 0;
        action.next_attempt_at = None;
        Ok(action)
    }

    /// Drop a failed entry for good, releasing the writes queued behind it.
    pub fn discard_failed(&mut self, id: ActionId) -> Result<QueuedAction> {
        let action = self.entries.get(&id).ok_or(Error::ActionNotFound(id))?;
        if action.status != ActionStatus::Failed {
            return Err(Error::InvalidTransition {
                id,
                from: action.status.as_str(),
                to: ActionStatus::Done.as_str(),
            });
        }
        self.entries.remove(&id).ok_or(Error::ActionNotFound(id))
    }

    /// Return entries left in flight by a crash to pending. Attempt counters
    /// are kept. Returns how many were recovered.
    pub fn recover_in_flight(&mut self) -> usize {
        let mut recovered = 0;
        for action in self.entries.values_mut() {
            if action.status == ActionStatus::InFlight {
                action.status = ActionStatus::Pending;
                recovered += 1;
            }
        }
        recovered
    }

    pub fn get(&self, id: ActionId) -> Option<&QueuedAction> {
        self.entries.get(&id)
    }

    /// Entries in replay order, optionally restricted to one status.
    pub fn list(&self, status: Option<ActionStatus>) -> Vec<&QueuedAction> {
        self.entries
            .values()
            .filter(|a| status.map_or(true, |s| a.status == s))
            .collect()
    }

    /// Number of entries held, failed ones included.
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries still to be replayed (pending or in flight).
    pub fn outstanding_count(&self) -> usize {
        self.entries.values().filter(|a| a.is_outstanding()).count()
    }

    /// Whether the queue still holds any entry for `key`, failed ones
    /// included. A new write for such a record has to queue behind them.
    pub fn holds(&self, key: &RecordKey) -> bool {
        self.entries
            .values()
            .any(|a| a.mutation.module == key.module && a.mutation.record_id == key.id)
    }

    /// Earliest scheduled retry among entries at the head of their record's
    /// line. Entries waiting behind an older one for the same record do not
    /// count; they become dispatchable only after it settles.
    pub fn next_retry_at(&self) -> Option<Timestamp> {
        let mut seen: HashSet<RecordKey> = HashSet::new();
        self.entries
            .values()
            .filter(|a| seen.insert(a.key()))
            .filter(|a| a.status == ActionStatus::Pending)
            .filter_map(|a| a.next_attempt_at)
            .min()
    }

    /// Export the queue in the persisted layout.
    pub fn export(&self) -> QueueSnapshot {
        QueueSnapshot {
            format_version: crate::SNAPSHOT_FORMAT_VERSION,
            last_id: self.last_id,
            entries: self.entries.values().cloned().collect(),
        }
    }

    /// Rebuild a queue from its persisted layout.
    pub fn from_snapshot(snapshot: QueueSnapshot, capacity: Option<usize>) -> Result<Self> {
        snapshot.validate()?;

        let mut entries = BTreeMap::new();
        for action in snapshot.entries {
            if entries.insert(action.id, action).is_some() {
                return Err(Error::InvalidSnapshot("duplicate queued action id".into()));
            }
        }

        let highest = entries.keys().next_back().copied().unwrap_or(0);
        Ok(Self {
            entries,
            last_id: snapshot.last_id.max(highest),
            capacity,
        })
    }
}
