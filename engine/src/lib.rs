//! # Tether Engine
//!
//! The deterministic core of an offline-first dashboard: a local record store,
//! a durable queue of pending mutations, and last-write-wins conflict resolution.
//!
//! This crate holds state and rules only. Persistence, network calls and
//! scheduling live in `tether-sync`, which drives these types from an async
//! runtime.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine never touches files, sockets or timers
//! - **Injected time**: every timestamp comes from a [`Clock`] or the caller
//! - **Deterministic**: the same inputs produce the same records, queue order
//!   and conflict outcomes
//!
//! ## Core Concepts
//!
//! ### Records
//!
//! Business entities (customers, tasks, OKRs, invoices, users, notifications)
//! are [`Record`]s keyed by [`Module`] and id. `updatedAt` strictly increases on
//! every local mutation and doubles as the record version.
//!
//! ### Mutation queue
//!
//! Writes captured while offline become [`QueuedAction`]s in a
//! [`MutationQueue`]. Ids are strictly increasing and define replay order. At
//! most one action per `(module, id)` is in flight at any time.
//!
//! ### Conflict resolution
//!
//! The [`ConflictResolver`] pairs a local and a remote copy of a record and
//! produces a [`ConflictCase`]. The default policy is last-write-wins by
//! `updatedAt`, with ties going to the remote copy.
//!
//! ## Quick Start
//!
//! ```rust
//! use tether_engine::{ManualClock, Module, Mutation, MutationQueue, Schema, Store};
//! use serde_json::json;
//!
//! let clock = ManualClock::new(1_706_745_600_000);
//! let mut store = Store::new(Schema::dashboard());
//!
//! // Optimistic local write
//! let fields = json!({"title": "Prepare Q3 board deck"});
//! let task = store
//!     .create(Module::Tasks, fields.as_object().unwrap().clone(), &clock)
//!     .unwrap();
//!
//! // Captured for replay while offline
//! let mut queue = MutationQueue::new();
//! let id = queue.enqueue(Mutation::create(&task).unwrap(), &clock).unwrap();
//!
//! let next = queue.dequeue_next(&clock).unwrap();
//! assert_eq!(next.id, id);
//! assert!(queue.mark_done(id));
//! assert_eq!(queue.size(), 0);
//! ```
//!
//! ## Persistence
//!
//! [`ModuleSnapshot`] and [`QueueSnapshot`] are the persisted layout: one JSON
//! document per module with records indexed by id, plus one for the queue.

pub mod clock;
pub mod conflict;
pub mod error;
pub mod queue;
pub mod record;
pub mod retry;
pub mod schema;
pub mod snapshot;
pub mod stats;
pub mod store;

// Re-export main types at crate root
pub use clock::{Clock, ManualClock, SystemClock};
pub use conflict::{ConflictCase, ConflictResolver, MergeStrategy, Resolution};
pub use error::Error;
pub use queue::{ActionKind, ActionStatus, HttpMethod, Mutation, MutationQueue, QueuedAction};
pub use record::{Fields, Module, Record, RecordKey};
pub use retry::RetryPolicy;
pub use schema::{FieldDef, FieldType, ModuleSchema, Schema};
pub use snapshot::{
    module_key, ModuleSnapshot, QueueSnapshot, SyncCursor, QUEUE_KEY, SNAPSHOT_FORMAT_VERSION,
    SYNC_STATE_KEY,
};
pub use stats::{ReplayOutcome, SyncLog, SyncStatistics};
pub use store::{Collection, QueryBuilder, Store};

/// Type aliases for clarity
pub type RecordId = String;
pub type ActionId = u64;
/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;
