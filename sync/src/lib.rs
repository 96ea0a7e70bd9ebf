//! # Tether Sync
//!
//! Async runtime around `tether-engine`: durable storage, the remote REST
//! client, debounced connectivity, and the [`SyncOrchestrator`] that replays
//! queued writes and pulls remote changes.
//!
//! ## Wiring
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tether_engine::{ConflictResolver, Schema};
//! use tether_sync::{
//!     Components, Config, ConnectivityMonitor, EventBus, HttpRemote, MemoryStorage, RuntimeClock,
//!     SyncOrchestrator,
//! };
//!
//! # async fn run() -> tether_sync::Result<()> {
//! let config = Config::default();
//! let remote = Arc::new(HttpRemote::new("https://api.example.com", config.request_timeout)?);
//! let connectivity = ConnectivityMonitor::spawn(true, config.stability_window);
//!
//! let sync = SyncOrchestrator::new(Components {
//!     config,
//!     schema: Schema::dashboard(),
//!     resolver: ConflictResolver::default(),
//!     storage: Arc::new(MemoryStorage::new()),
//!     remote,
//!     connectivity,
//!     clock: Arc::new(RuntimeClock::new()),
//!     events: EventBus::default(),
//! });
//!
//! sync.ensure_initialized().await?;
//! let report = sync.start_incremental_sync().await?;
//! println!("replayed {} actions", report.completed);
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod events;
pub mod gateway;
pub mod local_store;
pub mod offline_queue;
pub mod orchestrator;
pub mod remote;
pub mod storage;

pub use clock::RuntimeClock;
pub use config::{Config, ConfigError};
pub use connectivity::{ConnectivityMonitor, Subscription};
pub use error::{RemoteError, Result, StorageError, SyncError};
pub use events::{EventBus, RetryAction, SyncEvent};
pub use gateway::{Gateway, WriteOutcome};
pub use local_store::{AppliedChanges, LocalStore};
pub use offline_queue::OfflineQueue;
pub use orchestrator::{Components, SyncOrchestrator, SyncReport};
pub use remote::{ChangeSet, HttpRemote, Remote, RemoteRequest, Tombstone, IDEMPOTENCY_HEADER};
pub use storage::{FileStorage, MemoryStorage, Storage};
