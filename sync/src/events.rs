//! Typed notifications for the UI layer.
//!
//! The core publishes [`SyncEvent`]s on an [`EventBus`]; the UI subscribes and
//! renders them. Nothing in the core calls into UI code.

use serde::{Deserialize, Serialize};
use tether_engine::{ActionId, ActionKind, Module, RecordId, Resolution};
use tokio::sync::broadcast;

/// Events buffered per subscriber before the slowest one starts lagging.
const DEFAULT_CAPACITY: usize = 256;

/// What a "retry" button should do. Handed back to
/// [`SyncOrchestrator::retry`](crate::SyncOrchestrator::retry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "actionId", rename_all = "snake_case")]
pub enum RetryAction {
    Initialize,
    Sync,
    Action(ActionId),
}

/// A notification from the sync core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    SyncStarted,
    SyncCompleted {
        completed: usize,
        failed: usize,
        pulled: usize,
        conflicts: usize,
        duration_ms: u64,
    },
    SyncFailed {
        error: String,
        retry: RetryAction,
    },
    ActionEnqueued {
        action_id: ActionId,
        kind: ActionKind,
        module: Module,
        record_id: RecordId,
    },
    ActionRetrying {
        action_id: ActionId,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    ActionFailed {
        action_id: ActionId,
        module: Module,
        record_id: RecordId,
        error: String,
        /// Rejected outright rather than out of attempts
        permanent: bool,
        retry: RetryAction,
    },
    ConflictResolved {
        module: Module,
        record_id: RecordId,
        outcome: Resolution,
    },
    InitializationFailed {
        error: String,
        retry: RetryAction,
    },
    ConnectivityChanged {
        online: bool,
    },
}

/// Broadcast channel of [`SyncEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// Publish to current subscribers. Events with no subscriber are dropped.
    pub fn publish(&self, event: SyncEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("sync event published with no subscribers");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
