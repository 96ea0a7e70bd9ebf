//! Optimistic-write entry point for the UI.
//!
//! Every write lands in the [`LocalStore`] first. Online, it is then sent
//! straight to the remote; offline (or when older mutations for the same
//! record are still queued) it is appended to the [`OfflineQueue`] instead.
//! Nothing reaches the remote while offline except through the queue.
//!
//! Writes to one record take turns: the next one starts only after the
//! previous one was accepted, queued or rejected, so a slow send that falls
//! back to the queue can never land behind a newer write.

use crate::connectivity::ConnectivityMonitor;
use crate::error::{RemoteError, Result};
use crate::events::{EventBus, RetryAction, SyncEvent};
use crate::local_store::LocalStore;
use crate::offline_queue::OfflineQueue;
use crate::remote::{Remote, RemoteRequest};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tether_engine::{ActionId, Fields, Module, Mutation, Record, RecordKey};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// What happened to the remote side of a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Accepted by the remote
    Synced,
    /// Queued for replay
    Queued(ActionId),
    /// Refused by the remote; parked as a failed entry for manual retry
    Rejected { action_id: ActionId, error: String },
}

/// One lock per record with a write in progress.
#[derive(Debug, Default)]
struct RecordLocks {
    locks: DashMap<RecordKey, Arc<Mutex<()>>>,
}

impl RecordLocks {
    async fn acquire(self: &Arc<Self>, key: RecordKey) -> RecordTurn {
        let lock = self.locks.entry(key.clone()).or_default().value().clone();
        let guard = lock.lock_owned().await;
        RecordTurn {
            locks: Arc::clone(self),
            key,
            guard: Some(guard),
        }
    }
}

/// Exclusive turn at writing one record. Unused locks are dropped from the
/// map on release.
struct RecordTurn {
    locks: Arc<RecordLocks>,
    key: RecordKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for RecordTurn {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[derive(Debug, Clone)]
pub struct Gateway {
    store: Arc<LocalStore>,
    queue: Arc<OfflineQueue>,
    connectivity: Arc<ConnectivityMonitor>,
    remote: Arc<dyn Remote>,
    events: EventBus,
    request_timeout: Duration,
    turns: Arc<RecordLocks>,
}

impl Gateway {
    pub fn new(
        store: Arc<LocalStore>,
        queue: Arc<OfflineQueue>,
        connectivity: Arc<ConnectivityMonitor>,
        remote: Arc<dyn Remote>,
        events: EventBus,
        request_timeout: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            connectivity,
            remote,
            events,
            request_timeout,
            turns: Arc::default(),
        }
    }

    pub async fn create(&self, module: Module, fields: Fields) -> Result<(Record, WriteOutcome)> {
        let record = self.store.create(module, fields).await?;
        let _turn = self
            .turns
            .acquire(RecordKey::new(module, record.id.clone()))
            .await;
        let outcome = self.submit(Mutation::create(&record)?).await?;
        Ok((record, outcome))
    }

    pub async fn update(
        &self,
        module: Module,
        id: &str,
        patch: &Fields,
    ) -> Result<(Record, WriteOutcome)> {
        let _turn = self.turns.acquire(RecordKey::new(module, id)).await;
        let record = self.store.update(module, id, patch).await?;
        let outcome = self.submit(Mutation::update(module, id, patch)?).await?;
        Ok((record, outcome))
    }

    pub async fn delete(&self, module: Module, id: &str) -> Result<WriteOutcome> {
        let _turn = self.turns.acquire(RecordKey::new(module, id)).await;
        self.store.remove(module, id).await?;
        self.submit(Mutation::delete(module, id)).await
    }

    async fn submit(&self, mutation: Mutation) -> Result<WriteOutcome> {
        let key = mutation.key();
        if !self.connectivity.is_online() || self.queue.holds(&key).await {
            let id = self.queue.enqueue(mutation).await?;
            return Ok(WriteOutcome::Queued(id));
        }

        let sent = match RemoteRequest::for_mutation(self.store.schema(), &mutation) {
            Ok(request) => {
                match tokio::time::timeout(self.request_timeout, self.remote.send(&request)).await
                {
                    Ok(result) => result,
                    Err(_) => Err(RemoteError::Timeout(self.request_timeout)),
                }
            }
            Err(e) => Err(e),
        };

        match sent {
            Ok(()) => {
                tracing::debug!(module = %key.module, record_id = %key.id, "write synced");
                Ok(WriteOutcome::Synced)
            }
            Err(e) if e.is_retryable() => {
                tracing::debug!(module = %key.module, record_id = %key.id, error = %e, "direct write failed, queueing");
                let id = self.queue.enqueue(mutation).await?;
                Ok(WriteOutcome::Queued(id))
            }
            Err(e) => {
                let error = e.to_string();
                let action_id = self.queue.enqueue_rejected(mutation, error.clone()).await?;
                tracing::warn!(
                    action_id,
                    module = %key.module,
                    record_id = %key.id,
                    error = %error,
                    "write rejected by remote"
                );
                self.events.publish(SyncEvent::ActionFailed {
                    action_id,
                    module: key.module,
                    record_id: key.id,
                    error: error.clone(),
                    permanent: true,
                    retry: RetryAction::Action(action_id),
                });
                Ok(WriteOutcome::Rejected { action_id, error })
            }
        }
    }
}
